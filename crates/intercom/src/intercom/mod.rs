//! Request/response bridge between UI contexts and the background daemon.
//!
//! Messages are serde enums tagged by `type`. Every `FooRequest` is answered by exactly one
//! `FooResponse`; [`Request::response_type`] encodes that pairing and the client checks it
//! before handing a response back.

pub mod client;
pub mod server;
pub mod transport;

use crate::keyring::Account;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on a single frame line, in bytes.
pub const MAX_FRAME_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletStatus {
    /// No vault has been created yet.
    Idle,
    Locked,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    pub status: WalletStatus,
    /// Only populated while `Ready`.
    #[serde(default)]
    pub accounts: Vec<Account>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    GetStateRequest,
    NewWalletRequest {
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mnemonic: Option<String>,
    },
    UnlockRequest {
        password: String,
    },
    LockRequest,
    CreateAccountRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    EditAccountNameRequest {
        address: String,
        name: String,
    },
    RemoveAccountRequest {
        address: String,
        password: String,
    },
    RevealPublicKeyRequest {
        address: String,
    },
    RevealMnemonicRequest {
        password: String,
    },
    SignRequest {
        address: String,
        /// Hex-encoded message bytes.
        bytes: String,
    },
    ResetWalletRequest {
        password: String,
    },
}

impl Request {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::GetStateRequest => "GetStateRequest",
            Self::NewWalletRequest { .. } => "NewWalletRequest",
            Self::UnlockRequest { .. } => "UnlockRequest",
            Self::LockRequest => "LockRequest",
            Self::CreateAccountRequest { .. } => "CreateAccountRequest",
            Self::EditAccountNameRequest { .. } => "EditAccountNameRequest",
            Self::RemoveAccountRequest { .. } => "RemoveAccountRequest",
            Self::RevealPublicKeyRequest { .. } => "RevealPublicKeyRequest",
            Self::RevealMnemonicRequest { .. } => "RevealMnemonicRequest",
            Self::SignRequest { .. } => "SignRequest",
            Self::ResetWalletRequest { .. } => "ResetWalletRequest",
        }
    }

    /// The only `type` a response to this request may carry.
    pub const fn response_type(&self) -> &'static str {
        match self {
            Self::GetStateRequest => "GetStateResponse",
            Self::NewWalletRequest { .. } => "NewWalletResponse",
            Self::UnlockRequest { .. } => "UnlockResponse",
            Self::LockRequest => "LockResponse",
            Self::CreateAccountRequest { .. } => "CreateAccountResponse",
            Self::EditAccountNameRequest { .. } => "EditAccountNameResponse",
            Self::RemoveAccountRequest { .. } => "RemoveAccountResponse",
            Self::RevealPublicKeyRequest { .. } => "RevealPublicKeyResponse",
            Self::RevealMnemonicRequest { .. } => "RevealMnemonicResponse",
            Self::SignRequest { .. } => "SignResponse",
            Self::ResetWalletRequest { .. } => "ResetWalletResponse",
        }
    }
}

// Requests carry passwords and mnemonics; never print their fields.
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    GetStateResponse {
        state: WalletState,
    },
    NewWalletResponse {
        /// Present only when the background generated the mnemonic.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mnemonic: Option<String>,
    },
    UnlockResponse,
    LockResponse,
    CreateAccountResponse {
        account: Account,
    },
    EditAccountNameResponse {
        account: Account,
    },
    RemoveAccountResponse,
    RevealPublicKeyResponse {
        public_key: String,
    },
    RevealMnemonicResponse {
        mnemonic: String,
    },
    SignResponse {
        signature: String,
    },
    ResetWalletResponse,
}

impl Response {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::GetStateResponse { .. } => "GetStateResponse",
            Self::NewWalletResponse { .. } => "NewWalletResponse",
            Self::UnlockResponse => "UnlockResponse",
            Self::LockResponse => "LockResponse",
            Self::CreateAccountResponse { .. } => "CreateAccountResponse",
            Self::EditAccountNameResponse { .. } => "EditAccountNameResponse",
            Self::RemoveAccountResponse => "RemoveAccountResponse",
            Self::RevealPublicKeyResponse { .. } => "RevealPublicKeyResponse",
            Self::RevealMnemonicResponse { .. } => "RevealMnemonicResponse",
            Self::SignResponse { .. } => "SignResponse",
            Self::ResetWalletResponse => "ResetWalletResponse",
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// One line sent by a client. `auth` is checked on the first frame of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    pub request: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
    /// Payload of the structured error, when it has one (e.g. the missing address).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One line sent by the daemon, answering the client frame with the same `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FrameError>,
}

impl ServerFrame {
    pub const fn ok(id: u64, response: Value) -> Self {
        Self {
            id,
            response: Some(response),
            error: None,
        }
    }

    pub fn err(id: u64, e: &eyre::Report) -> Self {
        let known = e.downcast_ref::<crate::errors::IntercomError>();
        Self {
            id,
            response: None,
            error: Some(FrameError {
                code: known
                    .map_or("internal_error", crate::errors::IntercomError::code)
                    .to_owned(),
                message: format!("{e:#}"),
                detail: known.and_then(|k| k.detail()).map(str::to_owned),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_are_tagged_by_type() -> eyre::Result<()> {
        let v = serde_json::to_value(Request::SignRequest {
            address: "ed01".into(),
            bytes: "beef".into(),
        })?;
        assert_eq!(
            v,
            json!({"type": "SignRequest", "address": "ed01", "bytes": "beef"})
        );
        let unit = serde_json::to_value(Request::GetStateRequest)?;
        assert_eq!(unit, json!({"type": "GetStateRequest"}));
        Ok(())
    }

    #[test]
    fn each_request_names_its_own_response() -> eyre::Result<()> {
        let reqs = [
            Request::GetStateRequest,
            Request::LockRequest,
            Request::CreateAccountRequest { name: None },
            Request::ResetWalletRequest {
                password: "x".into(),
            },
        ];
        for r in reqs {
            let expected = r.type_name().replace("Request", "Response");
            assert_eq!(r.response_type(), expected);
        }
        Ok(())
    }

    #[test]
    fn debug_output_hides_secrets() {
        let r = Request::UnlockRequest {
            password: "hunter2".into(),
        };
        assert_eq!(format!("{r:?}"), "UnlockRequest");
    }

    #[test]
    fn error_frame_carries_structured_code() {
        let e = eyre::Report::new(crate::errors::IntercomError::Locked);
        let f = ServerFrame::err(3, &e);
        assert_eq!(f.error.map(|x| x.code), Some("locked".to_owned()));

        let missing = eyre::Report::new(crate::errors::IntercomError::AccountNotFound(
            "ed42".into(),
        ))
        .wrap_err("sign");
        let f = ServerFrame::err(4, &missing);
        let err = f.error.unwrap_or_else(|| FrameError {
            code: String::new(),
            message: String::new(),
            detail: None,
        });
        assert_eq!(err.code, "account_not_found");
        assert_eq!(err.detail.as_deref(), Some("ed42"));
        assert!(err.message.starts_with("sign: "));
    }
}
