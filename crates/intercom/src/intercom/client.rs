use super::{Request, Response, WalletState};
use crate::{errors::IntercomError, keyring::Account};
use eyre::Context as _;
use serde_json::Value;
use std::future::Future;

/// Inter-context channel: deliver one request payload, resolve with the matching reply.
pub trait Transport: Send + Sync {
    fn send(&self, payload: Value) -> impl Future<Output = eyre::Result<Value>> + Send;
}

/// Check that `raw` is a well-formed response of type `expected`.
pub fn validate_response(expected: &str, raw: Value) -> eyre::Result<Response> {
    let Some(ty) = raw.get("type").and_then(Value::as_str) else {
        return Err(IntercomError::InvalidResponse("missing `type` field".into()).into());
    };
    if ty != expected {
        return Err(
            IntercomError::InvalidResponse(format!("expected {expected}, got {ty}")).into(),
        );
    }
    serde_json::from_value(raw)
        .map_err(|e| IntercomError::InvalidResponse(format!("malformed {expected}: {e}")).into())
}

fn unexpected(r: &Response) -> eyre::Report {
    IntercomError::InvalidResponse(format!("unexpected {}", r.type_name())).into()
}

/// UI-side handle on the background context.
#[derive(Debug)]
pub struct IntercomClient<T> {
    transport: T,
}

impl<T: Transport> IntercomClient<T> {
    pub const fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn request(&self, req: Request) -> eyre::Result<Response> {
        let expected = req.response_type();
        let payload = serde_json::to_value(&req).context("encode request")?;
        drop(req);
        let raw = self.transport.send(payload).await?;
        validate_response(expected, raw)
    }

    pub async fn state(&self) -> eyre::Result<WalletState> {
        let r = self.request(Request::GetStateRequest).await?;
        let Response::GetStateResponse { state } = r else {
            return Err(unexpected(&r));
        };
        Ok(state)
    }

    pub async fn new_wallet(
        &self,
        password: String,
        mnemonic: Option<String>,
    ) -> eyre::Result<Option<String>> {
        let r = self
            .request(Request::NewWalletRequest { password, mnemonic })
            .await?;
        let Response::NewWalletResponse { mnemonic } = r else {
            return Err(unexpected(&r));
        };
        Ok(mnemonic)
    }

    pub async fn unlock(&self, password: String) -> eyre::Result<()> {
        self.request(Request::UnlockRequest { password }).await?;
        Ok(())
    }

    pub async fn lock(&self) -> eyre::Result<()> {
        self.request(Request::LockRequest).await?;
        Ok(())
    }

    pub async fn create_account(&self, name: Option<String>) -> eyre::Result<Account> {
        let r = self.request(Request::CreateAccountRequest { name }).await?;
        let Response::CreateAccountResponse { account } = r else {
            return Err(unexpected(&r));
        };
        Ok(account)
    }

    pub async fn rename_account(&self, address: String, name: String) -> eyre::Result<Account> {
        let r = self
            .request(Request::EditAccountNameRequest { address, name })
            .await?;
        let Response::EditAccountNameResponse { account } = r else {
            return Err(unexpected(&r));
        };
        Ok(account)
    }

    pub async fn remove_account(&self, address: String, password: String) -> eyre::Result<()> {
        self.request(Request::RemoveAccountRequest { address, password })
            .await?;
        Ok(())
    }

    pub async fn reveal_public_key(&self, address: String) -> eyre::Result<String> {
        let r = self
            .request(Request::RevealPublicKeyRequest { address })
            .await?;
        let Response::RevealPublicKeyResponse { public_key } = r else {
            return Err(unexpected(&r));
        };
        Ok(public_key)
    }

    pub async fn reveal_mnemonic(&self, password: String) -> eyre::Result<String> {
        let r = self
            .request(Request::RevealMnemonicRequest { password })
            .await?;
        let Response::RevealMnemonicResponse { mnemonic } = r else {
            return Err(unexpected(&r));
        };
        Ok(mnemonic)
    }

    pub async fn sign(&self, address: String, bytes_hex: String) -> eyre::Result<String> {
        let r = self
            .request(Request::SignRequest {
                address,
                bytes: bytes_hex,
            })
            .await?;
        let Response::SignResponse { signature } = r else {
            return Err(unexpected(&r));
        };
        Ok(signature)
    }

    pub async fn reset(&self, password: String) -> eyre::Result<()> {
        self.request(Request::ResetWalletRequest { password })
            .await?;
        Ok(())
    }
}
