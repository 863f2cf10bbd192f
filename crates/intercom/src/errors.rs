use thiserror::Error;

/// Structured errors surfaced across the UI/background boundary.
///
/// Everything else travels as an `eyre::Report`; callers that need to branch on a
/// failure downcast to this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntercomError {
    #[error("Invalid response received: {0}")]
    InvalidResponse(String),

    #[error("background error: {0}")]
    Background(String),

    #[error("connection to background closed")]
    ConnectionClosed,

    #[error("queued task aborted before completing")]
    TaskAborted,

    #[error("wallet not initialized")]
    NotInitialized,

    #[error("wallet already initialized")]
    AlreadyInitialized,

    #[error("wallet locked")]
    Locked,

    #[error("invalid password")]
    InvalidPassword,

    #[error("invalid mnemonic")]
    InvalidMnemonic,

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("cannot remove the last account")]
    LastAccount,

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl IntercomError {
    /// Stable machine-readable code, carried in daemon error frames.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidResponse(_) => "invalid_response",
            Self::Background(_) => "background_error",
            Self::ConnectionClosed => "connection_closed",
            Self::TaskAborted => "task_aborted",
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::Locked => "locked",
            Self::InvalidPassword => "invalid_password",
            Self::InvalidMnemonic => "invalid_mnemonic",
            Self::AccountNotFound(_) => "account_not_found",
            Self::LastAccount => "last_account",
            Self::Unauthorized => "unauthorized",
            Self::InvalidRequest(_) => "invalid_request",
        }
    }

    /// The variant's payload, sent next to the code so the client can rebuild it.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::InvalidResponse(d)
            | Self::Background(d)
            | Self::AccountNotFound(d)
            | Self::InvalidRequest(d) => Some(d),
            Self::ConnectionClosed
            | Self::TaskAborted
            | Self::NotInitialized
            | Self::AlreadyInitialized
            | Self::Locked
            | Self::InvalidPassword
            | Self::InvalidMnemonic
            | Self::LastAccount
            | Self::Unauthorized => None,
        }
    }

    /// Rebuild an error received from the daemon. Unknown codes, and failures with no
    /// structured cause, come back as [`IntercomError::Background`].
    pub fn from_wire(code: &str, message: String, detail: Option<String>) -> Self {
        let detail = detail.unwrap_or_else(|| message.clone());
        match code {
            "invalid_response" => Self::InvalidResponse(detail),
            "connection_closed" => Self::ConnectionClosed,
            "task_aborted" => Self::TaskAborted,
            "not_initialized" => Self::NotInitialized,
            "already_initialized" => Self::AlreadyInitialized,
            "locked" => Self::Locked,
            "invalid_password" => Self::InvalidPassword,
            "invalid_mnemonic" => Self::InvalidMnemonic,
            "account_not_found" => Self::AccountNotFound(detail),
            "last_account" => Self::LastAccount,
            "unauthorized" => Self::Unauthorized,
            "invalid_request" => Self::InvalidRequest(detail),
            _ => Self::Background(message),
        }
    }
}
