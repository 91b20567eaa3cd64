use thiserror::Error;

/// Error taxonomy shared by every router/supervisor component.
///
/// The HTTP front-end (in `lemonade-server`) maps each variant to a status code and a
/// JSON envelope; this enum intentionally stays transport-agnostic so it can also be
/// returned from the CLI surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("model not found: {0}")]
    NotFound(String),

    #[error("operation not supported by this model: {0}")]
    UnsupportedOperation(String),

    #[error("responses endpoint requires an OGA-family recipe")]
    UnsupportedRecipe,

    #[error("already registered: {0}")]
    Conflict(String),

    #[error("resource in use: {0}")]
    InUse(String),

    #[error("backend failed to become ready: {message}")]
    BackendLoadFailed { message: String },

    #[error("backend returned an error (status {status}): {message}")]
    BackendError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("authentication required")]
    Auth,

    #[error("offline mode: artifact not available locally")]
    Offline,

    /// Internal-only: the caller's client disconnected. Never serialized to a response.
    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Stable machine-readable kind string, used in JSON error envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::UnsupportedOperation(_) => "unsupported_operation",
            CoreError::UnsupportedRecipe => "unsupported_recipe",
            CoreError::Conflict(_) => "conflict",
            CoreError::InUse(_) => "in_use",
            CoreError::BackendLoadFailed { .. } => "backend_load_failed",
            CoreError::BackendError { .. } => "backend_error",
            CoreError::Network(_) => "network",
            CoreError::Auth => "auth",
            CoreError::Offline => "offline",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CoreError::Network(e.to_string())
        } else {
            CoreError::Internal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Validation(e.to_string())
    }
}
