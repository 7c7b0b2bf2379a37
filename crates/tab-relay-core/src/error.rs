use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("ExtensionNotConnected: no extension is attached to the relay")]
    ExtensionNotConnected,

    #[error("ExtensionRequestTimeout: extension did not reply in time")]
    ExtensionRequestTimeout,

    #[error("ConnectionReplaced: extension connection was superseded")]
    ConnectionReplaced,

    #[error("ExtensionDisconnected: extension connection closed")]
    ExtensionDisconnected,

    #[error("TargetNotFound: {0}")]
    TargetNotFound(String),

    #[error("Client id already connected: {0}")]
    ClientIdInUse(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    /// Error payload surfaced verbatim from the extension.
    #[error("{0}")]
    Extension(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
