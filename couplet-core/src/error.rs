use thiserror::Error;

/// Failures the decoder classifies itself. Everything else (tensor ops, IO)
/// travels through `anyhow` untouched.
#[derive(Debug, Error)]
pub enum CoupletError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("vocabulary error: {0}")]
    Vocab(String),
}

impl CoupletError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn shape(what: &'static str, expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
        Self::ShapeMismatch {
            what,
            expected: format!("{expected:?}"),
            actual: format!("{actual:?}"),
        }
    }
}
