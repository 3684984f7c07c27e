use std::error::Error as StdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by transports and credential stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid transport input: {message}")]
    InvalidInput { message: String },

    /// The session exists but cannot carry traffic (closed or not yet open).
    #[error("session for device {device_id} is not connected")]
    NotConnected { device_id: String },

    /// The transport backend is not reachable or not configured.
    #[error("transport unavailable: {message}")]
    Unavailable { message: String },

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// The remote side rejected an operation.
    #[error("transport rejected request: {message}")]
    Rejected { message: String },

    #[error("transport operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl std::fmt::Display) -> Self {
        Self::InvalidInput {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn not_connected(device_id: impl Into<String>) -> Self {
        Self::NotConnected {
            device_id: device_id.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn rejected(message: impl std::fmt::Display) -> Self {
        Self::Rejected {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}
