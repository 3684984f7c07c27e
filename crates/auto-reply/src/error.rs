use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] switchboard_store::Error),

    #[error(transparent)]
    Transport(#[from] switchboard_channels::Error),

    #[error("{message}")]
    Message { message: String },
}

impl switchboard_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

switchboard_common::impl_context!();
