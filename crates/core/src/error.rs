use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("selection failed: {message}")]
    Selection { message: String },

    #[error("failed to read {path:?}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("upload failed: {message}")]
    Transfer { message: String },

    #[error("progress relay error: {message}")]
    Relay { message: String },
}

impl Error {
    /// Human-readable reason carried into a failed task.
    ///
    /// Transport and server messages pass through verbatim.
    pub fn reason(&self) -> String {
        match self {
            Self::Transfer { message } => message.clone(),
            other => other.to_string(),
        }
    }
}
