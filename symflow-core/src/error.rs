use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index error: {0}")]
    Index(String),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Remote feed error: {0}")]
    Remote(String),

    #[error("Media server error: {0}")]
    MediaServer(String),

    #[error("Path not under monitored root: {0}")]
    OutsideRoot(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Index(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::MediaServer(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
