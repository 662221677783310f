use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Delivery wait interrupted: {0}")]
    Interrupted(String),
    #[error("Relay is not connected")]
    NotConnected,
    #[error("Relay task has stopped")]
    Stopped,
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Unsupported backup version {0}")]
    UnsupportedVersion(i64),
    #[error("Invalid backup document: {0}")]
    InvalidDocument(String),
}

#[cfg(feature = "storage")]
impl From<rusqlite::Error> for BackupError {
    fn from(err: rusqlite::Error) -> Self {
        BackupError::Storage(err.to_string())
    }
}
