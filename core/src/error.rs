use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(String),

    #[error("Invalid backup name: {name}")]
    InvalidBackupName { name: String },

    #[error("Backup already exists: {name}")]
    BackupExists { name: String },

    #[error("Backup not found: {name}")]
    BackupNotFound { name: String },

    #[error("Malformed metadata on {key}: {value}")]
    Metadata { key: String, value: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the "object does not exist" case, which several commands
    /// treat as an expected precondition rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
