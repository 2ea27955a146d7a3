//! Error taxonomy shared by every FocusGuard component
//!
//! Every failure inside the core is returned as one of these values; the
//! controller and the CLI decide which ones are fatal for a given operation.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = FocusError> = std::result::Result<T, E>;

/// Top-level FocusGuard errors
#[derive(Error, Debug)]
pub enum FocusError {
    /// The elevated write path to the hosts file is unavailable
    #[error("no write access to {0} - grant passwordless sudo for cp/mv/test or run as root")]
    Permission(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A second open session was requested
    #[error("a focus session is already open (id {0})")]
    Concurrency(i64),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("session {0} not found")]
    NotFound(i64),

    /// Stop or shutdown was requested with nothing running
    #[error("no focus session is running")]
    Idle,

    #[error("session length must be at least one minute")]
    InvalidDuration,

    #[error("password must be at least {min} characters")]
    InvalidPassword { min: usize },
}

/// File or database I/O failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("credential hashing failed: {0}")]
    Hash(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Credential rejections
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong password ({remaining_attempts} attempts left)")]
    WrongPassword { remaining_attempts: u32 },

    #[error("too many failed attempts - locked for {remaining_secs}s")]
    LockedOut { remaining_secs: u64 },

    #[error("no password has been configured")]
    NoCredential,
}

impl From<std::io::Error> for FocusError {
    fn from(err: std::io::Error) -> Self {
        FocusError::Storage(StorageError::Io(err))
    }
}

impl From<rusqlite::Error> for FocusError {
    fn from(err: rusqlite::Error) -> Self {
        FocusError::Storage(StorageError::Database(err))
    }
}

impl FocusError {
    pub fn is_permission(&self) -> bool {
        matches!(self, FocusError::Permission(_))
    }

    /// The credential rejection, if this is one
    pub fn auth(&self) -> Option<&AuthError> {
        match self {
            FocusError::Auth(err) => Some(err),
            _ => None,
        }
    }
}
