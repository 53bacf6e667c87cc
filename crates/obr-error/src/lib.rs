//! Error taxonomy shared across the opsbrain workspace.
//!
//! Every error maps to a stable process exit code so scripted callers can
//! branch on the failure class: 10 config, 20 adapter, 30 database, 40 io,
//! 50 everything else. HTTP handlers map the same kinds onto status codes.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpsError {
    /// Missing/unparseable config or missing required keys.
    #[error("{0}")]
    Config(String),

    /// Source file unreadable or malformed.
    #[error("{0}")]
    Adapter(String),

    /// Index open/SQL failure.
    #[error("{0}")]
    Database(String),

    /// Canonical-log append failure, lock acquisition failure.
    #[error("{0}")]
    Io(String),

    /// Anything else, including client-side failures.
    #[error("{0}")]
    Other(String),
}

impl OpsError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OpsError::Config(_) => 10,
            OpsError::Adapter(_) => 20,
            OpsError::Database(_) => 30,
            OpsError::Io(_) => 40,
            OpsError::Other(_) => 50,
        }
    }
}

impl From<rusqlite::Error> for OpsError {
    fn from(err: rusqlite::Error) -> Self {
        OpsError::Database(format!("SQLite error: {err}"))
    }
}

impl From<io::Error> for OpsError {
    fn from(err: io::Error) -> Self {
        OpsError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OpsError>;
