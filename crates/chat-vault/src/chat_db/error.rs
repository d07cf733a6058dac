//! Typed errors returned across the store boundary
use thiserror::Error;

use crate::chat_db::migration::MigrationReport;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("sqlite error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema migration failed\n{0}")]
    Migration(Box<MigrationReport>),
}

/// Coarse classification handed to API callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Serialization,
    Storage,
    Migration,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            StoreError::Serialization(_) => ErrorKind::Serialization,
            StoreError::Storage(_) | StoreError::Pool(_) | StoreError::Io(_) => ErrorKind::Storage,
            StoreError::Migration(_) => ErrorKind::Migration,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
