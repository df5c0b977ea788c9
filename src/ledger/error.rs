use thiserror::Error;
use ulid::Ulid;

use crate::records::RecordError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("slot {slot} is {state}")]
    SlotUnavailable { slot: Ulid, state: &'static str },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{0} is still referenced")]
    InUse(Ulid),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl From<RecordError> for LedgerError {
    fn from(e: RecordError) -> Self {
        LedgerError::Validation(e.to_string())
    }
}
