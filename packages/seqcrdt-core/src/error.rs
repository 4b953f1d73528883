use thiserror::Error;

use crate::ids::ReplicaId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("index out of bounds: {index} (length: {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("unknown position: {0}")]
    UnknownPosition(String),
    #[error("counter out of order for sender {sender}: expected {expected}, got {got}")]
    OutOfOrderCounter {
        sender: ReplicaId,
        expected: u64,
        got: u64,
    },
    #[error("slot out of order: expected {expected}, got {got}")]
    OutOfOrderSlot { expected: i64, got: i64 },
    #[error("malformed parent: {0}")]
    MalformedParent(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("decode error: {0}")]
    Decode(String),
}
