use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QuiverError>;

#[derive(Debug, Error)]
pub enum QuiverError {
    /// Statement could not be parsed or bound. Recoverable; the statement
    /// is rejected and the connection stays usable.
    #[error("binder error: {0}")]
    Binder(String),
    /// Query aborted mid-execution (division by zero, out-of-range cast,
    /// list index out of range, duplicate primary key).
    #[error("runtime error: {0}")]
    Runtime(String),
    /// A second write transaction was requested while one is active.
    #[error("write-write conflict: another write transaction is active")]
    WriteConflict,
    /// Commit or rollback on a transaction that already terminated.
    #[error("transaction {0} has already been committed or rolled back")]
    TransactionFinalized(crate::types::TxId),
    /// Commit/rollback issued with no active transaction on the connection.
    #[error("no active transaction")]
    NotActive,
    /// Commit gave up waiting for concurrent readers to finish.
    #[error("timed out waiting for read transactions to finish")]
    CheckpointWaitTimeout,
    /// Every buffer frame is pinned; the pin request cannot be served.
    #[error("buffer pool exhausted: all frames pinned")]
    BufferFull,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// On-disk state failed validation. Fatal: the database is marked
    /// read-only until repaired.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Query cancelled through the interrupt flag.
    #[error("query interrupted")]
    Interrupted,
    /// Broken engine invariant. Always fatal.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QuiverError {
    /// Errors that poison the database handle rather than one statement.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QuiverError::Corruption(_) | QuiverError::Internal(_))
    }
}
