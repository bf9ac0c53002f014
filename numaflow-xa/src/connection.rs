//! The boundary to the database's distributed transaction manager.
//!
//! Drivers translate their native failures (SQLSTATEs, XA error codes, I/O errors) into an
//! [XaFault] exactly once, here. Everything above this module decides on retries and outcomes
//! by matching on the enumeration and never looks at the driver's error text.

use std::future::Future;
use std::time::Duration;

use crate::statement::Value;
use crate::xid::TransactionId;

/// Classified failure of a call into the transaction manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XaFault {
    /// The backend has no record of the branch (`XAER_NOTA`).
    #[error("transaction unknown to the backend")]
    UnknownTransaction,

    /// The call may succeed if repeated on the same connection: lock timeout, deadlock, busy.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The physical connection is gone and must be replaced before the next call.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Anything else. Not retried.
    #[error("backend error: {0}")]
    Fatal(String),
}

impl XaFault {
    pub fn is_retryable(&self) -> bool {
        matches!(self, XaFault::Transient(_) | XaFault::ConnectionLost(_))
    }
}

pub type XaResult<T> = Result<T, XaFault>;

/// Result of the first phase of 2PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// The branch is durably prepared and waits for commit or rollback.
    Prepared,
    /// The branch did not modify anything and is already finished (`XA_RDONLY`); it must not be
    /// committed.
    ReadOnly,
}

/// A physical connection able to drive transaction branches.
///
/// `commit`, `rollback` and `recover` address branches by id and must work on any connection,
/// not only the one that began the branch; recovery after a restart depends on it.
#[trait_variant::make(XaConnection: Send)]
pub trait LocalXaConnection {
    /// Start the branch and associate it with this connection.
    async fn begin(&mut self, xid: &TransactionId, timeout: Option<Duration>) -> XaResult<()>;

    /// Execute `sql` once per parameter row inside the associated branch.
    async fn execute_batch(&mut self, sql: &str, rows: &[Vec<Value>]) -> XaResult<u64>;

    /// End the association with the branch and prepare it.
    async fn prepare(&mut self, xid: &TransactionId) -> XaResult<PrepareOutcome>;

    async fn commit(&mut self, xid: &TransactionId) -> XaResult<()>;

    async fn rollback(&mut self, xid: &TransactionId) -> XaResult<()>;

    /// Branches the backend holds in prepared state.
    async fn recover(&mut self) -> XaResult<Vec<TransactionId>>;
}

/// Hands out transactional connections. How they are pooled or re-established is up to the
/// implementation; the sink only asks for a fresh one after a [XaFault::ConnectionLost].
pub trait ConnectionProvider: Send + Sync + 'static {
    type Connection: XaConnection + Send + 'static;

    fn acquire(&self) -> impl Future<Output = XaResult<Self::Connection>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_connection_faults_retry() {
        assert!(XaFault::Transient("deadlock".into()).is_retryable());
        assert!(XaFault::ConnectionLost("reset by peer".into()).is_retryable());
        assert!(!XaFault::UnknownTransaction.is_retryable());
        assert!(!XaFault::Fatal("syntax error".into()).is_retryable());
    }
}
