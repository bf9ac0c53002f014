//! An in-memory transaction manager with fault injection, used by the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{RetryConfig, Settings};
use crate::connection::{ConnectionProvider, PrepareOutcome, XaConnection, XaFault, XaResult};
use crate::statement::{QueryStatement, Value};
use crate::xid::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Op {
    Acquire,
    Begin,
    Execute,
    Prepare,
    Commit,
    Rollback,
    Recover,
}

/// A fault returned by the next call of an [Op].
#[derive(Debug, Clone)]
pub(crate) enum Injected {
    /// Fail without touching the backend.
    Before(XaFault),
    /// Apply the call, then report the fault anyway (the reply got lost).
    After(XaFault),
}

#[derive(Default)]
struct Inner {
    active: HashMap<TransactionId, Vec<Vec<Value>>>,
    prepared: BTreeMap<TransactionId, Vec<Vec<Value>>>,
    committed: Vec<(TransactionId, Vec<Vec<Value>>)>,
    rolled_back: Vec<TransactionId>,
    faults: HashMap<Op, VecDeque<Injected>>,
    calls: HashMap<Op, usize>,
}

impl Inner {
    fn next_fault(&mut self, op: Op) -> Option<Injected> {
        *self.calls.entry(op).or_default() += 1;
        self.faults.get_mut(&op).and_then(VecDeque::pop_front)
    }
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn provider(&self) -> MemoryProvider {
        MemoryProvider {
            backend: self.clone(),
        }
    }

    /// Queue `fault` for the next call of `op`. Faults queued for the same op fire in order.
    pub(crate) fn inject(&self, op: Op, fault: Injected) {
        self.inner
            .lock()
            .faults
            .entry(op)
            .or_default()
            .push_back(fault);
    }

    pub(crate) fn calls(&self, op: Op) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or_default()
    }

    pub(crate) fn committed_ids(&self) -> Vec<TransactionId> {
        self.inner
            .lock()
            .committed
            .iter()
            .map(|(xid, _)| xid.clone())
            .collect()
    }

    /// Every committed row, in commit order.
    pub(crate) fn committed_rows(&self) -> Vec<Vec<Value>> {
        self.inner
            .lock()
            .committed
            .iter()
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect()
    }

    pub(crate) fn prepared_ids(&self) -> Vec<TransactionId> {
        self.inner.lock().prepared.keys().cloned().collect()
    }

    pub(crate) fn active_ids(&self) -> Vec<TransactionId> {
        self.inner.lock().active.keys().cloned().collect()
    }

    pub(crate) fn rolled_back_ids(&self) -> Vec<TransactionId> {
        self.inner.lock().rolled_back.clone()
    }

    /// Put a prepared branch in place directly, as a crashed predecessor would have left it.
    pub(crate) fn seed_prepared(&self, xid: TransactionId, rows: Vec<Vec<Value>>) {
        self.inner.lock().prepared.insert(xid, rows);
    }
}

#[derive(Clone)]
pub(crate) struct MemoryProvider {
    backend: MemoryBackend,
}

impl ConnectionProvider for MemoryProvider {
    type Connection = MemoryConnection;

    async fn acquire(&self) -> XaResult<MemoryConnection> {
        match self.backend.inner.lock().next_fault(Op::Acquire) {
            Some(Injected::Before(fault) | Injected::After(fault)) => Err(fault),
            None => Ok(MemoryConnection {
                backend: self.backend.clone(),
                associated: None,
                broken: false,
            }),
        }
    }
}

pub(crate) struct MemoryConnection {
    backend: MemoryBackend,
    associated: Option<TransactionId>,
    broken: bool,
}

impl MemoryConnection {
    fn call<T>(
        &mut self,
        op: Op,
        f: impl FnOnce(&mut Inner, &mut Option<TransactionId>) -> XaResult<T>,
    ) -> XaResult<T> {
        if self.broken {
            return Err(XaFault::ConnectionLost("connection is closed".to_string()));
        }
        let mut inner = self.backend.inner.lock();
        let fault = match inner.next_fault(op) {
            None => return f(&mut *inner, &mut self.associated),
            Some(Injected::Before(fault)) => fault,
            Some(Injected::After(fault)) => {
                f(&mut *inner, &mut self.associated)?;
                fault
            }
        };
        if matches!(fault, XaFault::ConnectionLost(_)) {
            // the server drops whatever the session had open
            if let Some(xid) = self.associated.take() {
                inner.active.remove(&xid);
            }
            self.broken = true;
        }
        Err(fault)
    }
}

impl XaConnection for MemoryConnection {
    async fn begin(&mut self, xid: &TransactionId, _timeout: Option<Duration>) -> XaResult<()> {
        self.call(Op::Begin, |inner, associated| {
            if associated.is_some() {
                return Err(XaFault::Fatal("connection already has a branch".to_string()));
            }
            let known = inner.active.contains_key(xid)
                || inner.prepared.contains_key(xid)
                || inner.committed.iter().any(|(c, _)| c == xid);
            if known {
                return Err(XaFault::Fatal(format!("duplicate xid {xid}")));
            }
            inner.active.insert(xid.clone(), Vec::new());
            *associated = Some(xid.clone());
            Ok(())
        })
    }

    async fn execute_batch(&mut self, _sql: &str, rows: &[Vec<Value>]) -> XaResult<u64> {
        self.call(Op::Execute, |inner, associated| {
            let branch = associated
                .as_ref()
                .and_then(|xid| inner.active.get_mut(xid))
                .ok_or_else(|| XaFault::Fatal("no branch associated".to_string()))?;
            branch.extend(rows.iter().cloned());
            Ok(rows.len() as u64)
        })
    }

    async fn prepare(&mut self, xid: &TransactionId) -> XaResult<PrepareOutcome> {
        self.call(Op::Prepare, |inner, associated| {
            if associated.as_ref() == Some(xid) {
                *associated = None;
            }
            let rows = inner
                .active
                .remove(xid)
                .ok_or(XaFault::UnknownTransaction)?;
            if rows.is_empty() {
                return Ok(PrepareOutcome::ReadOnly);
            }
            inner.prepared.insert(xid.clone(), rows);
            Ok(PrepareOutcome::Prepared)
        })
    }

    async fn commit(&mut self, xid: &TransactionId) -> XaResult<()> {
        self.call(Op::Commit, |inner, _| {
            let rows = inner
                .prepared
                .remove(xid)
                .ok_or(XaFault::UnknownTransaction)?;
            inner.committed.push((xid.clone(), rows));
            Ok(())
        })
    }

    async fn rollback(&mut self, xid: &TransactionId) -> XaResult<()> {
        self.call(Op::Rollback, |inner, associated| {
            if associated.as_ref() == Some(xid) {
                *associated = None;
            }
            let existed =
                inner.prepared.remove(xid).is_some() || inner.active.remove(xid).is_some();
            if !existed {
                return Err(XaFault::UnknownTransaction);
            }
            inner.rolled_back.push(xid.clone());
            Ok(())
        })
    }

    async fn recover(&mut self) -> XaResult<Vec<TransactionId>> {
        self.call(Op::Recover, |inner, _| Ok(inner.prepared.keys().cloned().collect()))
    }
}

/// `INSERT INTO books (id, title) VALUES (?, ?)`
pub(crate) struct BookStatement;

impl QueryStatement for BookStatement {
    type Row = (i64, String);

    fn sql(&self) -> &str {
        "INSERT INTO books (id, title) VALUES (?, ?)"
    }

    fn bind(&self, row: &Self::Row) -> Vec<Value> {
        vec![row.0.into(), row.1.as_str().into()]
    }
}

pub(crate) fn book(id: i64) -> (i64, String) {
    (id, format!("book-{id}"))
}

pub(crate) fn book_row(id: i64) -> Vec<Value> {
    BookStatement.bind(&book(id))
}

/// Default settings with millisecond retry intervals.
pub(crate) fn test_settings() -> Settings {
    Settings {
        retry: RetryConfig {
            initial_retry_interval_in_ms: 1,
            max_retry_interval_in_ms: 5,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xid::{JobId, encode};

    #[tokio::test]
    async fn two_phase_lifecycle() {
        let backend = MemoryBackend::new();
        let mut conn = backend.provider().acquire().await.unwrap();
        let xid = encode(&JobId::from_name("J1"), 0, 1, 0);

        conn.begin(&xid, None).await.unwrap();
        conn.execute_batch("", &[book_row(1)]).await.unwrap();
        assert_eq!(conn.prepare(&xid).await.unwrap(), PrepareOutcome::Prepared);
        assert_eq!(conn.recover().await.unwrap(), vec![xid.clone()]);

        // any connection can finish the branch
        let mut other = backend.provider().acquire().await.unwrap();
        other.commit(&xid).await.unwrap();
        assert_eq!(other.commit(&xid).await, Err(XaFault::UnknownTransaction));
        assert_eq!(backend.committed_rows(), vec![book_row(1)]);

        assert!(conn.begin(&xid, None).await.is_err(), "ids are never reused");
    }

    #[tokio::test]
    async fn empty_branch_is_read_only() {
        let backend = MemoryBackend::new();
        let mut conn = backend.provider().acquire().await.unwrap();
        let xid = encode(&JobId::from_name("J1"), 0, 1, 0);
        conn.begin(&xid, None).await.unwrap();
        assert_eq!(conn.prepare(&xid).await.unwrap(), PrepareOutcome::ReadOnly);
        assert!(backend.prepared_ids().is_empty());
    }

    #[tokio::test]
    async fn lost_reply_still_applies_the_call() {
        let backend = MemoryBackend::new();
        let mut conn = backend.provider().acquire().await.unwrap();
        let xid = encode(&JobId::from_name("J1"), 0, 1, 0);
        conn.begin(&xid, None).await.unwrap();
        conn.execute_batch("", &[book_row(1)]).await.unwrap();

        backend.inject(
            Op::Prepare,
            Injected::After(XaFault::ConnectionLost("reset".into())),
        );
        assert!(matches!(
            conn.prepare(&xid).await,
            Err(XaFault::ConnectionLost(_))
        ));
        assert_eq!(backend.prepared_ids(), vec![xid.clone()]);
        assert!(matches!(
            conn.commit(&xid).await,
            Err(XaFault::ConnectionLost(_))
        ));
    }
}
