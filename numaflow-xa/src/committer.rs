//! Second phase of 2PC.
//!
//! The [Committer] finishes branches prepared by the writers once the checkpoint that carried
//! them is durable. It is shared by all subtasks of a job: every call addresses the branch by id
//! on a freshly acquired connection, so it holds no connection of its own.
//!
//! "Transaction unknown" on commit is treated as success only when the branch is known to come
//! from a writer lineage this committer serves ([Committer::adopt]), or when there is another
//! reason to believe it was committed before: the commitable comes from restored state, an
//! earlier commit attempt may have reached the backend before its reply got lost, or this
//! committer already committed the id. Every other unknown branch is escalated as
//! [Error::CommitAmbiguous].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use backoff::{Retry, RetryError};
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, Settings};
use crate::connection::{ConnectionProvider, XaConnection, XaFault};
use crate::error::{Error, Result};
use crate::metrics::{with_outcome, xa_metrics, xid_labels};
use crate::xid::{TransactionId, XidCodec};

/// Ids remembered as committed, or as possibly committed, by this committer.
const COMMITTED_MEMO_CAPACITY: usize = 4096;

/// A prepared branch waiting for its checkpoint to complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitable {
    pub transaction_id: TransactionId,
    /// Checkpoint whose snapshot prepared the branch.
    pub checkpoint_id: u64,
    /// Replayed from restored state; a previous incarnation may have committed it already.
    pub recovered: bool,
}

impl Commitable {
    pub fn new(transaction_id: TransactionId, checkpoint_id: u64) -> Self {
        Self {
            transaction_id,
            checkpoint_id,
            recovered: false,
        }
    }

    pub fn recovered(transaction_id: TransactionId, checkpoint_id: u64) -> Self {
        Self {
            transaction_id,
            checkpoint_id,
            recovered: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The backend did not know the branch, and it is known to have been committed before.
    AlreadyCommitted,
}

impl CommitOutcome {
    fn as_label(self) -> &'static str {
        match self {
            CommitOutcome::Committed => "committed",
            CommitOutcome::AlreadyCommitted => "already_committed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackOutcome {
    RolledBack,
    /// The backend had no record of the branch: never prepared, or already finished.
    Absent,
}

impl RollbackOutcome {
    fn as_label(self) -> &'static str {
        match self {
            RollbackOutcome::RolledBack => "rolled_back",
            RollbackOutcome::Absent => "absent",
        }
    }
}

/// Result of [Committer::commit_all].
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed: Vec<(Commitable, CommitOutcome)>,
    pub failed: Vec<(Commitable, Error)>,
    /// Not attempted because an earlier checkpoint of the same subtask failed.
    pub deferred: Vec<(Commitable, Error)>,
}

impl CommitReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }

    pub fn committed_ids(&self) -> Vec<TransactionId> {
        self.committed
            .iter()
            .map(|(c, _)| c.transaction_id.clone())
            .collect()
    }

    /// Everything that still has to be committed.
    pub fn pending(&self) -> Vec<Commitable> {
        self.failed
            .iter()
            .chain(self.deferred.iter())
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.failed.iter().map(|(_, e)| e)
    }
}

/// Bounded FIFO set.
struct CommittedMemo {
    order: VecDeque<TransactionId>,
    ids: HashSet<TransactionId>,
    capacity: usize,
}

impl CommittedMemo {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, xid: TransactionId) {
        if !self.ids.insert(xid.clone()) {
            return;
        }
        self.order.push_back(xid);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }

    fn contains(&self, xid: &TransactionId) -> bool {
        self.ids.contains(xid)
    }
}

pub struct Committer<P> {
    provider: Arc<P>,
    max_commit_attempts: u16,
    retry: RetryConfig,
    committed: Mutex<CommittedMemo>,
    /// Ids whose commit failed in a way that may have reached the backend.
    maybe_committed: Mutex<CommittedMemo>,
    /// Global parts of the writer lineages this committer serves.
    lineages: Mutex<HashSet<Bytes>>,
    cancel: CancellationToken,
}

impl<P> Committer<P>
where
    P: ConnectionProvider,
{
    /// `cancel` interrupts the retry cool-offs; a cancelled commit fails with
    /// [Error::CommitExhausted] and stays pending.
    pub fn new(provider: Arc<P>, settings: &Settings, cancel: CancellationToken) -> Self {
        Self {
            provider,
            max_commit_attempts: settings.exactly_once.max_commit_attempts.max(1),
            retry: settings.retry.clone(),
            committed: Mutex::new(CommittedMemo::new(COMMITTED_MEMO_CAPACITY)),
            maybe_committed: Mutex::new(CommittedMemo::new(COMMITTED_MEMO_CAPACITY)),
            lineages: Mutex::new(HashSet::new()),
            cancel,
        }
    }

    /// Serve the writer lineage of `codec`: its branches are only ever prepared by that writer,
    /// so one the backend no longer knows has been committed already.
    pub fn adopt(&self, codec: &XidCodec) {
        self.lineages.lock().insert(codec.global_part().clone());
    }

    fn owns(&self, xid: &TransactionId) -> bool {
        self.lineages.lock().contains(xid.global_part())
    }

    pub async fn commit(&self, commitable: &Commitable) -> Result<CommitOutcome> {
        let xid = &commitable.transaction_id;
        let labels = xid_labels(xid);
        let start = Instant::now();
        let provider = &self.provider;

        let result = Retry::new(
            self.retry.backoff(self.max_commit_attempts - 1),
            move || async move {
                match provider.acquire().await {
                    Ok(mut conn) => conn.commit(xid).await,
                    Err(fault) => Err(fault),
                }
            },
            |fault: &XaFault| {
                // the commit may have been applied before the connection went away
                if matches!(fault, XaFault::ConnectionLost(_)) {
                    self.maybe_committed.lock().insert(xid.clone());
                }
                if fault.is_retryable() {
                    warn!(?xid, ?fault, "Commit failed, retrying");
                }
                fault.is_retryable()
            },
        )
        .cancel_on(self.cancel.clone())
        .run()
        .await;

        xa_metrics()
            .commit_time
            .get_or_create(&labels)
            .observe(start.elapsed().as_micros() as f64);

        let outcome = match result {
            Ok(()) => {
                debug!(?xid, checkpoint_id = commitable.checkpoint_id, "Committed branch");
                self.committed.lock().insert(xid.clone());
                Ok(CommitOutcome::Committed)
            }
            Err(RetryError::Permanent {
                error: XaFault::UnknownTransaction,
                attempts,
            }) => {
                let lineage = self.owns(xid);
                let lost_reply = attempts > 1 || self.maybe_committed.lock().contains(xid);
                if lineage
                    || commitable.recovered
                    || lost_reply
                    || self.committed.lock().contains(xid)
                {
                    info!(
                        ?xid,
                        lineage,
                        recovered = commitable.recovered,
                        lost_reply,
                        attempts,
                        "Branch unknown to the backend, treating it as already committed"
                    );
                    Ok(CommitOutcome::AlreadyCommitted)
                } else {
                    error!(
                        ?xid,
                        checkpoint_id = commitable.checkpoint_id,
                        "Branch of an unknown lineage is unknown to the backend on commit, manual verification required"
                    );
                    Err(Error::CommitAmbiguous { xid: xid.clone() })
                }
            }
            Err(RetryError::Permanent { error, .. }) => {
                error!(?xid, fault = ?error, "Commit failed with a non-retryable error");
                Err(Error::Backend {
                    xid: xid.clone(),
                    fault: error,
                })
            }
            Err(e) => {
                let attempts = e.attempts();
                let fault = e.into_inner();
                error!(?xid, attempts, ?fault, "Giving up on commit, it stays pending");
                Err(Error::CommitExhausted {
                    xid: xid.clone(),
                    attempts,
                    fault,
                })
            }
        };

        let label = match &outcome {
            Ok(o) => o.as_label(),
            Err(_) => "failed",
        };
        xa_metrics()
            .commits
            .get_or_create(&with_outcome(&labels, label))
            .inc();
        outcome
    }

    /// Commit a set of commitables, possibly from several subtasks.
    ///
    /// Subtasks are committed concurrently. Within one subtask the commitables go in checkpoint
    /// order and the first failure defers the rest, so a later checkpoint never becomes visible
    /// ahead of an earlier one.
    pub async fn commit_all(&self, commitables: Vec<Commitable>) -> CommitReport {
        let mut groups: BTreeMap<Bytes, Vec<Commitable>> = BTreeMap::new();
        for commitable in commitables {
            groups
                .entry(commitable.transaction_id.global_part().clone())
                .or_default()
                .push(commitable);
        }

        let results = join_all(groups.into_values().map(|mut group| {
            group.sort_by(|a, b| {
                a.checkpoint_id
                    .cmp(&b.checkpoint_id)
                    .then_with(|| a.transaction_id.cmp(&b.transaction_id))
            });
            group.dedup_by(|a, b| a.transaction_id == b.transaction_id);
            self.commit_in_order(group)
        }))
        .await;

        results
            .into_iter()
            .fold(CommitReport::default(), |mut report, group| {
                report.committed.extend(group.committed);
                report.failed.extend(group.failed);
                report.deferred.extend(group.deferred);
                report
            })
    }

    async fn commit_in_order(&self, group: Vec<Commitable>) -> CommitReport {
        let mut report = CommitReport::default();
        let mut blocked_by: Option<TransactionId> = None;

        for commitable in group {
            if let Some(blocker) = &blocked_by {
                let err = Error::CommitDeferred {
                    xid: commitable.transaction_id.clone(),
                    blocked_by: blocker.clone(),
                };
                report.deferred.push((commitable, err));
                continue;
            }
            match self.commit(&commitable).await {
                Ok(outcome) => report.committed.push((commitable, outcome)),
                Err(e) => {
                    blocked_by = Some(commitable.transaction_id.clone());
                    report.failed.push((commitable, e));
                }
            }
        }
        report
    }

    /// Roll back a branch whose outcome is unknown. Used to resolve hanging branches and orphans.
    pub async fn rollback(&self, xid: &TransactionId) -> Result<RollbackOutcome> {
        let provider = &self.provider;
        let result = Retry::new(
            self.retry.backoff(self.retry.max_retry_attempts),
            move || async move {
                match provider.acquire().await {
                    Ok(mut conn) => conn.rollback(xid).await,
                    Err(fault) => Err(fault),
                }
            },
            |fault: &XaFault| fault.is_retryable(),
        )
        .cancel_on(self.cancel.clone())
        .run()
        .await;

        let outcome = match result {
            Ok(()) => Ok(RollbackOutcome::RolledBack),
            Err(RetryError::Permanent {
                error: XaFault::UnknownTransaction,
                ..
            }) => Ok(RollbackOutcome::Absent),
            Err(e) => Err(Error::Rollback {
                xid: xid.clone(),
                attempts: e.attempts(),
                fault: e.into_inner(),
            }),
        };

        let label = match &outcome {
            Ok(o) => o.as_label(),
            Err(_) => "failed",
        };
        xa_metrics()
            .rollbacks
            .get_or_create(&with_outcome(&xid_labels(xid), label))
            .inc();
        outcome
    }

    /// Branches the backend currently holds in prepared state, of any writer.
    pub async fn recover_prepared(&self) -> Result<Vec<TransactionId>> {
        let provider = &self.provider;
        Retry::new(
            self.retry.backoff(self.retry.max_retry_attempts),
            move || async move {
                match provider.acquire().await {
                    Ok(mut conn) => conn.recover().await,
                    Err(fault) => Err(fault),
                }
            },
            |fault: &XaFault| fault.is_retryable(),
        )
        .cancel_on(self.cancel.clone())
        .run()
        .await
        .map_err(|e| Error::Connection(e.into_inner()))
    }
}
