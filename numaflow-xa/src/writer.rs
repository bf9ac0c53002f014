//! First phase of 2PC for one subtask.
//!
//! The [XaWriter] executes rows inside the branch of the current epoch and prepares that branch
//! when the host takes a snapshot. It never commits: prepared branches are handed out as
//! [Commitable]s and finished by the [Committer](crate::committer::Committer) once the checkpoint
//! is durable.
//!
//! ```text
//!            write             prepare_snapshot
//!   Idle ──────────> Buffering ────────────────> Preparing ──> Snapshotted
//!                        ^                           │              │
//!                        └───────────────────────────┴──────────────┘
//!                                          write
//!
//!   execute failure ──> Failed          close ──> Closed
//! ```
//!
//! Branches are keyed by epoch, the checkpoint the branch is expected to close. A branch begun
//! while the snapshot is being taken uses the checkpoint id itself; one begun ahead of it uses
//! the checkpoint after the last one seen (or the first one announced by the host). When a
//! connection is lost around begin or prepare the branch is abandoned to the hanging list, a
//! fresh connection opens the next sub-branch of the same epoch and the rows executed so far in
//! the epoch are replayed there. A branch id is therefore never begun twice.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::committer::Commitable;
use crate::config::Settings;
use crate::connection::{ConnectionProvider, PrepareOutcome, XaConnection, XaFault};
use crate::error::{Error, Result};
use crate::metrics::{subtask_labels, xa_metrics};
use crate::statement::{QueryStatement, Value};
use crate::xid::{TransactionId, XidCodec, branch_suffix};

pub mod actor;
pub mod state;

pub use state::WriterState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    /// No branch and no rows.
    Idle,
    Buffering,
    Preparing,
    /// The last snapshot is taken and nothing was written since.
    Snapshotted,
    /// An execution failed; rows of the open branch are lost and the writer only answers with
    /// errors.
    Failed,
    Closed,
}

/// What a writer hands to the host at a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: WriterState,
    /// `None` when nothing was written in the epoch.
    pub commitable: Option<Commitable>,
}

pub struct XaWriter<P, S>
where
    P: ConnectionProvider,
    S: QueryStatement,
{
    provider: Arc<P>,
    statement: Arc<S>,
    codec: XidCodec,
    attempt: u16,
    settings: Settings,
    connection: Option<P::Connection>,
    /// The begun, not yet prepared branch.
    current: Option<TransactionId>,
    epoch: u64,
    sub_branch: u16,
    /// Bound rows not yet executed.
    batch: Vec<Vec<Value>>,
    /// Rows executed in the current epoch, replayed when a sub-branch is abandoned.
    replay: Vec<Vec<Value>>,
    prepared: Vec<TransactionId>,
    hanging: Vec<TransactionId>,
    phase: WriterPhase,
    last_flush: Instant,
    labels: Vec<(String, String)>,
}

impl<P, S> XaWriter<P, S>
where
    P: ConnectionProvider,
    S: QueryStatement,
{
    /// `attempt` is the host's attempt number of the subtask, `restored` the checkpoint the
    /// subtask restored from together with what recovery could not resolve.
    pub fn new(
        provider: Arc<P>,
        statement: Arc<S>,
        codec: XidCodec,
        attempt: u16,
        settings: Settings,
        restored: Option<(u64, WriterState)>,
    ) -> Self {
        let (epoch, state) = match restored {
            Some((checkpoint_id, state)) => (checkpoint_id.saturating_add(1), state),
            None => (1, WriterState::empty()),
        };
        let (prepared, hanging) = state.into_parts();
        let labels = subtask_labels(&codec);
        let writer = Self {
            provider,
            statement,
            codec,
            attempt,
            settings,
            connection: None,
            current: None,
            epoch,
            sub_branch: 0,
            batch: Vec::new(),
            replay: Vec::new(),
            prepared,
            hanging,
            phase: WriterPhase::Idle,
            last_flush: Instant::now(),
            labels,
        };
        writer.update_hanging_gauge();
        writer
    }

    /// Key the first branch by `checkpoint_id`, the checkpoint the host will snapshot first.
    /// Has no effect once a later epoch is reached.
    pub fn with_first_checkpoint(mut self, checkpoint_id: u64) -> Self {
        if self.current.is_none() && checkpoint_id > self.epoch {
            self.epoch = checkpoint_id;
        }
        self
    }

    pub fn phase(&self) -> WriterPhase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn codec(&self) -> &XidCodec {
        &self.codec
    }

    /// The open branch, if any.
    pub fn current(&self) -> Option<&TransactionId> {
        self.current.as_ref()
    }

    /// Rows waiting to be executed.
    pub fn buffered(&self) -> usize {
        self.batch.len()
    }

    /// Branches handed off but not yet known to be finished.
    pub fn state(&self) -> WriterState {
        WriterState::new(self.prepared.clone(), self.hanging.clone())
    }

    pub async fn write(&mut self, rows: Vec<S::Row>) -> Result<()> {
        self.ensure_usable()?;
        if rows.is_empty() {
            return Ok(());
        }
        let statement = Arc::clone(&self.statement);
        self.batch
            .extend(rows.iter().map(|row| statement.bind(row)));
        self.phase = WriterPhase::Buffering;

        if self.batch.len() >= self.settings.execution.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Whether the batch interval elapsed with rows still buffered.
    pub fn flush_due(&self) -> bool {
        let interval = self.settings.execution.batch_interval;
        !interval.is_zero() && !self.batch.is_empty() && self.last_flush.elapsed() >= interval
    }

    /// Execute the buffered rows in the open branch, opening one first if needed.
    pub async fn flush(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.last_flush = Instant::now();
        if self.batch.is_empty() {
            return Ok(());
        }
        self.ensure_branch().await?;

        let (Some(xid), Some(conn)) = (self.current.clone(), self.connection.as_mut()) else {
            return Err(Error::Writer("branch opened without a connection".to_string()));
        };
        match conn
            .execute_batch(self.statement.sql(), &self.batch)
            .await
        {
            Ok(_) => {
                xa_metrics()
                    .rows_written
                    .get_or_create(&self.labels)
                    .inc_by(self.batch.len() as u64);
                self.replay.append(&mut self.batch);
                Ok(())
            }
            Err(fault) => {
                // the backend may have applied part of the batch, replaying it elsewhere could
                // duplicate rows
                self.fail(&xid).await;
                Err(Error::Execute { xid, fault })
            }
        }
    }

    /// Prepare the epoch's branch and report what the host has to persist for `checkpoint_id`.
    ///
    /// The epoch advances whether or not the prepare succeeds. On failure the rows of the epoch
    /// are kept and replayed in the branch of the next epoch.
    pub async fn prepare_snapshot(&mut self, checkpoint_id: u64) -> Result<Snapshot> {
        self.ensure_usable()?;
        let before = self.phase;
        self.phase = WriterPhase::Preparing;

        let prepared = self.prepare_epoch(checkpoint_id).await;

        self.epoch = self.epoch.max(checkpoint_id).saturating_add(1);
        self.sub_branch = 0;

        let commitable = match prepared {
            Ok(commitable) => commitable,
            Err(e) => {
                if self.phase != WriterPhase::Failed {
                    self.phase = before;
                }
                return Err(e);
            }
        };
        self.phase = WriterPhase::Snapshotted;
        let snapshot = Snapshot {
            state: self.state(),
            commitable,
        };
        debug!(
            checkpoint_id,
            prepared = snapshot.state.prepared().len(),
            hanging = snapshot.state.hanging().len(),
            "Snapshot taken"
        );

        // open the next branch now so that the next write does not wait for it
        if let Err(e) = self.open_branch().await {
            warn!(epoch = self.epoch, ?e, "Could not open the next branch, retrying on the next write");
        }
        Ok(snapshot)
    }

    async fn prepare_epoch(&mut self, checkpoint_id: u64) -> Result<Option<Commitable>> {
        // no branch begun yet, so the one opened now can carry the checkpoint's own number
        if self.current.is_none() && checkpoint_id > self.epoch {
            self.epoch = checkpoint_id;
            self.sub_branch = 0;
        }
        self.flush().await?;
        if self.current.is_none() {
            if self.replay.is_empty() {
                return Ok(None);
            }
            self.open_branch().await?;
        }

        let mut backoff = self
            .settings
            .retry
            .backoff(self.settings.retry.max_retry_attempts);
        let mut attempts: u16 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let Some(xid) = self.current.clone() else {
                return Err(Error::Writer("no branch to prepare".to_string()));
            };
            let result = match self.connection.as_mut() {
                Some(conn) => conn.prepare(&xid).await,
                None => Err(XaFault::ConnectionLost("no connection".to_string())),
            };

            let fault = match result {
                Ok(outcome) => {
                    self.current = None;
                    self.replay.clear();
                    if self.settings.exactly_once.transaction_per_connection {
                        self.connection = None;
                    }
                    if outcome == PrepareOutcome::ReadOnly {
                        debug!(?xid, "Branch is read-only, nothing to commit");
                        return Ok(None);
                    }
                    xa_metrics()
                        .branches_prepared
                        .get_or_create(&self.labels)
                        .inc();
                    debug!(?xid, checkpoint_id, "Prepared branch");
                    self.prepared.push(xid.clone());
                    return Ok(Some(Commitable::new(xid, checkpoint_id)));
                }
                Err(fault) => fault,
            };

            self.abandon(xid.clone());
            if !fault.is_retryable() {
                return Err(Error::Prepare {
                    xid,
                    attempts,
                    fault,
                });
            }
            let Some(delay) = backoff.next() else {
                return Err(Error::Prepare {
                    xid,
                    attempts,
                    fault,
                });
            };
            warn!(?xid, attempts, ?fault, "Prepare failed, replaying the epoch in a new branch");
            tokio::time::sleep(delay).await;
            self.open_branch().await?;
        }
    }

    /// Drop ids whose commit was confirmed.
    pub fn notify_committed(&mut self, xids: &[TransactionId]) {
        self.prepared.retain(|xid| !xids.contains(xid));
    }

    /// Drop hanging ids that were rolled back or found absent.
    pub fn notify_resolved(&mut self, xids: &[TransactionId]) {
        self.hanging.retain(|xid| !xids.contains(xid));
        self.update_hanging_gauge();
    }

    /// Roll back the open branch, if any. Prepared branches stay untouched for the committer or
    /// for recovery.
    pub async fn close(&mut self) -> Result<()> {
        if self.phase == WriterPhase::Closed {
            return Ok(());
        }
        if !self.batch.is_empty() || !self.replay.is_empty() {
            info!(
                buffered = self.batch.len(),
                executed = self.replay.len(),
                "Closing with rows that were never prepared, they are discarded"
            );
        }
        self.batch.clear();
        self.replay.clear();

        let result = match (self.current.take(), self.connection.as_mut()) {
            (Some(xid), Some(conn)) => match conn.rollback(&xid).await {
                Ok(()) | Err(XaFault::UnknownTransaction) => Ok(()),
                Err(fault) => {
                    warn!(?xid, ?fault, "Failed to roll back the open branch on close");
                    Err(Error::Rollback {
                        xid,
                        attempts: 1,
                        fault,
                    })
                }
            },
            _ => Ok(()),
        };
        self.connection = None;
        self.phase = WriterPhase::Closed;
        result
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.phase {
            WriterPhase::Failed => Err(Error::Writer(
                "writer failed on a previous execution".to_string(),
            )),
            WriterPhase::Closed => Err(Error::Writer("writer is closed".to_string())),
            _ => Ok(()),
        }
    }

    async fn ensure_branch(&mut self) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        self.open_branch().await
    }

    fn next_xid(&self) -> TransactionId {
        self.codec
            .branch(self.epoch, branch_suffix(self.attempt, self.sub_branch))
    }

    /// Begin the next sub-branch of the epoch and replay the epoch's executed rows into it.
    async fn open_branch(&mut self) -> Result<()> {
        let mut backoff = self
            .settings
            .retry
            .backoff(self.settings.retry.max_retry_attempts);
        let mut attempts: u16 = 0;
        loop {
            attempts = attempts.saturating_add(1);
            let xid = self.next_xid();

            let fault = match self.begin_and_replay(&xid).await {
                Ok(()) => {
                    debug!(?xid, replayed = self.replay.len(), "Began branch");
                    self.current = Some(xid);
                    return Ok(());
                }
                Err((fault, touched)) => {
                    if touched {
                        self.abandon(xid.clone());
                    }
                    fault
                }
            };

            if !fault.is_retryable() {
                return Err(Error::Begin {
                    xid,
                    attempts,
                    fault,
                });
            }
            let Some(delay) = backoff.next() else {
                return Err(Error::Begin {
                    xid,
                    attempts,
                    fault,
                });
            };
            warn!(?xid, attempts, ?fault, "Begin failed, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// The flag tells whether the backend may have seen the branch.
    async fn begin_and_replay(
        &mut self,
        xid: &TransactionId,
    ) -> std::result::Result<(), (XaFault, bool)> {
        if self.connection.is_none() {
            let conn = self.provider.acquire().await.map_err(|f| (f, false))?;
            self.connection = Some(conn);
        }
        let Some(conn) = self.connection.as_mut() else {
            return Err((XaFault::ConnectionLost("no connection".to_string()), false));
        };
        conn.begin(xid, self.settings.exactly_once.transaction_timeout)
            .await
            .map_err(|f| (f, true))?;
        if !self.replay.is_empty() {
            conn.execute_batch(self.statement.sql(), &self.replay)
                .await
                .map_err(|f| (f, true))?;
        }
        Ok(())
    }

    /// Give up on `xid` without knowing its fate. The connection is dropped with it, the next
    /// branch of the epoch gets the next suffix.
    fn abandon(&mut self, xid: TransactionId) {
        if self.current.as_ref() == Some(&xid) {
            self.current = None;
        }
        self.connection = None;
        self.sub_branch = self.sub_branch.wrapping_add(1);
        if !self.hanging.contains(&xid) && !self.prepared.contains(&xid) {
            warn!(?xid, "Abandoning branch, it will be resolved through the hanging list");
            self.hanging.push(xid);
            xa_metrics()
                .branches_abandoned
                .get_or_create(&self.labels)
                .inc();
            self.update_hanging_gauge();
        }
    }

    /// Move to `Failed`, rolling back what the backend holds of `xid`.
    async fn fail(&mut self, xid: &TransactionId) {
        self.phase = WriterPhase::Failed;
        self.current = None;
        self.batch.clear();
        self.replay.clear();
        if let Some(mut conn) = self.connection.take()
            && let Err(fault) = conn.rollback(xid).await
            && fault != XaFault::UnknownTransaction
        {
            warn!(?xid, ?fault, "Failed to roll back the branch of a failed execution");
        }
    }

    fn update_hanging_gauge(&self) {
        xa_metrics()
            .hanging
            .get_or_create(&self.labels)
            .set(self.hanging.len() as i64);
    }
}
