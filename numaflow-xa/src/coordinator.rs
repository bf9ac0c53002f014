//! Drives one subtask's sink through the host's checkpoints.
//!
//! ```text
//!   Snapshot(n)  ──> writer.prepare_snapshot(n) ──> state sink ──> pending commitables
//!   Confirmed(n) ──> committer.commit_all(pending <= n) ──> writer.notify_committed
//!                ──> rollback hanging ids of snapshots <= n ──> writer.notify_resolved
//!   Aborted(n)   ──> nothing; the branch is committed with the next confirmed checkpoint
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointEvent, CheckpointSource, StateSink};
use crate::committer::{Commitable, Committer};
use crate::config::Settings;
use crate::connection::ConnectionProvider;
use crate::error::{Error, Result};
use crate::recovery::{self, RecoveryReport, RestoredState};
use crate::statement::QueryStatement;
use crate::writer::XaWriter;
use crate::writer::actor::{self, WriterHandle};
use crate::xid::{JobId, TransactionId, XidCodec};

/// Identity of the subtask a coordinator runs for.
#[derive(Debug, Clone)]
pub struct WriterContext {
    pub job_id: JobId,
    pub subtask_index: u32,
    /// Attempt number the host assigned to this run of the subtask.
    pub attempt: u16,
    pub restored: Option<RestoredState>,
    /// The checkpoint the host will snapshot first, when known. Without it the first branch is
    /// keyed by the checkpoint after the restored one.
    pub first_checkpoint_id: Option<u64>,
}

pub struct Coordinator<P, S, T>
where
    P: ConnectionProvider,
    S: QueryStatement,
{
    codec: XidCodec,
    writer: WriterHandle<S::Row>,
    writer_task: JoinHandle<Result<()>>,
    committer: Arc<Committer<P>>,
    state_sink: T,
    /// Prepared branches waiting for their checkpoint to be confirmed, in checkpoint order.
    pending: Vec<Commitable>,
    /// Hanging ids as listed by the snapshot of each checkpoint.
    hanging_at: BTreeMap<u64, Vec<TransactionId>>,
    cancel: CancellationToken,
}

impl<P, S, T> Coordinator<P, S, T>
where
    P: ConnectionProvider,
    S: QueryStatement,
    T: StateSink + Send + Sync + 'static,
{
    /// Recover the restored state, then start the writer. Nothing is written before recovery
    /// has finished.
    pub async fn start(
        provider: Arc<P>,
        statement: S,
        committer: Arc<Committer<P>>,
        state_sink: T,
        settings: Settings,
        ctx: WriterContext,
        cancel: CancellationToken,
    ) -> Result<(Self, RecoveryReport)> {
        settings.validate()?;
        let codec = XidCodec::new(ctx.job_id, ctx.subtask_index);
        committer.adopt(&codec);
        info!(
            job_id = %ctx.job_id,
            subtask_index = ctx.subtask_index,
            attempt = ctx.attempt,
            restored_checkpoint = ?ctx.restored.as_ref().map(|r| r.checkpoint_id),
            "Starting transactional writer"
        );

        let report = recovery::recover(
            &committer,
            &codec,
            ctx.restored.as_ref(),
            settings.exactly_once.recover_and_rollback,
        )
        .await?;

        let restored_checkpoint = ctx.restored.as_ref().map_or(0, |r| r.checkpoint_id);
        let pending = report
            .remaining
            .prepared()
            .iter()
            .map(|xid| Commitable::recovered(xid.clone(), restored_checkpoint))
            .collect();

        let channel_size = settings.execution.batch_size.min(1024);
        let mut writer = XaWriter::new(
            provider,
            Arc::new(statement),
            codec.clone(),
            ctx.attempt,
            settings,
            Some((restored_checkpoint, report.remaining.clone())),
        );
        if let Some(checkpoint_id) = ctx.first_checkpoint_id {
            writer = writer.with_first_checkpoint(checkpoint_id);
        }
        let (writer, writer_task) = actor::spawn(writer, channel_size, cancel.clone());

        Ok((
            Self {
                codec,
                writer,
                writer_task,
                committer,
                state_sink,
                pending,
                hanging_at: BTreeMap::new(),
                cancel,
            },
            report,
        ))
    }

    pub fn codec(&self) -> &XidCodec {
        &self.codec
    }

    /// Handle to feed rows to the writer.
    pub fn writer(&self) -> &WriterHandle<S::Row> {
        &self.writer
    }

    pub async fn write(&self, rows: Vec<S::Row>) -> Result<()> {
        self.writer.write(rows).await
    }

    /// Commitables waiting for a confirmed checkpoint.
    pub fn pending(&self) -> &[Commitable] {
        &self.pending
    }

    pub async fn on_checkpoint(&mut self, event: CheckpointEvent) -> Result<()> {
        match event {
            CheckpointEvent::Snapshot(checkpoint_id) => self.snapshot(checkpoint_id).await,
            CheckpointEvent::Confirmed(checkpoint_id) => self.confirmed(checkpoint_id).await,
            CheckpointEvent::Aborted(checkpoint_id) => {
                debug!(
                    checkpoint_id,
                    pending = self.pending.len(),
                    "Checkpoint aborted, its branch is committed with the next confirmed one"
                );
                Ok(())
            }
        }
    }

    async fn snapshot(&mut self, checkpoint_id: u64) -> Result<()> {
        let snapshot = self.writer.prepare_snapshot(checkpoint_id).await?;
        if let Some(commitable) = snapshot.commitable {
            self.pending.push(commitable);
        }
        self.hanging_at
            .insert(checkpoint_id, snapshot.state.hanging().to_vec());
        self.state_sink.persist(checkpoint_id, &snapshot.state).await
    }

    async fn confirmed(&mut self, checkpoint_id: u64) -> Result<()> {
        let (ready, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|c| c.checkpoint_id <= checkpoint_id);
        self.pending = later;

        let report = self.committer.commit_all(ready).await;
        self.writer.notify_committed(report.committed_ids()).await?;
        self.pending.extend(report.pending());
        self.pending.sort_by_key(|c| c.checkpoint_id);

        self.resolve_hanging(checkpoint_id).await?;

        match report.failed.into_iter().next() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Roll back the hanging ids listed by snapshots up to `checkpoint_id`; those states are
    /// durable now, so nothing will ever try to commit them.
    async fn resolve_hanging(&mut self, checkpoint_id: u64) -> Result<()> {
        let later = self.hanging_at.split_off(&(checkpoint_id.saturating_add(1)));
        let due = std::mem::replace(&mut self.hanging_at, later);

        let mut candidates: Vec<TransactionId> = due.into_values().flatten().collect();
        candidates.sort();
        candidates.dedup();

        let mut resolved = Vec::with_capacity(candidates.len());
        let mut unresolved = Vec::new();
        for xid in candidates {
            match self.committer.rollback(&xid).await {
                Ok(outcome) => {
                    debug!(?xid, ?outcome, "Resolved hanging branch");
                    resolved.push(xid);
                }
                Err(e) => {
                    warn!(?xid, ?e, "Could not resolve hanging branch, retrying on the next checkpoint");
                    unresolved.push(xid);
                }
            }
        }
        if !unresolved.is_empty() {
            self.hanging_at
                .entry(checkpoint_id)
                .or_default()
                .extend(unresolved);
        }
        self.writer.notify_resolved(resolved).await
    }

    /// Handle checkpoint events until the source is exhausted or `cancel` fires.
    ///
    /// Failed prepares and commits that were only retried out are logged and left for the next
    /// checkpoint; any other error stops the loop.
    pub async fn run(&mut self, mut source: impl CheckpointSource) -> Result<()> {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Cancellation received, stopping checkpoint handling");
                    return Ok(());
                }
                event = source.next_event() => event,
            };
            let Some(event) = event else {
                return Ok(());
            };
            match self.on_checkpoint(event).await {
                Ok(()) => {}
                Err(e) if recoverable(&e) => {
                    warn!(?event, ?e, "Checkpoint step failed, continuing with the next one");
                }
                Err(e) => {
                    error!(?event, ?e, "Checkpoint step failed");
                    return Err(e);
                }
            }
        }
    }

    /// Close the writer, rolling back its open branch. Pending commitables are left prepared
    /// for the next incarnation.
    pub async fn close(self) -> Result<()> {
        if !self.pending.is_empty() {
            info!(
                pending = self.pending.len(),
                "Closing with prepared branches that were not committed yet"
            );
        }
        let closed = self.writer.close().await;
        self.writer_task
            .await
            .map_err(|e| Error::Writer(format!("writer task failed: {e}")))??;
        match closed {
            // the actor already stopped on cancellation
            Err(Error::Writer(_)) => Ok(()),
            other => other,
        }
    }
}

/// Errors after which the next checkpoint can still succeed.
fn recoverable(e: &Error) -> bool {
    matches!(
        e,
        Error::Begin { .. }
            | Error::Prepare { .. }
            | Error::CommitExhausted { .. }
            | Error::CommitDeferred { .. }
            | Error::State(_)
    )
}
