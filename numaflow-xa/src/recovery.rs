//! Restart path of a subtask: finish what the restored state left behind before any new branch
//! is opened.

use std::collections::HashSet;

use bytes::Bytes;
use tracing::{error, info, warn};

use crate::committer::{CommitOutcome, Commitable, Committer, RollbackOutcome};
use crate::connection::ConnectionProvider;
use crate::error::Result;
use crate::writer::WriterState;
use crate::xid::{FORMAT_ID, TransactionId, XidCodec};

/// State handed back by the host on restore.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    /// The checkpoint the state was taken at.
    pub checkpoint_id: u64,
    pub state: WriterState,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub committed: Vec<(TransactionId, CommitOutcome)>,
    /// Hanging branches found prepared and rolled back.
    pub rolled_back: Vec<TransactionId>,
    /// Hanging branches the backend did not know.
    pub absent: Vec<TransactionId>,
    /// Prepared branches of this lineage that no restored state knew about.
    pub orphans_rolled_back: Vec<TransactionId>,
    /// What could not be resolved; the writer keeps carrying it.
    pub remaining: WriterState,
}

impl RecoveryReport {
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Resolve the restored state of the subtask owning `codec`.
///
/// Restored prepared branches are committed as recovered commitables, in order, stopping at the
/// first failure. Hanging branches are rolled back, and with `recover_and_rollback` the backend's
/// prepared branches of this lineage unknown to the restored state are rolled back as well.
/// Failures are logged with the id and leave the branch in [RecoveryReport::remaining]; only a
/// cancelled committer aborts recovery.
pub async fn recover<P>(
    committer: &Committer<P>,
    codec: &XidCodec,
    restored: Option<&RestoredState>,
    recover_and_rollback: bool,
) -> Result<RecoveryReport>
where
    P: ConnectionProvider,
{
    let mut report = RecoveryReport::default();
    let (checkpoint_id, prepared, hanging) = match restored {
        Some(r) => (
            r.checkpoint_id,
            r.state.prepared().to_vec(),
            r.state.hanging().to_vec(),
        ),
        None => (0, Vec::new(), Vec::new()),
    };

    let mut lineage: HashSet<Bytes> = HashSet::from([codec.global_part().clone()]);
    lineage.extend(
        prepared
            .iter()
            .chain(hanging.iter())
            .map(|xid| xid.global_part().clone()),
    );

    let inherited = prepared
        .iter()
        .chain(hanging.iter())
        .filter(|xid| !codec.belongs_to(xid))
        .count();
    if inherited > 0 {
        info!(inherited, "Restored state holds branches written by other subtasks");
    }

    let mut remaining_prepared = Vec::new();
    let mut pending = prepared.into_iter();
    for xid in pending.by_ref() {
        match committer
            .commit(&Commitable::recovered(xid.clone(), checkpoint_id))
            .await
        {
            Ok(outcome) => report.committed.push((xid, outcome)),
            Err(e) => {
                error!(?xid, ?e, "Failed to commit restored branch, keeping it in state");
                remaining_prepared.push(xid);
                break;
            }
        }
    }
    remaining_prepared.extend(pending);

    let mut remaining_hanging = Vec::new();
    for xid in hanging {
        match committer.rollback(&xid).await {
            Ok(RollbackOutcome::RolledBack) => report.rolled_back.push(xid),
            Ok(RollbackOutcome::Absent) => report.absent.push(xid),
            Err(e) => {
                warn!(?xid, ?e, "Could not resolve hanging branch, keeping it in state");
                remaining_hanging.push(xid);
            }
        }
    }

    if recover_and_rollback {
        match committer.recover_prepared().await {
            Ok(listed) => {
                let orphans = listed.into_iter().filter(|xid| {
                    xid.format_id() == FORMAT_ID
                        && lineage.contains(xid.global_part())
                        && !remaining_prepared.contains(xid)
                        && !remaining_hanging.contains(xid)
                });
                for xid in orphans.collect::<Vec<_>>() {
                    match committer.rollback(&xid).await {
                        Ok(RollbackOutcome::RolledBack) => {
                            info!(?xid, "Rolled back orphaned prepared branch");
                            report.orphans_rolled_back.push(xid);
                        }
                        // finished in the meantime
                        Ok(RollbackOutcome::Absent) => {}
                        Err(e) => {
                            warn!(?xid, ?e, "Could not roll back orphaned branch, tracking it as hanging");
                            remaining_hanging.push(xid);
                        }
                    }
                }
            }
            Err(e) => warn!(?e, "Could not list prepared branches, orphans are left in place"),
        }
    }

    report.remaining = WriterState::new(remaining_prepared, remaining_hanging);
    info!(
        committed = report.committed.len(),
        rolled_back = report.rolled_back.len(),
        absent = report.absent.len(),
        orphans = report.orphans_rolled_back.len(),
        remaining_prepared = report.remaining.prepared().len(),
        remaining_hanging = report.remaining.hanging().len(),
        "Recovery finished"
    );
    Ok(report)
}
