//! Exactly-once writes into an XA capable database for a checkpointed streaming sink.
//!
//! Every subtask writes each checkpoint epoch into its own XA branch. The branch is prepared
//! when the host snapshots the checkpoint and committed once the host confirms the checkpoint
//! is durable everywhere. The ids of prepared branches travel inside the checkpointed
//! [WriterState], so a restarted subtask can finish the commits its predecessor could not.
//!
//! ```text
//!   rows ──> [writer::XaWriter] ──prepare──> [WriterState] ──> host checkpoint
//!                                                │
//!   confirmation ──> [committer::Committer] <────┘
//!   restore ──────> [recovery::recover] ──> commit prepared, roll back hanging and orphans
//! ```
//!
//! The database driver is plugged in through [connection::ConnectionProvider] and
//! [connection::XaConnection]; the host's checkpointing through [checkpoint::CheckpointSource]
//! and [checkpoint::StateSink]. [coordinator::Coordinator] wires them together for one subtask.

pub mod checkpoint;
pub mod committer;
pub mod config;
pub mod connection;
pub mod coordinator;
mod error;
pub mod metrics;
pub mod recovery;
pub mod statement;
pub mod writer;
pub mod xid;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::error::{Error, Result};
pub use crate::writer::WriterState;
pub use crate::xid::{JobId, TransactionId, XidCodec};
