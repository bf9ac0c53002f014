//! What the sink needs from the host's checkpointing: the sequence of checkpoint events of a
//! subtask, and a place to keep the writer state of each snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::recovery::RestoredState;
use crate::writer::WriterState;

const STATE_FILE_PREFIX: &str = "state-";
const STATE_FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointEvent {
    /// Take a snapshot for the checkpoint.
    Snapshot(u64),
    /// The checkpoint is durable on every subtask.
    Confirmed(u64),
    /// The checkpoint will never complete.
    Aborted(u64),
}

#[trait_variant::make(CheckpointSource: Send)]
pub trait LocalCheckpointSource {
    /// The next event, `None` once the host is done.
    async fn next_event(&mut self) -> Option<CheckpointEvent>;
}

impl CheckpointSource for mpsc::Receiver<CheckpointEvent> {
    async fn next_event(&mut self) -> Option<CheckpointEvent> {
        self.recv().await
    }
}

/// Durable storage for the writer state, keyed by checkpoint.
#[trait_variant::make(StateSink: Send)]
pub trait LocalStateSink {
    async fn persist(&self, checkpoint_id: u64, state: &WriterState) -> Result<()>;
}

/// Keeps every persisted state in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateSink {
    states: Arc<Mutex<BTreeMap<u64, Bytes>>>,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, checkpoint_id: u64) -> Result<Option<WriterState>> {
        self.states
            .lock()
            .get(&checkpoint_id)
            .map(|bytes| WriterState::from_bytes(bytes))
            .transpose()
    }

    /// The state of the highest checkpoint persisted so far.
    pub fn latest(&self) -> Result<Option<RestoredState>> {
        let states = self.states.lock();
        let Some((checkpoint_id, bytes)) = states.last_key_value() else {
            return Ok(None);
        };
        Ok(Some(RestoredState {
            checkpoint_id: *checkpoint_id,
            state: WriterState::from_bytes(bytes)?,
        }))
    }
}

impl StateSink for MemoryStateSink {
    async fn persist(&self, checkpoint_id: u64, state: &WriterState) -> Result<()> {
        let bytes = state.to_bytes()?;
        self.states.lock().insert(checkpoint_id, bytes);
        Ok(())
    }
}

/// Writes one `state-<checkpoint>.json` file per checkpoint into a directory.
#[derive(Debug, Clone)]
pub struct FileStateSink {
    dir: PathBuf,
}

impl FileStateSink {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::State(format!(
                "Failed to create state directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    fn path(&self, checkpoint_id: u64) -> PathBuf {
        self.dir
            .join(format!("{STATE_FILE_PREFIX}{checkpoint_id:020}{STATE_FILE_SUFFIX}"))
    }

    pub async fn load(&self, checkpoint_id: u64) -> Result<Option<WriterState>> {
        match tokio::fs::read(self.path(checkpoint_id)).await {
            Ok(bytes) => Ok(Some(WriterState::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The state of the highest checkpoint found in the directory.
    pub async fn latest(&self) -> Result<Option<RestoredState>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut latest: Option<u64> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let checkpoint_id = name
                .to_str()
                .and_then(|n| n.strip_prefix(STATE_FILE_PREFIX))
                .and_then(|n| n.strip_suffix(STATE_FILE_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(id) = checkpoint_id {
                latest = latest.max(Some(id));
            }
        }
        let Some(checkpoint_id) = latest else {
            return Ok(None);
        };
        Ok(self.load(checkpoint_id).await?.map(|state| RestoredState {
            checkpoint_id,
            state,
        }))
    }
}

impl StateSink for FileStateSink {
    async fn persist(&self, checkpoint_id: u64, state: &WriterState) -> Result<()> {
        let path = self.path(checkpoint_id);
        let tmp = self
            .dir
            .join(format!(".{STATE_FILE_PREFIX}{checkpoint_id:020}.tmp"));

        // atomically write the new file, this is done by creating a tmp file and then renaming it
        tokio::fs::write(&tmp, state.to_bytes()?).await.map_err(|e| {
            Error::State(format!("Failed to write state file {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            Error::State(format!("Failed to rename state file {}: {e}", path.display()))
        })?;
        debug!(checkpoint_id, path = %path.display(), "Persisted writer state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{
        CheckpointEvent, CheckpointSource, FileStateSink, MemoryStateSink, RestoredState,
        StateSink, WriterState, mpsc,
    };
    use crate::xid::{JobId, XidCodec};

    fn state(checkpoint: u64) -> WriterState {
        let codec = XidCodec::new(JobId::from_name("J1"), 0);
        WriterState::new(vec![codec.branch(checkpoint, 0)], vec![codec.branch(checkpoint, 1)])
    }

    #[tokio::test]
    async fn receiver_is_a_checkpoint_source() {
        let (tx, mut rx) = mpsc::channel(2);
        tx.send(CheckpointEvent::Snapshot(1)).await.unwrap();
        drop(tx);
        assert_eq!(rx.next_event().await, Some(CheckpointEvent::Snapshot(1)));
        assert_eq!(rx.next_event().await, None);
    }

    #[tokio::test]
    async fn memory_sink_keeps_every_checkpoint() {
        let sink = MemoryStateSink::new();
        assert_eq!(sink.latest().unwrap(), None);

        sink.persist(1, &state(1)).await.unwrap();
        sink.persist(2, &state(2)).await.unwrap();
        assert_eq!(sink.get(1).unwrap(), Some(state(1)));
        assert_eq!(
            sink.latest().unwrap(),
            Some(RestoredState {
                checkpoint_id: 2,
                state: state(2)
            })
        );
    }

    #[tokio::test]
    async fn file_sink_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let sink = FileStateSink::new(temp_dir.path().join("states"))
            .await
            .unwrap();
        assert_eq!(sink.latest().await.unwrap(), None);

        sink.persist(9, &state(9)).await.unwrap();
        sink.persist(10, &state(10)).await.unwrap();
        // unrelated files are ignored
        std::fs::write(temp_dir.path().join("states").join("notes.txt"), b"x").unwrap();

        assert_eq!(sink.load(9).await.unwrap(), Some(state(9)));
        assert_eq!(sink.load(11).await.unwrap(), None);
        let latest = sink.latest().await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, 10);
        assert_eq!(latest.state, state(10));

        let leftovers: Vec<_> = std::fs::read_dir(temp_dir.path().join("states"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
