//! The part of the writer that survives a restart.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::xid::TransactionId;

/// Layout version of the serialized state.
pub const STATE_VERSION: u32 = 1;

/// Branches the writer has handed off but whose outcome is not yet known to it.
///
/// `prepared` holds branches prepared at a snapshot and not yet confirmed committed, oldest
/// first. `hanging` holds branches whose fate was not observed, e.g. a prepare that lost its
/// connection. The two lists never share an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterState {
    version: u32,
    prepared: Vec<TransactionId>,
    hanging: Vec<TransactionId>,
}

impl WriterState {
    /// Builds a state out of the two lists. Duplicates are dropped, and an id present in both
    /// lists is kept as prepared only, since a prepared branch is about to be committed anyway.
    pub fn new(prepared: Vec<TransactionId>, hanging: Vec<TransactionId>) -> Self {
        let mut state = Self {
            version: STATE_VERSION,
            prepared: Vec::with_capacity(prepared.len()),
            hanging: Vec::with_capacity(hanging.len()),
        };
        for xid in prepared {
            if !state.prepared.contains(&xid) {
                state.prepared.push(xid);
            }
        }
        for xid in hanging {
            if !state.prepared.contains(&xid) && !state.hanging.contains(&xid) {
                state.hanging.push(xid);
            }
        }
        state
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn prepared(&self) -> &[TransactionId] {
        &self.prepared
    }

    pub fn hanging(&self) -> &[TransactionId] {
        &self.hanging
    }

    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty() && self.hanging.is_empty()
    }

    pub fn into_parts(self) -> (Vec<TransactionId>, Vec<TransactionId>) {
        (self.prepared, self.hanging)
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let state: WriterState = serde_json::from_slice(bytes)?;
        if state.version != STATE_VERSION {
            return Err(Error::State(format!(
                "unsupported writer state version {}, expected {STATE_VERSION}",
                state.version
            )));
        }
        // re-establish the invariants, the bytes may have been edited by hand
        Ok(Self::new(state.prepared, state.hanging))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xid::{JobId, encode};

    fn xid(checkpoint: u64, suffix: u32) -> TransactionId {
        encode(&JobId::from_name("J1"), 4, checkpoint, suffix)
    }

    #[test]
    fn lists_stay_disjoint() {
        let state = WriterState::new(
            vec![xid(1, 0), xid(2, 0), xid(1, 0)],
            vec![xid(2, 0), xid(3, 1), xid(3, 1)],
        );
        assert_eq!(state.prepared(), &[xid(1, 0), xid(2, 0)]);
        assert_eq!(state.hanging(), &[xid(3, 1)]);
    }

    #[test]
    fn bytes_round_trip() {
        let state = WriterState::new(vec![xid(7, 0)], vec![xid(6, 1)]);
        let bytes = state.to_bytes().unwrap();
        let restored = WriterState::from_bytes(&bytes).unwrap();
        assert_eq!(restored, state);

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["version"], STATE_VERSION);
        assert_eq!(json["prepared"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let json = br#"{"version":99,"prepared":[],"hanging":[]}"#;
        let err = WriterState::from_bytes(json).unwrap_err();
        assert!(matches!(err, Error::State(_)));

        assert!(WriterState::from_bytes(b"not json").is_err());
    }

    #[test]
    fn empty_state() {
        let state = WriterState::empty();
        assert!(state.is_empty());
        assert_eq!(WriterState::from_bytes(&state.to_bytes().unwrap()).unwrap(), state);
    }
}
