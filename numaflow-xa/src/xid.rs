//! Deterministic distributed-transaction identifiers.
//!
//! Recovery never stores a branch id separately from the writer state; it only relies on every
//! incarnation of a subtask computing the very same bytes for the same logical branch. Hence all
//! fields are fixed width and big-endian, no delimiters, no randomness.
//!
//! ```text
//! global part (20 bytes):  job id (16) | subtask index (u32)
//! branch part (16 bytes):  subtask index (u32) | checkpoint epoch (u64) | branch suffix (u32)
//! ```

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Format id stamped on every branch written by this sink ("NFXA").
pub const FORMAT_ID: i32 = 0x4e46_5841;

pub const JOB_ID_LEN: usize = 16;
pub const GLOBAL_PART_LEN: usize = JOB_ID_LEN + 4;
pub const BRANCH_PART_LEN: usize = 4 + 8 + 4;

/// Namespace for deriving a [JobId] out of a job name.
const JOB_NAMESPACE: Uuid = Uuid::from_u128(0x6e75_6d61_666c_6f77_2d78_612d_6a6f_6273);

/// Identity of the job owning the writers, stable for the lifetime of the job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId([u8; JOB_ID_LEN]);

impl JobId {
    pub const fn from_bytes(bytes: [u8; JOB_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the id from a job name; the same name always yields the same id.
    pub fn from_name(name: &str) -> Self {
        Self(*Uuid::new_v5(&JOB_NAMESPACE, name.as_bytes()).as_bytes())
    }

    /// Parse 32 hex characters.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let bytes = decode_hex(hex)?;
        let bytes: [u8; JOB_ID_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::Xid(format!(
                "job id must be {JOB_ID_LEN} bytes, got {} bytes",
                b.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; JOB_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_hex(&self.0))
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({self})")
    }
}

/// A distributed transaction branch identifier (an XA `Xid`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    format_id: i32,
    #[serde(with = "base64_bytes")]
    global_part: Bytes,
    #[serde(with = "base64_bytes")]
    branch_part: Bytes,
}

/// The logical coordinates encoded in a branch part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchCoordinates {
    pub subtask_index: u32,
    pub checkpoint_id: u64,
    pub suffix: u32,
}

impl TransactionId {
    pub fn new(format_id: i32, global_part: Bytes, branch_part: Bytes) -> Self {
        Self {
            format_id,
            global_part,
            branch_part,
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_part(&self) -> &Bytes {
        &self.global_part
    }

    pub fn branch_part(&self) -> &Bytes {
        &self.branch_part
    }

    /// The job this id was produced for, if it has this sink's layout.
    pub fn job_id(&self) -> Option<JobId> {
        if self.format_id != FORMAT_ID {
            return None;
        }
        let bytes: [u8; JOB_ID_LEN] = self.global_part.get(..JOB_ID_LEN)?.try_into().ok()?;
        Some(JobId(bytes))
    }

    /// Decode the branch part. Fails for ids not produced by [encode].
    pub fn coordinates(&self) -> Result<BranchCoordinates> {
        if self.format_id != FORMAT_ID {
            return Err(Error::Xid(format!(
                "unexpected format id {} in {self}",
                self.format_id
            )));
        }
        let b = self.branch_part.as_ref();
        let (Some(subtask), Some(checkpoint), Some(suffix)) =
            (b.get(0..4), b.get(4..12), b.get(12..16))
        else {
            return Err(Error::Xid(format!("branch part too short in {self}")));
        };
        if b.len() != BRANCH_PART_LEN {
            return Err(Error::Xid(format!("branch part too long in {self}")));
        }
        // the slices above have exactly the lengths of the arrays.
        Ok(BranchCoordinates {
            subtask_index: u32::from_be_bytes(subtask.try_into().unwrap_or_default()),
            checkpoint_id: u64::from_be_bytes(checkpoint.try_into().unwrap_or_default()),
            suffix: u32::from_be_bytes(suffix.try_into().unwrap_or_default()),
        })
    }
}

/// `format_id:global-hex:branch-hex`, which is also what [FromStr] accepts.
impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.format_id,
            encode_hex(&self.global_part),
            encode_hex(&self.branch_part)
        )
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

impl FromStr for TransactionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let (Some(format_id), Some(global), Some(branch)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::Xid(format!(
                "expected format_id:global:branch, got {s:?}"
            )));
        };
        let format_id = format_id
            .parse::<i32>()
            .map_err(|e| Error::Xid(format!("invalid format id {format_id:?}: {e}")))?;
        Ok(Self::new(
            format_id,
            decode_hex(global)?.into(),
            decode_hex(branch)?.into(),
        ))
    }
}

/// Encode the branch `(job, subtask, checkpoint, suffix)`.
pub fn encode(job_id: &JobId, subtask_index: u32, checkpoint_id: u64, suffix: u32) -> TransactionId {
    TransactionId::new(
        FORMAT_ID,
        global_part(job_id, subtask_index),
        branch_part(subtask_index, checkpoint_id, suffix),
    )
}

fn global_part(job_id: &JobId, subtask_index: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(GLOBAL_PART_LEN);
    buf.put_slice(job_id.as_bytes());
    buf.put_u32(subtask_index);
    buf.freeze()
}

fn branch_part(subtask_index: u32, checkpoint_id: u64, suffix: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(BRANCH_PART_LEN);
    buf.put_u32(subtask_index);
    buf.put_u64(checkpoint_id);
    buf.put_u32(suffix);
    buf.freeze()
}

/// Encoder bound to one (job, subtask); the global part is computed once.
#[derive(Debug, Clone)]
pub struct XidCodec {
    job_id: JobId,
    subtask_index: u32,
    global_part: Bytes,
}

impl XidCodec {
    pub fn new(job_id: JobId, subtask_index: u32) -> Self {
        Self {
            job_id,
            subtask_index,
            global_part: global_part(&job_id, subtask_index),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn subtask_index(&self) -> u32 {
        self.subtask_index
    }

    pub fn global_part(&self) -> &Bytes {
        &self.global_part
    }

    pub fn branch(&self, checkpoint_id: u64, suffix: u32) -> TransactionId {
        TransactionId::new(
            FORMAT_ID,
            self.global_part.clone(),
            branch_part(self.subtask_index, checkpoint_id, suffix),
        )
    }

    /// Whether `xid` was produced for this codec's (job, subtask).
    pub fn belongs_to(&self, xid: &TransactionId) -> bool {
        xid.format_id == FORMAT_ID && xid.global_part == self.global_part
    }
}

/// Branch suffix made of the task attempt (upper half) and the sub-branch counter (lower half).
/// The attempt keeps a restarted writer from colliding with branches its predecessor left behind.
pub fn branch_suffix(attempt: u16, sub_branch: u16) -> u32 {
    (u32::from(attempt) << 16) | u32::from(sub_branch)
}

fn encode_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::Xid(format!("odd length hex string {hex:?}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| Error::Xid(format!("invalid hex string {hex:?}")))
        })
        .collect()
}

/// Serde adapter storing byte fields as base64 strings.
mod base64_bytes {
    use base64::Engine;
    use base64::prelude::BASE64_STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
