use thiserror::Error;

use crate::connection::XaFault;
use crate::xid::TransactionId;

pub type Result<T> = std::result::Result<T, Error>;

/// Every error that concerns a branch carries its [TransactionId], so an operator can look the
/// transaction up (and resolve it by hand if needed) on the database side.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Xid Error - {0}")]
    Xid(String),

    #[error("Connection Error - {0}")]
    Connection(XaFault),

    #[error("Execute Error - {xid} - {fault}")]
    Execute { xid: TransactionId, fault: XaFault },

    #[error("Begin Error - {xid} failed after {attempts} attempt(s) - {fault}")]
    Begin {
        xid: TransactionId,
        attempts: u16,
        fault: XaFault,
    },

    #[error("Prepare Error - {xid} failed after {attempts} attempt(s) - {fault}")]
    Prepare {
        xid: TransactionId,
        attempts: u16,
        fault: XaFault,
    },

    #[error(
        "Commit Error - {xid} is unknown to the backend and was not prepared by this writer lineage, \
         it may have been rolled back or timed out"
    )]
    CommitAmbiguous { xid: TransactionId },

    #[error("Commit Error - {xid} failed after {attempts} attempt(s) - {fault}")]
    CommitExhausted {
        xid: TransactionId,
        attempts: u16,
        fault: XaFault,
    },

    #[error("Commit Error - {xid} not attempted, an earlier checkpoint of the subtask ({blocked_by}) is not committed")]
    CommitDeferred {
        xid: TransactionId,
        blocked_by: TransactionId,
    },

    #[error("Rollback Error - {xid} failed after {attempts} attempt(s) - {fault}")]
    Rollback {
        xid: TransactionId,
        attempts: u16,
        fault: XaFault,
    },

    #[error("Backend Error - {xid} - {fault}")]
    Backend { xid: TransactionId, fault: XaFault },

    #[error("Writer Error - {0}")]
    Writer(String),

    #[error("State Error - {0}")]
    State(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// The branch this error is about, if any.
    pub fn xid(&self) -> Option<&TransactionId> {
        match self {
            Error::Execute { xid, .. }
            | Error::Begin { xid, .. }
            | Error::Prepare { xid, .. }
            | Error::CommitAmbiguous { xid }
            | Error::CommitExhausted { xid, .. }
            | Error::CommitDeferred { xid, .. }
            | Error::Rollback { xid, .. }
            | Error::Backend { xid, .. } => Some(xid),
            _ => None,
        }
    }
}

impl From<XaFault> for Error {
    fn from(fault: XaFault) -> Self {
        Error::Connection(fault)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::State(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::State(value.to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(value: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ActorPatternRecv(value.to_string())
    }
}
