use std::fmt;

use msc_db::TargetKey;
use msc_schemas::DecodeError;

/// Why a single message could not be processed.
///
/// Every variant is terminal for the current delivery attempt only: the
/// delivery loop nacks and the queue decides when to redeliver.
#[derive(Debug)]
pub enum ProcessError {
    /// The payload could not be decoded. Redelivery of the same bytes fails again.
    Decode(DecodeError),
    /// Another handler holds the target's lock.
    LockHeld { key: TargetKey },
    /// Storage collaborator failure (connectivity, constraint, commit).
    Storage(anyhow::Error),
}

impl ProcessError {
    /// Stable label used in logs and delivery reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::Decode(_) => "decode",
            ProcessError::LockHeld { .. } => "lock_contention",
            ProcessError::Storage(_) => "storage",
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Decode(e) => write!(f, "decode error: {e}"),
            ProcessError::LockHeld { key } => {
                write!(f, "could not acquire lock for IP {} and port {}", key.ip, key.port)
            }
            ProcessError::Storage(e) => write!(f, "storage error: {e:#}"),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Decode(e) => Some(e),
            ProcessError::LockHeld { .. } => None,
            ProcessError::Storage(e) => Some(e.as_ref()),
        }
    }
}

impl From<DecodeError> for ProcessError {
    fn from(e: DecodeError) -> Self {
        ProcessError::Decode(e)
    }
}
