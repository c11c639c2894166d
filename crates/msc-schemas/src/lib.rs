use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod decode;

pub use decode::{decode, DecodeError};

/// Earliest accepted observation time: 4714-11-24 00:00:00 UTC BC, the floor
/// of SQL timestamp columns.
pub const MIN_TIMESTAMP: i64 = -210_866_803_200;

/// Wire envelope of a scan result message as published on the queue.
///
/// `data` is kept opaque here; its shape depends on `data_version` and is
/// resolved into a [`ScanPayload`] by [`decode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEnvelope {
    pub ip: String,
    pub port: u16,
    pub service: String,
    /// Observation time as UTC epoch seconds.
    pub timestamp: i64,
    pub data_version: i64,
    /// Absent `data` decodes as null so an unknown version is still reported
    /// as such.
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataVersion {
    V1,
    V2,
}

impl DataVersion {
    pub fn as_i64(&self) -> i64 {
        match self {
            DataVersion::V1 => 1,
            DataVersion::V2 => 2,
        }
    }
}

impl TryFrom<i64> for DataVersion {
    type Error = DecodeError;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(DataVersion::V1),
            2 => Ok(DataVersion::V2),
            other => Err(DecodeError::UnknownVersion(other)),
        }
    }
}

/// Version-specific `data` sub-document, exactly as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPayload {
    /// Raw response bytes, base64-encoded.
    V1 { response_bytes_utf8: String },
    /// Response already decoded to text.
    V2 { response_str: String },
}

impl ScanPayload {
    pub fn version(&self) -> DataVersion {
        match self {
            ScanPayload::V1 { .. } => DataVersion::V1,
            ScanPayload::V2 { .. } => DataVersion::V2,
        }
    }
}

/// A fully decoded scan observation for one (ip, port) target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRecord {
    pub ip: String,
    pub port: u16,
    pub service: String,
    pub timestamp: i64,
    pub data_version: DataVersion,
    pub payload: ScanPayload,
    /// Textual service response extracted from `payload`. Never contains NUL:
    /// those bytes are replaced with U+FFFD, the same as invalid UTF-8.
    pub response: String,
}

impl ScanRecord {
    /// Observation time. Decoding guarantees the timestamp is representable.
    pub fn observed_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(self.timestamp, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}
