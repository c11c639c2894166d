//! Versioned payload decoding.
//!
//! The envelope is parsed first; the opaque `data` document is then resolved
//! by an exhaustive match on `data_version`. Every failure is terminal for the
//! message: there is no partial record and no retry in here.

use std::fmt;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{DataVersion, ScanEnvelope, ScanPayload, ScanRecord, MIN_TIMESTAMP};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The message is not a JSON envelope with the expected fields and types.
    Envelope(String),
    /// `data_version` does not map to a known payload variant.
    UnknownVersion(i64),
    /// `data` is not a JSON object.
    DataNotObject { version: i64 },
    /// The version-specific field is absent or is not a string.
    MissingField { version: i64, field: &'static str },
    /// V1 `response_bytes_utf8` is not valid standard base64.
    InvalidBase64(String),
    /// `timestamp` is outside `MIN_TIMESTAMP..` or not representable in UTC.
    TimestampOutOfRange(i64),
    /// An identifying envelope field contains a NUL character.
    NulInField(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Envelope(msg) => write!(f, "failed to unmarshal scan data: {msg}"),
            DecodeError::UnknownVersion(v) => write!(f, "unknown data version: {v}"),
            DecodeError::DataNotObject { version } => {
                write!(f, "unexpected data type for V{version} data")
            }
            DecodeError::MissingField { version, field } => {
                write!(f, "failed to extract {field} from V{version} data")
            }
            DecodeError::InvalidBase64(msg) => {
                write!(f, "failed to decode base64 response: {msg}")
            }
            DecodeError::TimestampOutOfRange(ts) => write!(f, "timestamp out of range: {ts}"),
            DecodeError::NulInField(field) => write!(f, "NUL character in {field}"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Version-specific sub-documents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct V1Data {
    response_bytes_utf8: String,
}

#[derive(Deserialize)]
struct V2Data {
    response_str: String,
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Decode one raw queue payload into a [`ScanRecord`].
pub fn decode(raw: &[u8]) -> Result<ScanRecord, DecodeError> {
    let env: ScanEnvelope =
        serde_json::from_slice(raw).map_err(|e| DecodeError::Envelope(e.to_string()))?;

    let data_version = DataVersion::try_from(env.data_version)?;

    if env.ip.contains('\0') {
        return Err(DecodeError::NulInField("ip"));
    }
    if env.service.contains('\0') {
        return Err(DecodeError::NulInField("service"));
    }
    if env.timestamp < MIN_TIMESTAMP
        || DateTime::<Utc>::from_timestamp(env.timestamp, 0).is_none()
    {
        return Err(DecodeError::TimestampOutOfRange(env.timestamp));
    }

    let (payload, response) = decode_payload(data_version, env.data)?;

    Ok(ScanRecord {
        ip: env.ip,
        port: env.port,
        service: env.service,
        timestamp: env.timestamp,
        data_version,
        payload,
        response,
    })
}

fn decode_payload(version: DataVersion, data: Value) -> Result<(ScanPayload, String), DecodeError> {
    if !data.is_object() {
        return Err(DecodeError::DataNotObject {
            version: version.as_i64(),
        });
    }

    match version {
        DataVersion::V1 => {
            let d: V1Data = serde_json::from_value(data).map_err(|_| DecodeError::MissingField {
                version: 1,
                field: "response_bytes_utf8",
            })?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(d.response_bytes_utf8.as_bytes())
                .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;
            let response = without_nul(String::from_utf8_lossy(&bytes).into_owned());
            Ok((
                ScanPayload::V1 {
                    response_bytes_utf8: d.response_bytes_utf8,
                },
                response,
            ))
        }
        DataVersion::V2 => {
            let d: V2Data = serde_json::from_value(data).map_err(|_| DecodeError::MissingField {
                version: 2,
                field: "response_str",
            })?;
            let response = without_nul(d.response_str.clone());
            Ok((
                ScanPayload::V2 {
                    response_str: d.response_str,
                },
                response,
            ))
        }
    }
}

/// Binary banners (MySQL handshakes, TLS alerts) routinely carry NUL.
fn without_nul(s: String) -> String {
    if s.contains('\0') {
        s.replace('\0', "\u{fffd}")
    } else {
        s
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
