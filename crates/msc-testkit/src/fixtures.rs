//! Wire-format scan messages, as a scanner would publish them.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::json;

/// V1 message: `response` is carried base64-encoded.
pub fn scan_message_v1(
    ip: &str,
    port: u16,
    service: &str,
    timestamp: i64,
    response: &[u8],
) -> Vec<u8> {
    json!({
        "ip": ip,
        "port": port,
        "service": service,
        "timestamp": timestamp,
        "data_version": 1,
        "data": { "response_bytes_utf8": STANDARD.encode(response) },
    })
    .to_string()
    .into_bytes()
}

/// V2 message: `response` is carried as a plain string.
pub fn scan_message_v2(
    ip: &str,
    port: u16,
    service: &str,
    timestamp: i64,
    response: &str,
) -> Vec<u8> {
    json!({
        "ip": ip,
        "port": port,
        "service": service,
        "timestamp": timestamp,
        "data_version": 2,
        "data": { "response_str": response },
    })
    .to_string()
    .into_bytes()
}
