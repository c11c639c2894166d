//! Unused-key report: leaves of the merged config that no code reads.
//!
//! Usually a typo (`max_inflight`) or a stale key left in an overlay.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-pointer prefixes the consumer reads. Keep in step with `ConsumerSettings`.
pub const CONSUMED_POINTERS: &[&str] = &[
    "/database/url_env",
    "/database/max_connections",
    "/consumer/max_in_flight",
    "/consumer/lock_lease_secs",
    "/queue/max_delivery_attempts",
    "/queue/redelivery_delay_ms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    /// Sorted, de-duplicated.
    pub consumed_prefixes: Vec<String>,
    /// Sorted.
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Under `Fail`, a non-clean report is returned as `CONFIG_UNUSED_KEYS`.
pub fn report_unused_keys(config_json: &Value, policy: UnusedKeyPolicy) -> Result<UnusedKeyReport> {
    let mut consumed_prefixes: Vec<String> =
        CONSUMED_POINTERS.iter().map(|p| normalize(p)).collect();
    consumed_prefixes.sort();
    consumed_prefixes.dedup();

    let mut unused: Vec<String> = crate::leaves(config_json)
        .into_iter()
        .map(|(ptr, _)| ptr)
        .filter(|ptr| !consumed_prefixes.iter().any(|c| covers(c, ptr)))
        .collect();
    unused.sort();
    unused.dedup();

    let report = UnusedKeyReport {
        consumed_prefixes,
        unused_leaf_pointers: unused,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        let shown: Vec<&str> = report
            .unused_leaf_pointers
            .iter()
            .take(12)
            .map(String::as_str)
            .collect();
        bail!(
            "CONFIG_UNUSED_KEYS: {} config key(s) not read by the consumer: {}",
            report.unused_leaf_pointers.len(),
            shown.join(", ")
        );
    }

    Ok(report)
}

/// Leading `/`, no trailing `/` (except the root pointer itself).
fn normalize(p: &str) -> String {
    let trimmed = p.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// `/a/b` covers `/a/b` and `/a/b/c`, not `/a/bc`. `/` covers everything.
fn covers(prefix: &str, leaf: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match leaf.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
