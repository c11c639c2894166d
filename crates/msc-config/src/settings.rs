//! Typed consumer settings extracted from the merged config document.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_DATABASE_URL_ENV: &str = "MSC_DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConsumerSettings {
    pub database: DatabaseSection,
    pub consumer: ConsumerSection,
    pub queue: QueueSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// Name of the env var holding the connection URL (never the URL itself).
    pub url_env: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url_env: DEFAULT_DATABASE_URL_ENV.to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    /// Upper bound on concurrently processed messages.
    pub max_in_flight: usize,
    /// Age after which a held target lock may be reclaimed. `None` = never.
    pub lock_lease_secs: Option<u64>,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            max_in_flight: 16,
            lock_lease_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_delivery_attempts: u32,
    pub redelivery_delay_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            redelivery_delay_ms: 250,
        }
    }
}

impl ConsumerSettings {
    pub fn from_config_json(v: &Value) -> Result<Self> {
        let s: ConsumerSettings =
            serde_json::from_value(v.clone()).context("invalid consumer settings")?;
        s.validate()?;
        Ok(s)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url_env.trim().is_empty() {
            bail!("database.url_env must name an environment variable");
        }
        if self.database.max_connections == 0 {
            bail!("database.max_connections must be > 0");
        }
        if self.consumer.max_in_flight == 0 {
            bail!("consumer.max_in_flight must be > 0");
        }
        if self.consumer.lock_lease_secs == Some(0) {
            bail!("consumer.lock_lease_secs must be > 0 when set");
        }
        if self.queue.max_delivery_attempts == 0 {
            bail!("queue.max_delivery_attempts must be > 0");
        }
        Ok(())
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        self.consumer.lock_lease_secs.map(Duration::from_secs)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.queue.redelivery_delay_ms)
    }
}
