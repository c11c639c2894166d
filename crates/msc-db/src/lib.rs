use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

mod store;
mod targets;

pub use store::{PgTargetStore, TargetStore};
pub use targets::{
    messages_fetch_for_target, observation_record, target_fetch, target_try_lock, target_unlock,
};

pub const ENV_DB_URL: &str = "MSC_DATABASE_URL";

/// Earliest instant a Postgres `timestamptz` can hold: 4714-11-24 00:00:00 UTC BC.
pub const TIMESTAMPTZ_MIN_EPOCH_SECS: i64 = -210_866_803_200;

/// Pool from `MSC_DATABASE_URL`, 10 connections.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("{ENV_DB_URL} is not set"))?;
    connect(&url, 10).await
}

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("postgres connect failed")
}

/// Apply `migrations/` (embedded at build time). Safe to re-run.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("migrate failed")
}

const SCHEMA_TABLES: [&str; 2] = ["targets", "messages"];

/// Round-trips one query, then reports which consumer tables exist.
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let ok: bool = sqlx::query_scalar("select true")
        .fetch_one(pool)
        .await
        .context("status ping failed")?;

    let present: Vec<String> = sqlx::query_scalar(
        "select table_name::text from information_schema.tables \
         where table_schema = current_schema() and table_name = any($1)",
    )
    .bind(&SCHEMA_TABLES[..])
    .fetch_all(pool)
    .await
    .context("status schema lookup failed")?;

    let has = |t: &str| present.iter().any(|p| p == t);
    Ok(DbStatus {
        ok,
        has_targets_table: has("targets"),
        schema_complete: SCHEMA_TABLES.iter().all(|t| has(t)),
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_targets_table: bool,
    /// Both `targets` and `messages` exist.
    pub schema_complete: bool,
}

// ---------------------------------------------------------------------------
// Keys and lock tokens
// ---------------------------------------------------------------------------

/// Natural key of a target row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetKey {
    pub ip: String,
    pub port: u16,
}

impl TargetKey {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Postgres `text` cannot hold NUL.
    pub fn check_storable(&self) -> Result<()> {
        no_nul("ip", &self.ip)
    }
}

impl std::fmt::Display for TargetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Opaque per-acquisition lock token stored in `targets.lock_token`.
///
/// Production code only obtains tokens via [`LockToken::generate`], so two
/// acquisitions never present the same token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build a token with a chosen value, e.g. to present a stale token.
    #[cfg(any(test, feature = "testkit"))]
    pub fn for_test(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single non-blocking lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// Target did not exist; it was inserted already holding the caller's token.
    Created,
    /// Target existed with no holder; the token was set by conditional update.
    Acquired,
    /// Target was held past the configured lease and has been taken over.
    Reclaimed,
    /// Another handler holds the lock.
    Held,
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockAttempt::Held)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockAttempt::Created => "CREATED",
            LockAttempt::Acquired => "ACQUIRED",
            LockAttempt::Reclaimed => "RECLAIMED",
            LockAttempt::Held => "HELD",
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One observed scan message to persist: target upsert + message append.
#[derive(Debug, Clone)]
pub struct NewObservation {
    pub key: TargetKey,
    pub service: String,
    pub observed_at: DateTime<Utc>,
    /// Original message body.
    pub message_content: String,
    /// Decoded textual response.
    pub response: String,
}

impl NewObservation {
    /// Rejects values the schema cannot hold. Every `TargetStore` calls this
    /// before writing, so all stores refuse the same observations.
    pub fn check_storable(&self) -> Result<()> {
        self.key.check_storable()?;
        no_nul("service", &self.service)?;
        no_nul("message_content", &self.message_content)?;
        no_nul("response", &self.response)?;
        if self.observed_at.timestamp() < TIMESTAMPTZ_MIN_EPOCH_SECS {
            bail!("observed_at {} is before the earliest storable timestamp", self.observed_at);
        }
        Ok(())
    }
}

fn no_nul(field: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        bail!("{field} contains a NUL byte");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedObservation {
    pub target_id: i64,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetRow {
    pub id: i64,
    pub ip: String,
    pub port: u16,
    pub service: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub lock_token: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
}

impl TargetRow {
    pub fn is_locked(&self) -> bool {
        self.lock_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRow {
    pub id: i64,
    pub target_id: i64,
    pub message_content: String,
    pub service: String,
    pub response: String,
    pub insertion_time: DateTime<Utc>,
}
