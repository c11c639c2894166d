//! Runtime secret resolution.
//!
//! Config stores only the env var NAME for the database URL. The value is
//! resolved once at start-up; error messages reference the NAME, never the
//! value, and `Debug` redacts it.

use anyhow::{bail, Result};

use crate::ConsumerSettings;

#[derive(Clone)]
pub struct ResolvedDatabaseUrl {
    env_name: String,
    url: String,
}

impl ResolvedDatabaseUrl {
    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub fn expose(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for ResolvedDatabaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedDatabaseUrl")
            .field("env_name", &self.env_name)
            .field("url", &"<REDACTED>")
            .finish()
    }
}

/// Resolve the database URL from the env var named by `database.url_env`.
pub fn resolve_database_url(settings: &ConsumerSettings) -> Result<ResolvedDatabaseUrl> {
    resolve_with(settings, |name| std::env::var(name).ok())
}

fn resolve_with(
    settings: &ConsumerSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedDatabaseUrl> {
    let env_name = settings.database.url_env.clone();
    match lookup(&env_name) {
        Some(url) if !url.trim().is_empty() => Ok(ResolvedDatabaseUrl { env_name, url }),
        _ => bail!("SECRET_MISSING: env var {env_name} is not set or empty"),
    }
}
