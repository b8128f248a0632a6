use std::{env, fmt::Display, fs::read_to_string, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

pub const DEFAULT_SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Sqlite,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend {other:?}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionBackend {
    Redis,
    Memory,
}

impl FromStr for SessionBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown session backend {other:?}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub sqlite_path: String,
    pub session_backend: SessionBackend,
    pub session_ttl: Duration,
    pub session_cookie: String,
    pub cookie_secure: bool,
    pub required_org: String,
    pub github_api_url: String,
    pub membership_cache_capacity: u64,
    pub proposal_slugs: Option<Vec<String>>,
    pub allowed_origin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            store_backend: StoreBackend::Memory,
            redis_url: "redis://redis:6379".to_string(),
            sqlite_path: "dachs.db".to_string(),
            session_backend: SessionBackend::Memory,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            session_cookie: "dachs_session".to_string(),
            cookie_secure: true,
            required_org: "dachs-dev".to_string(),
            github_api_url: "https://api.github.com".to_string(),
            membership_cache_capacity: 10_000,
            proposal_slugs: None,
            allowed_origin: "http://localhost:3000".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let store_backend: StoreBackend = try_load("STORE_BACKEND", "redis")?;
        let default_sessions = match store_backend {
            StoreBackend::Redis => "redis",
            _ => "memory",
        };

        Ok(Self {
            port: try_load("RUST_PORT", "1111")?,
            store_backend,
            redis_url: read_secret("REDIS_URL", "redis://redis:6379"),
            sqlite_path: try_load("SQLITE_PATH", "dachs.db")?,
            session_backend: try_load("SESSION_BACKEND", default_sessions)?,
            session_ttl: Duration::from_secs(try_load(
                "SESSION_TTL_SECS",
                &DEFAULT_SESSION_TTL_SECS.to_string(),
            )?),
            session_cookie: try_load("SESSION_COOKIE", "dachs_session")?,
            cookie_secure: try_load("COOKIE_SECURE", "true")?,
            required_org: try_load("REQUIRED_ORG", "dachs-dev")?,
            github_api_url: try_load("GITHUB_API_URL", "https://api.github.com")?,
            membership_cache_capacity: try_load("MEMBERSHIP_CACHE_CAPACITY", "10000")?,
            proposal_slugs: var("PROPOSAL_SLUGS").ok().map(|raw| split_list(&raw)),
            allowed_origin: try_load("ALLOWED_ORIGIN", "http://localhost:3000")?,
        })
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        warn!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e| anyhow!("Invalid {key} value: {e}"))
        .context("Environment misconfigured!")
}

/// Docker secret first, then the environment, then the default.
fn read_secret(secret_name: &str, default: &str) -> String {
    let path = format!("/run/secrets/{secret_name}");

    read_to_string(&path)
        .map(|s| s.trim().to_string())
        .or_else(|e| {
            info!("No {secret_name} secret file ({e}), falling back to environment");
            var(secret_name)
        })
        .unwrap_or_else(|_| default.to_string())
}

pub fn split_list(raw: &str) -> Vec<String> {
    let mut items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();

    items.sort();
    items.dedup();

    items
}
