use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_EMBEDDING_API_BASE: &str = "http://127.0.0.1:8092";
const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
const DEFAULT_EMBEDDING_DIM: usize = 768;
const DEFAULT_INGEST_WORKERS: usize = 4;
const DEFAULT_INGEST_MAX_ATTEMPTS: i32 = 3;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_STALE_AFTER_SECS: u64 = 600;
const DEFAULT_CHUNK_MAX_TOKENS: usize = 512;
const DEFAULT_MAX_DOCUMENT_BYTES: usize = 5 * 1024 * 1024;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    Local,
    Dev,
    Preview,
    Prod,
}

impl std::str::FromStr for AppMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(AppMode::Local),
            "dev" => Ok(AppMode::Dev),
            "preview" => Ok(AppMode::Preview),
            "prod" => Ok(AppMode::Prod),
            _ => Err(()),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub app_mode: AppMode,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub embedding_api_base: String,
    pub embedding_api_key: Option<String>,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub ingest_workers: usize,
    pub ingest_max_attempts: i32,
    pub ingest_poll_interval: Duration,
    pub ingest_stale_after: Duration,
    pub chunk_max_tokens: usize,
    pub max_document_bytes: usize,
}

// Secrets stay out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("app_mode", &self.app_mode)
            .field("port", &self.port)
            .field("database_url", &"[REDACTED]")
            .field("jwt_secret", &"[REDACTED]")
            .field("embedding_api_base", &self.embedding_api_base)
            .field(
                "embedding_api_key",
                &self.embedding_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("embedding_model", &self.embedding_model)
            .field("embedding_dim", &self.embedding_dim)
            .field("ingest_workers", &self.ingest_workers)
            .field("ingest_max_attempts", &self.ingest_max_attempts)
            .field("ingest_poll_interval", &self.ingest_poll_interval)
            .field("ingest_stale_after", &self.ingest_stale_after)
            .field("chunk_max_tokens", &self.chunk_max_tokens)
            .field("max_document_bytes", &self.max_document_bytes)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source. `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let app_mode = match get("APP_MODE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "APP_MODE",
                value,
            })?,
            None => AppMode::Local,
        };

        let embedding_api_base = get("EMBEDDING_API_BASE")
            .unwrap_or_else(|| DEFAULT_EMBEDDING_API_BASE.to_string());
        if url::Url::parse(&embedding_api_base).is_err() {
            return Err(ConfigError::Invalid {
                name: "EMBEDDING_API_BASE",
                value: embedding_api_base,
            });
        }

        Ok(Config {
            app_mode,
            port: parse_or(&get, "PORT", DEFAULT_PORT)?,
            database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            jwt_secret: get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?,
            embedding_api_base,
            embedding_api_key: get("EMBEDDING_API_KEY"),
            embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            embedding_dim: positive(&get, "EMBEDDING_DIM", DEFAULT_EMBEDDING_DIM)?,
            ingest_workers: positive(&get, "INGEST_WORKERS", DEFAULT_INGEST_WORKERS)?,
            ingest_max_attempts: positive(
                &get,
                "INGEST_MAX_ATTEMPTS",
                DEFAULT_INGEST_MAX_ATTEMPTS,
            )?,
            ingest_poll_interval: Duration::from_secs(positive(
                &get,
                "INGEST_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            ingest_stale_after: Duration::from_secs(positive(
                &get,
                "INGEST_STALE_AFTER_SECS",
                DEFAULT_STALE_AFTER_SECS,
            )?),
            chunk_max_tokens: positive(&get, "CHUNK_MAX_TOKENS", DEFAULT_CHUNK_MAX_TOKENS)?,
            max_document_bytes: positive(&get, "MAX_DOCUMENT_BYTES", DEFAULT_MAX_DOCUMENT_BYTES)?,
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn positive<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + ToString,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        });
    }
    Ok(value)
}
