use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_gateway::DispatcherConfig;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub call_timeout: Duration,
    pub history_limit: usize,
    pub max_record_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            host: "0.0.0.0".into(),
            port: 5000,
            db_path: PathBuf::from("parley.db"),
            call_timeout: dispatcher.call_timeout,
            history_limit: dispatcher.history_limit,
            max_record_bytes: dispatcher.max_record_bytes,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys keep their defaults, as do
    /// values that fail to parse (with a warning).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("PARLEY_HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PARLEY_PORT", defaults.port),
            db_path: lookup("PARLEY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            call_timeout: Duration::from_secs(parsed(
                &lookup,
                "PARLEY_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )),
            history_limit: parsed(&lookup, "PARLEY_HISTORY_LIMIT", defaults.history_limit),
            max_record_bytes: parsed(
                &lookup,
                "PARLEY_MAX_RECORD_BYTES",
                defaults.max_record_bytes,
            ),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            call_timeout: self.call_timeout,
            history_limit: self.history_limit,
            max_record_bytes: self.max_record_bytes,
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid {}={:?} ({}), using {}", key, raw, e, default);
                default
            }
        },
    }
}
