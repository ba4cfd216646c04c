use std::{env, path::PathBuf, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::{
    readiness::{DEFAULT_POLL_INTERVAL, DEFAULT_READY_TIMEOUT},
    wirer::{DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_BACKOFF},
};

pub const RUN_DIR: &str = "CHAINRIG_RUN_DIR";
pub const READY_TIMEOUT_MS: &str = "CHAINRIG_READY_TIMEOUT_MS";
pub const POLL_INTERVAL_MS: &str = "CHAINRIG_POLL_INTERVAL_MS";
pub const STOP_GRACE_MS: &str = "CHAINRIG_STOP_GRACE_MS";
pub const CONNECT_ATTEMPTS: &str = "CHAINRIG_CONNECT_ATTEMPTS";
pub const CONNECT_BACKOFF_MS: &str = "CHAINRIG_CONNECT_BACKOFF_MS";
pub const SETTLE_MS: &str = "CHAINRIG_SETTLE_MS";
pub const JACK_LSP: &str = "CHAINRIG_JACK_LSP";
pub const JACK_CONNECT: &str = "CHAINRIG_JACK_CONNECT";
pub const JACK_DISCONNECT: &str = "CHAINRIG_JACK_DISCONNECT";
pub const QUERY_TIMEOUT_MS: &str = "CHAINRIG_QUERY_TIMEOUT_MS";

#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads the process environment, seeded from an optional `.env` file.
/// Variables already set in the environment win over the file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        if let Some(path) = env_file.as_ref().filter(|p| p.exists()) {
            dotenvy::from_path(path).ok();
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub run_dir: PathBuf,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub stop_grace: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    /// Pause between configuring and wiring, so hosts can apply commands.
    pub settle: Duration,
    pub jack_lsp: PathBuf,
    pub jack_connect: PathBuf,
    pub jack_disconnect: PathBuf,
    pub query_timeout: Duration,
    /// Keys whose values could not be used, with the offending value.
    pub rejected: Vec<(String, String)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_dir: env::temp_dir().join("chainrig"),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stop_grace: Duration::from_millis(2_000),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_backoff: DEFAULT_CONNECT_BACKOFF,
            settle: Duration::from_millis(200),
            jack_lsp: PathBuf::from("jack_lsp"),
            jack_connect: PathBuf::from("jack_connect"),
            jack_disconnect: PathBuf::from("jack_disconnect"),
            query_timeout: Duration::from_millis(2_000),
            rejected: Vec::new(),
        }
    }
}

impl Settings {
    /// Read every `CHAINRIG_*` key, keeping the default for absent or
    /// unusable values.
    pub async fn resolve(config: &ConfigManager) -> Self {
        let mut settings = Settings::default();
        let mut rejected = Vec::new();

        if let Some(dir) = non_empty(config, RUN_DIR).await {
            settings.run_dir = PathBuf::from(dir);
        }
        for (key, slot, allow_zero) in [
            (READY_TIMEOUT_MS, &mut settings.ready_timeout, false),
            (POLL_INTERVAL_MS, &mut settings.poll_interval, false),
            (STOP_GRACE_MS, &mut settings.stop_grace, true),
            (CONNECT_BACKOFF_MS, &mut settings.connect_backoff, true),
            (SETTLE_MS, &mut settings.settle, true),
            (QUERY_TIMEOUT_MS, &mut settings.query_timeout, false),
        ] {
            if let Some(raw) = non_empty(config, key).await {
                match raw.parse::<u64>() {
                    Ok(ms) if ms > 0 || allow_zero => *slot = Duration::from_millis(ms),
                    _ => rejected.push((key.to_string(), raw)),
                }
            }
        }
        if let Some(raw) = non_empty(config, CONNECT_ATTEMPTS).await {
            match raw.parse::<u32>() {
                Ok(n) if n > 0 => settings.connect_attempts = n,
                _ => rejected.push((CONNECT_ATTEMPTS.to_string(), raw)),
            }
        }
        for (key, slot) in [
            (JACK_LSP, &mut settings.jack_lsp),
            (JACK_CONNECT, &mut settings.jack_connect),
            (JACK_DISCONNECT, &mut settings.jack_disconnect),
        ] {
            if let Some(path) = non_empty(config, key).await {
                *slot = PathBuf::from(path);
            }
        }

        settings.rejected = rejected;
        settings
    }

    /// Log the resolved values. Called once tracing is up.
    pub fn report(&self) {
        for (key, value) in &self.rejected {
            warn!(key = %key, value = %value, "ignoring unusable setting, using the default");
        }
        info!(run_dir = %self.run_dir.display(), "run directory");
        debug!(
            ready_timeout_ms = self.ready_timeout.as_millis() as u64,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            stop_grace_ms = self.stop_grace.as_millis() as u64,
            connect_attempts = self.connect_attempts,
            connect_backoff_ms = self.connect_backoff.as_millis() as u64,
            settle_ms = self.settle.as_millis() as u64,
            "settings"
        );
    }
}

async fn non_empty(config: &ConfigManager, key: &str) -> Option<String> {
    config
        .0
        .get(key)
        .await
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
