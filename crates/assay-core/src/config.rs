//! Configuration system for assay.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $ASSAY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/assay/config.toml
//!   3. ~/.config/assay/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssayConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub network: NetworkConfig,
    pub container: ContainerConfig,
    pub inference: InferenceConfig,
    pub content: ContentConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database holding queued inference jobs.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_workers: usize,
    /// Sleep between store polls when nothing is queued.
    pub poll_interval_ms: u64,
    /// Retry ceiling for not-found responses.
    pub not_found_retries: u32,
    /// Retry ceiling for server-error responses.
    pub server_error_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    /// Standard deviation of the Gaussian jitter added to each backoff.
    pub backoff_jitter_ms: u64,
    /// Response key holding the primary output file.
    pub primary_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// CLI name used when printing dry-run commands.
    pub cli: String,
    /// Value of the `owner=` node selector.
    pub owner: String,
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub inputs_mount: String,
    pub outputs_mount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary.
    pub runtime: String,
    pub inputs_mount: String,
    pub outputs_mount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Root of the local content-addressed blob store.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub work_dir: PathBuf,
    /// Jobs dispatched at once by the synchronous runner.
    pub concurrency: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("jobs.db"),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            poll_interval_ms: 5_000,
            not_found_retries: 1,
            server_error_retries: 2,
            backoff_base_ms: 2_000,
            backoff_factor: 1.2,
            backoff_jitter_ms: 500,
            primary_key: "pdb".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "bootstrap.production.bacalhau.org".to_string(),
            port: 1234,
            cli: "bacalhau".to_string(),
            owner: "labdao".to_string(),
            poll_interval_ms: 2_000,
            max_poll_attempts: 360,
            inputs_mount: "/inputs".to_string(),
            outputs_mount: "/outputs".to_string(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            inputs_mount: "/inputs".to_string(),
            outputs_mount: "/outputs".to_string(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 600,
        }
    }
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("content"),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/assay-jobs"),
            concurrency: 1,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("assay")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local").join("share"))
        .join("assay")
}

fn home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl AssayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            AssayConfig::default()
        };
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("ASSAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&AssayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply `ASSAY_<SECTION>__<FIELD>` overrides. `lookup` stands in for the
    /// process environment so tests don't have to mutate it.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            })
        }

        macro_rules! override_field {
            ($var:literal, $field:expr, string) => {
                if let Some(v) = lookup($var) {
                    $field = v;
                }
            };
            ($var:literal, $field:expr, path) => {
                if let Some(v) = lookup($var) {
                    $field = PathBuf::from(v);
                }
            };
            ($var:literal, $field:expr, parse) => {
                if let Some(v) = lookup($var) {
                    $field = parsed($var, v)?;
                }
            };
        }

        override_field!("ASSAY_STORE__PATH", self.store.path, path);
        override_field!("ASSAY_QUEUE__MAX_WORKERS", self.queue.max_workers, parse);
        override_field!("ASSAY_QUEUE__POLL_INTERVAL_MS", self.queue.poll_interval_ms, parse);
        override_field!("ASSAY_QUEUE__NOT_FOUND_RETRIES", self.queue.not_found_retries, parse);
        override_field!("ASSAY_QUEUE__SERVER_ERROR_RETRIES", self.queue.server_error_retries, parse);
        override_field!("ASSAY_QUEUE__BACKOFF_BASE_MS", self.queue.backoff_base_ms, parse);
        override_field!("ASSAY_QUEUE__PRIMARY_KEY", self.queue.primary_key, string);
        override_field!("ASSAY_NETWORK__HOST", self.network.host, string);
        override_field!("ASSAY_NETWORK__PORT", self.network.port, parse);
        override_field!("ASSAY_NETWORK__OWNER", self.network.owner, string);
        override_field!("ASSAY_CONTAINER__RUNTIME", self.container.runtime, string);
        override_field!("ASSAY_INFERENCE__BASE_URL", self.inference.base_url, string);
        override_field!("ASSAY_CONTENT__ROOT", self.content.root, path);
        override_field!("ASSAY_RUN__WORK_DIR", self.run.work_dir, path);
        override_field!("ASSAY_RUN__CONCURRENCY", self.run.concurrency, parse);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_queue_policy() {
        let config = AssayConfig::default();
        assert_eq!(config.queue.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.queue.not_found_retries, 1);
        assert_eq!(config.queue.server_error_retries, 2);
        assert_eq!(config.queue.backoff_base_ms, 2_000);
        assert_eq!(config.queue.primary_key, "pdb");
        assert_eq!(config.network.max_poll_attempts, 360);
        assert_eq!(config.network.poll_interval(), Duration::from_secs(2));
        assert_eq!(
            config.network.base_url(),
            "http://bootstrap.production.bacalhau.org:1234"
        );
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = AssayConfig::from_toml(
            r#"
            [queue]
            max_workers = 16

            [container]
            runtime = "podman"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_workers, 16);
        assert_eq!(config.queue.server_error_retries, 2);
        assert_eq!(config.container.runtime, "podman");
        assert_eq!(config.container.inputs_mount, "/inputs");
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("ASSAY_QUEUE__MAX_WORKERS", "8"),
            ("ASSAY_QUEUE__SERVER_ERROR_RETRIES", "5"),
            ("ASSAY_INFERENCE__BASE_URL", "http://gpu:9000"),
            ("ASSAY_STORE__PATH", "/var/lib/assay/jobs.db"),
        ]
        .into_iter()
        .collect();
        let mut config = AssayConfig::default();
        config
            .apply_env_overrides(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.queue.max_workers, 8);
        assert_eq!(config.queue.server_error_retries, 5);
        assert_eq!(config.queue.not_found_retries, 1);
        assert_eq!(config.inference.base_url, "http://gpu:9000");
        assert_eq!(config.store.path, PathBuf::from("/var/lib/assay/jobs.db"));
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut config = AssayConfig::default();
        let err = config
            .apply_env_overrides(|var| (var == "ASSAY_NETWORK__PORT").then(|| "http".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("assay-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("ASSAY_CONFIG", config_path.to_str().unwrap());
        }

        let path = AssayConfig::write_default_if_missing().expect("write_default_if_missing failed");
        assert!(path.exists());
        let config = AssayConfig::load().expect("load should succeed");
        assert_eq!(config.queue.primary_key, "pdb");

        unsafe {
            std::env::remove_var("ASSAY_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
