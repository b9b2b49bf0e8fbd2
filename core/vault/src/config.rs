//! Operational configuration and on-disk layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use casevault_common::{Error, Result};
use casevault_crypto::stream::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Vault metadata directory inside the case root.
pub const VAULT_DIRNAME: &str = ".casevault";

/// Manifest file name in the vault directory.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Journal file name in the vault directory.
pub const JOURNAL_FILENAME: &str = "journal.jsonl";

/// Backup directory name in the vault directory.
pub const BACKUP_DIRNAME: &str = "backup";

/// Advisory lock file name in the vault directory.
pub const LOCK_FILENAME: &str = "lock";

/// Prefix of every temporary file the vault creates.
pub const TEMP_PREFIX: &str = ".cvtmp-";

/// Environment variable overriding the idle timeout, in minutes.
pub const ENV_SESSION_TIMEOUT: &str = "CASEVAULT_SESSION_TIMEOUT";
/// Environment variable overriding the streaming threshold, in bytes.
pub const ENV_STREAMING_THRESHOLD: &str = "CASEVAULT_STREAMING_THRESHOLD";
/// Environment variable overriding the worker count.
pub const ENV_WORKERS: &str = "CASEVAULT_WORKERS";
/// Environment variable overriding the directory for materialized plaintext.
pub const ENV_TEMP_DIR: &str = "CASEVAULT_TEMP_DIR";

/// Operational settings. Nothing here is persisted in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Idle timeout; `None` keeps the session until an explicit lock.
    pub session_timeout: Option<Duration>,
    /// Payloads at or above this size use streaming mode.
    pub streaming_threshold: u64,
    /// Plaintext bytes per streaming chunk.
    pub chunk_size: usize,
    /// Bound of the migration worker pool.
    pub workers: usize,
    /// Top-level names that are never encrypted.
    pub exclude: Vec<String>,
    /// Where materialized plaintext is placed; system temp dir if `None`.
    pub temp_dir: Option<PathBuf>,
    /// Retry policy for per-file I/O.
    pub retry: RetryConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            session_timeout: Some(Duration::from_secs(30 * 60)),
            streaming_threshold: 64 * 1024,
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 4,
            exclude: vec![".git".to_string(), "__pycache__".to_string()],
            temp_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Set the idle timeout.
    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the streaming threshold.
    pub fn with_streaming_threshold(mut self, bytes: u64) -> Self {
        self.streaming_threshold = bytes;
        self
    }

    /// Set the streaming chunk size.
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the worker pool bound.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Add a top-level name to exclude.
    pub fn with_exclude(mut self, name: impl Into<String>) -> Self {
        self.exclude.push(name.into());
        self
    }

    /// Set the directory for materialized plaintext.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Apply `CASEVAULT_*` environment overrides.
    ///
    /// # Errors
    /// - Returns error if a variable is set but not parseable
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(minutes) = lookup(ENV_SESSION_TIMEOUT) {
            let minutes: u64 = parse_var(ENV_SESSION_TIMEOUT, &minutes)?;
            self.session_timeout = match minutes {
                0 => None,
                m => Some(Duration::from_secs(m * 60)),
            };
        }
        if let Some(bytes) = lookup(ENV_STREAMING_THRESHOLD) {
            self.streaming_threshold = parse_var(ENV_STREAMING_THRESHOLD, &bytes)?;
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = parse_var(ENV_WORKERS, &workers)?;
        }
        if let Some(dir) = lookup(ENV_TEMP_DIR) {
            self.temp_dir = Some(PathBuf::from(dir));
        }
        Ok(self)
    }

    /// Check values that would make operations fail later.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidInput("workers must be at least 1".to_string()));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk_size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("{} has an invalid value: {}", name, value)))
}

/// Paths of the vault's own files under a case root.
#[derive(Debug, Clone)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.root.join(VAULT_DIRNAME)
    }

    pub fn manifest(&self) -> PathBuf {
        self.vault_dir().join(MANIFEST_FILENAME)
    }

    pub fn journal(&self) -> PathBuf {
        self.vault_dir().join(JOURNAL_FILENAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.vault_dir().join(BACKUP_DIRNAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.vault_dir().join(LOCK_FILENAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = VaultConfig::default();
        assert_eq!(config.session_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.streaming_threshold, 65536);
        assert_eq!(config.workers, 4);
        assert!(config.exclude.contains(&".git".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SESSION_TIMEOUT, "0"),
            (ENV_STREAMING_THRESHOLD, "1024"),
            (ENV_WORKERS, "2"),
            (ENV_TEMP_DIR, "/run/user/1000"),
        ]
        .into_iter()
        .collect();

        let config = VaultConfig::default()
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.session_timeout, None);
        assert_eq!(config.streaming_threshold, 1024);
        assert_eq!(config.workers, 2);
        assert_eq!(config.temp_dir, Some(PathBuf::from("/run/user/1000")));
    }

    #[test]
    fn test_invalid_env_value() {
        let result = VaultConfig::default().apply_overrides(|name| {
            (name == ENV_WORKERS).then(|| "many".to_string())
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: VaultConfig = serde_json::from_str(r#"{"workers": 8}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        assert!(VaultConfig::default().with_workers(0).validate().is_err());
        assert!(VaultConfig::default().with_chunk_size(0).validate().is_err());
    }

    #[test]
    fn test_layout() {
        let layout = VaultLayout::new("/cases/a");
        assert_eq!(layout.manifest(), PathBuf::from("/cases/a/.casevault/manifest.json"));
        assert_eq!(layout.journal(), PathBuf::from("/cases/a/.casevault/journal.jsonl"));
    }
}
