use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{StoreError, StoreResult};

const ENV_PREFIX: &str = "COLLOQUY_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub read_only: bool,
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
    pub connection_timeout_ms: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub worker_threads: usize,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/colloquy.db"),
            read_only: false,
            pool_size: 4,
            busy_timeout_ms: 5_000,
            connection_timeout_ms: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1_000,
            stop_timeout_ms: 5_000,
            worker_threads: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlays `COLLOQUY_*` environment variables on top of this config.
    pub fn apply_env(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        if let Some(path) = var("DB_PATH") {
            self.path = PathBuf::from(path);
        }
        if let Some(read_only) = var("READ_ONLY") {
            self.read_only = matches!(read_only.as_str(), "1" | "true" | "yes");
        }
        if let Some(size) = var("POOL_SIZE").and_then(|v| v.parse().ok()) {
            self.pool_size = size;
        }
        if let Some(size) = var("BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.batch_size = size;
        }
        if let Some(ms) = var("BATCH_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.batch_timeout_ms = ms;
        }
        if let Some(ms) = var("BUSY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.busy_timeout_ms = ms;
        }
        if let Some(workers) = var("WORKER_THREADS").and_then(|v| v.parse().ok()) {
            self.worker_threads = workers;
        }
        if let Some(attempts) = var("RETRY_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.retry.max_attempts = attempts;
        }
        self
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.pool_size == 0 {
            return Err(StoreError::InvalidInput("pool_size must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(StoreError::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.batch_timeout_ms == 0 {
            return Err(StoreError::InvalidInput(
                "batch_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(StoreError::InvalidInput(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(StoreError::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.lock_delay_min_ms > self.retry.lock_delay_max_ms {
            return Err(StoreError::InvalidInput(
                "retry.lock_delay_min_ms exceeds retry.lock_delay_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Backoff settings for transient database failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub lock_delay_min_ms: u64,
    pub lock_delay_max_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lock_delay_min_ms: 500,
            lock_delay_max_ms: 1_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Short randomized pause used when another writer holds the file lock.
    pub fn lock_delay(&self) -> Duration {
        let low = self.lock_delay_min_ms.min(self.lock_delay_max_ms);
        let high = self.lock_delay_max_ms.max(low);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }

    /// `base * 2^attempt` plus up to half a base of jitter, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let exponential = self.backoff_base_ms.saturating_mul(factor);
        let jitter = if self.backoff_base_ms >= 2 {
            rand::thread_rng().gen_range(0..=self.backoff_base_ms / 2)
        } else {
            0
        };
        Duration::from_millis(exponential.saturating_add(jitter).min(self.backoff_cap_ms))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_replace_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("COLLOQUY_DB_PATH", "/tmp/x.db"),
            ("COLLOQUY_BATCH_SIZE", "7"),
            ("COLLOQUY_READ_ONLY", "true"),
            ("COLLOQUY_POOL_SIZE", "not-a-number"),
        ]);
        let config = StoreConfig::default()
            .apply_overrides(|key| vars.get(key).map(|value| value.to_string()));
        assert_eq!(config.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.batch_size, 7);
        assert!(config.read_only);
        assert_eq!(config.pool_size, 4);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("store.json");
        std::fs::write(&file, r#"{"batch_size": 25, "retry": {"max_attempts": 2}}"#).unwrap();
        let config = StoreConfig::from_json_file(&file).unwrap();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.lock_delay_min_ms, 500);
        assert_eq!(config.batch_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let config = StoreConfig::default().with_batch_size(0);
        assert!(matches!(config.validate(), Err(StoreError::InvalidInput(_))));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 4_000,
            ..RetryPolicy::default()
        };
        assert!(policy.backoff_delay(1) >= Duration::from_millis(2_000));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(4_000));
        let lock = policy.lock_delay();
        assert!(lock >= Duration::from_millis(500) && lock <= Duration::from_millis(1_000));
    }
}
