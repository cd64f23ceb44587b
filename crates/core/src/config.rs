use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::GateError;

/// Concurrency used when none is configured or the configured value is unusable.
pub const DEFAULT_QUEUE_CONCURRENCY: usize = 10;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_usize(key: &str) -> Option<usize> {
    let raw = env_opt(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring non-numeric config override");
            None
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_QUEUE_CONCURRENCY
}

fn resolve_concurrency(configured: usize) -> usize {
    if configured == 0 {
        warn!(
            "queue concurrency 0 is not usable, falling back to {}",
            DEFAULT_QUEUE_CONCURRENCY
        );
        DEFAULT_QUEUE_CONCURRENCY
    } else {
        configured
    }
}

// ── Top-level config ──────────────────────────────────────────

/// Configuration for task queues and batches.
///
/// Parsed from TOML or built from environment variables. Environment
/// variables always win over file values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl GateConfig {
    /// Build config from defaults plus environment variables
    /// (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Parse config from a TOML string, then apply env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self, GateError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GateError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply `GATE_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_usize("GATE_QUEUE_CONCURRENCY") {
            self.queue.concurrency = v;
        }
        if let Some(v) = env_usize("GATE_BATCH_CONCURRENCY") {
            self.batch.concurrency = v;
        }
        if let Some(v) = env_usize("GATE_BATCH_MAX_QUEUE_LENGTH") {
            self.batch.max_queue_length = Some(v);
        }
    }

    /// Log the effective settings at startup.
    pub fn log_summary(&self) {
        tracing::info!("Gate config loaded:");
        tracing::info!("  queue:  concurrency={}", self.queue.resolved_concurrency());
        tracing::info!(
            "  batch:  concurrency={}, max_queue_length={}",
            self.batch.queue().resolved_concurrency(),
            self.batch.resolved_max_queue_length()
        );
    }
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of tasks running at once. 0 = default.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl QueueConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self { concurrency }
    }

    /// Concurrency after applying the fallback for unusable values.
    pub fn resolved_concurrency(&self) -> usize {
        resolve_concurrency(self.concurrency)
    }
}

// ── Batch ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Concurrency of the queue owned by the batch. 0 = default.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Submissions wait while the queue holds this many tasks.
    /// Absent or 0 = the queue's concurrency.
    #[serde(default)]
    pub max_queue_length: Option<usize>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_queue_length: None,
        }
    }
}

impl BatchConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            max_queue_length: None,
        }
    }

    pub fn max_queue_length(mut self, max_queue_length: usize) -> Self {
        self.max_queue_length = Some(max_queue_length);
        self
    }

    /// Config for the queue the batch runs its tasks on.
    pub fn queue(&self) -> QueueConfig {
        QueueConfig::with_concurrency(self.concurrency)
    }

    pub fn resolved_max_queue_length(&self) -> usize {
        match self.max_queue_length {
            Some(n) if n > 0 => n,
            _ => self.queue().resolved_concurrency(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = GateConfig::default();
        assert_eq!(config.queue.concurrency, DEFAULT_QUEUE_CONCURRENCY);
        assert_eq!(config.batch.concurrency, DEFAULT_QUEUE_CONCURRENCY);
        assert_eq!(config.batch.max_queue_length, None);
    }

    #[test]
    fn zero_concurrency_falls_back() {
        assert_eq!(
            QueueConfig::with_concurrency(0).resolved_concurrency(),
            DEFAULT_QUEUE_CONCURRENCY
        );
        assert_eq!(QueueConfig::with_concurrency(3).resolved_concurrency(), 3);
    }

    #[test]
    fn max_queue_length_defaults_to_concurrency() {
        assert_eq!(BatchConfig::with_concurrency(4).resolved_max_queue_length(), 4);
        assert_eq!(
            BatchConfig::with_concurrency(4)
                .max_queue_length(0)
                .resolved_max_queue_length(),
            4
        );
        assert_eq!(
            BatchConfig::with_concurrency(4)
                .max_queue_length(1)
                .resolved_max_queue_length(),
            1
        );
        assert_eq!(
            BatchConfig::with_concurrency(0).resolved_max_queue_length(),
            DEFAULT_QUEUE_CONCURRENCY
        );
    }

    #[test]
    fn parse_toml() {
        let toml = r#"
[queue]
concurrency = 3

[batch]
concurrency = 2
max_queue_length = 1
"#;
        // toml::from_str skips env overrides, so GATE_* in the environment can't leak in.
        let config: GateConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.concurrency, 3);
        assert_eq!(config.batch.concurrency, 2);
        assert_eq!(config.batch.resolved_max_queue_length(), 1);
    }

    #[test]
    fn parse_empty_toml_uses_defaults() {
        let config: GateConfig = toml::from_str("").unwrap();
        assert_eq!(config.queue.concurrency, DEFAULT_QUEUE_CONCURRENCY);
        assert_eq!(config.batch.max_queue_length, None);
    }

    #[test]
    fn parse_invalid_toml() {
        let err = GateConfig::from_toml("[queue]\nconcurrency = \"many\"").unwrap_err();
        assert!(matches!(err, GateError::ConfigParse(_)));
    }

    #[test]
    fn missing_file() {
        let err = GateConfig::from_file("/nonexistent/gate.toml").unwrap_err();
        assert!(matches!(err, GateError::ConfigIo(_)));
    }

    #[test]
    fn env_usize_ignores_garbage() {
        std::env::set_var("GATE_TEST_ENV_USIZE_GARBAGE", "lots");
        assert_eq!(env_usize("GATE_TEST_ENV_USIZE_GARBAGE"), None);
        std::env::set_var("GATE_TEST_ENV_USIZE_OK", " 7 ");
        assert_eq!(env_usize("GATE_TEST_ENV_USIZE_OK"), Some(7));
        assert_eq!(env_usize("GATE_TEST_ENV_USIZE_UNSET"), None);
    }
}
