//! Engine configuration and default values

use crate::{Result, SinkError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Fraction of system memory granted to buffers by default
pub const MEMORY_LIMIT_FRACTION: f64 = 0.2;

/// Budget used when system memory cannot be determined (1GB)
pub const FALLBACK_MEMORY_LIMIT: u64 = 1024 * 1024 * 1024;

/// Minimum buffered bytes before a stream is flushed on size alone (10MB)
pub const MIN_BATCH_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum bytes handed to a single flush call (25MB)
pub const MAX_BATCH_BYTES: u64 = 25 * 1024 * 1024;

/// Period of the flush timer
pub const FLUSH_INTERVAL_MS: u64 = 1000;

/// Age after which a non-empty buffer is flushed regardless of size (5 minutes)
pub const MAX_BUFFER_AGE_MS: u64 = 5 * 60 * 1000;

/// Number of flush workers
pub const WORKER_COUNT: usize = 2;

/// Memory usage ratio above which flush thresholds are ignored
pub const MEMORY_PRESSURE_RATIO: f64 = 0.9;

/// Global memory budget, absolute or relative
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLimit {
    /// Absolute number of bytes
    Bytes(u64),
    /// Fraction of total system memory
    Fraction(f64),
}

impl Default for MemoryLimit {
    fn default() -> Self {
        MemoryLimit::Fraction(MEMORY_LIMIT_FRACTION)
    }
}

impl MemoryLimit {
    /// Resolve the limit to a byte count
    pub fn resolve(&self) -> u64 {
        match *self {
            MemoryLimit::Bytes(bytes) => bytes,
            MemoryLimit::Fraction(fraction) => {
                let total = system_memory_bytes().unwrap_or_else(|| {
                    warn!(
                        "Unable to determine system memory, using {} bytes as the base",
                        FALLBACK_MEMORY_LIMIT
                    );
                    FALLBACK_MEMORY_LIMIT
                });
                ((total as f64) * fraction) as u64
            }
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Global buffer memory budget
    pub memory_limit: MemoryLimit,
    /// Size threshold for flushing a stream on size alone
    pub min_batch_bytes: u64,
    /// Upper bound on a single flushed batch
    pub max_batch_bytes: u64,
    /// Timer period waking idle workers
    pub flush_interval_ms: u64,
    /// Time-based fallback for slow streams
    pub max_buffer_age_ms: u64,
    /// Flush worker pool size
    pub worker_count: usize,
    /// Usage ratio that switches the selector to pressure mode
    pub memory_pressure_ratio: f64,
    /// Namespace used for catalog streams that carry none
    pub default_namespace: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_limit: MemoryLimit::default(),
            min_batch_bytes: MIN_BATCH_BYTES,
            max_batch_bytes: MAX_BATCH_BYTES,
            flush_interval_ms: FLUSH_INTERVAL_MS,
            max_buffer_age_ms: MAX_BUFFER_AGE_MS,
            worker_count: WORKER_COUNT,
            memory_pressure_ratio: MEMORY_PRESSURE_RATIO,
            default_namespace: None,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(SinkError::Config("worker_count must be at least 1".into()));
        }
        match self.memory_limit {
            MemoryLimit::Bytes(0) => {
                return Err(SinkError::Config("memory limit must be positive".into()));
            }
            MemoryLimit::Fraction(f) if !(f > 0.0 && f <= 1.0) => {
                return Err(SinkError::Config(format!(
                    "memory fraction must be in (0, 1], got {}",
                    f
                )));
            }
            _ => {}
        }
        if self.max_batch_bytes == 0 {
            return Err(SinkError::Config("max_batch_bytes must be positive".into()));
        }
        if self.min_batch_bytes > self.max_batch_bytes {
            return Err(SinkError::Config(format!(
                "min_batch_bytes ({}) exceeds max_batch_bytes ({})",
                self.min_batch_bytes, self.max_batch_bytes
            )));
        }
        if self.flush_interval_ms == 0 {
            return Err(SinkError::Config("flush_interval_ms must be positive".into()));
        }
        if !(self.memory_pressure_ratio > 0.0 && self.memory_pressure_ratio <= 1.0) {
            return Err(SinkError::Config(format!(
                "memory_pressure_ratio must be in (0, 1], got {}",
                self.memory_pressure_ratio
            )));
        }
        Ok(())
    }

    /// Timer period
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Buffer age fallback
    pub fn max_buffer_age(&self) -> Duration {
        Duration::from_millis(self.max_buffer_age_ms)
    }
}

/// Total physical memory as reported by `/proc/meminfo`
fn system_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flush_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"memory_limit": {"bytes": 4096}, "worker_count": 4}"#).unwrap();
        assert_eq!(config.memory_limit, MemoryLimit::Bytes(4096));
        assert_eq!(config.memory_limit.resolve(), 4096);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.min_batch_bytes, MIN_BATCH_BYTES);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let config = EngineConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SinkError::Config(_))));

        let config = EngineConfig {
            memory_limit: MemoryLimit::Fraction(1.5),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            min_batch_bytes: 100,
            max_batch_bytes: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fraction_resolves_to_positive_budget() {
        assert!(MemoryLimit::Fraction(0.5).resolve() > 0);
    }
}
