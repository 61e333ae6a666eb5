//! Runtime configuration for the change feed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tunables for the change feed, stored at `<dir>/feed-config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Rows per revision page.
    pub page_size: usize,
    /// Rows per logical-sync batch.
    pub sync_batch_size: usize,
    /// Delay between logical-sync page fetches, in milliseconds.
    pub sync_pacing_ms: u64,
    /// Retry policy for conflicting writes.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: 250,
            sync_batch_size: 250,
            sync_pacing_ms: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Load feed config from a data directory, falling back to defaults.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join("feed-config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read feed config from {:?}", config_path))?;
        let config: FeedConfig =
            serde_json::from_str(&data).with_context(|| "Failed to parse feed config JSON")?;
        Ok(config)
    }

    /// Save feed config to a data directory.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join("feed-config.json");
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}

/// Backoff policy for write-conflict retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Base backoff in milliseconds; attempt N waits N times this.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_ms: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = FeedConfig::default();
        assert_eq!(config.page_size, 250);
        assert_eq!(config.sync_batch_size, 250);
        assert_eq!(config.sync_pacing_ms, 10);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn test_load_missing_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = FeedConfig::load(tmp.path()).unwrap();
        assert_eq!(config.page_size, 250);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let config = FeedConfig {
            page_size: 16,
            sync_batch_size: 3,
            sync_pacing_ms: 1,
            retry: RetryConfig {
                max_retries: 2,
                backoff_ms: 5,
            },
        };
        config.save(tmp.path()).unwrap();

        let loaded = FeedConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.page_size, 16);
        assert_eq!(loaded.sync_batch_size, 3);
        assert_eq!(loaded.retry.max_retries, 2);
    }
}
