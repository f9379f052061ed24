//! Configuration for the zarr processor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use storage::RetryPolicy;

/// Tuning knobs for metadata caching, chunk fetching and scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Memory budget for decoded chunks in megabytes.
    pub chunk_cache_size_mb: usize,

    /// Maximum number of chunk fetches one column scan keeps in flight.
    pub fetch_concurrency: usize,

    /// Maximum rows per emitted batch.
    pub batch_rows: u64,

    /// How long parsed metadata documents are reused.
    pub metadata_ttl_secs: u64,

    /// Lifetime of issued access grants.
    pub grant_ttl_secs: u64,

    /// Grants are reissued once fewer than this many seconds remain.
    pub grant_refresh_margin_secs: u64,

    /// Retries after the first attempt for transient store errors.
    pub max_retries: u32,

    pub initial_retry_delay_ms: u64,

    pub max_retry_delay_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            chunk_cache_size_mb: 512,
            fetch_concurrency: 16,
            batch_rows: 65_536,
            metadata_ttl_secs: 300,
            grant_ttl_secs: 3600,
            grant_refresh_margin_secs: 300,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 5_000,
        }
    }
}

impl ProcessorConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Replace fields whose `ZARR_*` variable is set and parses.
    pub fn with_env_overrides(self) -> Self {
        let mut config = self;

        if let Some(size) = env_parse("ZARR_CHUNK_CACHE_SIZE_MB") {
            config.chunk_cache_size_mb = size;
        }
        if let Some(n) = env_parse("ZARR_FETCH_CONCURRENCY") {
            config.fetch_concurrency = n;
        }
        if let Some(rows) = env_parse("ZARR_BATCH_ROWS") {
            config.batch_rows = rows;
        }
        if let Some(secs) = env_parse("ZARR_METADATA_TTL_SECS") {
            config.metadata_ttl_secs = secs;
        }
        if let Some(secs) = env_parse("ZARR_GRANT_TTL_SECS") {
            config.grant_ttl_secs = secs;
        }
        if let Some(secs) = env_parse("ZARR_GRANT_REFRESH_MARGIN_SECS") {
            config.grant_refresh_margin_secs = secs;
        }
        if let Some(n) = env_parse("ZARR_MAX_RETRIES") {
            config.max_retries = n;
        }
        if let Some(ms) = env_parse("ZARR_INITIAL_RETRY_DELAY_MS") {
            config.initial_retry_delay_ms = ms;
        }
        if let Some(ms) = env_parse("ZARR_MAX_RETRY_DELAY_MS") {
            config.max_retry_delay_ms = ms;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_cache_size_mb == 0 {
            return Err("chunk_cache_size_mb must be > 0".to_string());
        }

        if self.fetch_concurrency == 0 {
            return Err("fetch_concurrency must be > 0".to_string());
        }

        if self.batch_rows == 0 {
            return Err("batch_rows must be > 0".to_string());
        }

        if self.grant_ttl_secs == 0 {
            return Err("grant_ttl_secs must be > 0".to_string());
        }

        if self.initial_retry_delay_ms > self.max_retry_delay_ms {
            return Err("initial_retry_delay_ms must not exceed max_retry_delay_ms".to_string());
        }

        Ok(())
    }

    /// Get the chunk cache size in bytes.
    pub fn chunk_cache_size_bytes(&self) -> usize {
        self.chunk_cache_size_mb * 1024 * 1024
    }

    pub fn metadata_ttl(&self) -> Duration {
        Duration::from_secs(self.metadata_ttl_secs)
    }

    pub fn grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grant_ttl_secs)
    }

    pub fn grant_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.grant_refresh_margin_secs)
    }

    /// Retry policy for chunk fetches.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_cache_size_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.grant_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn test_invalid_config() {
        let config = ProcessorConfig {
            fetch_concurrency: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProcessorConfig {
            initial_retry_delay_ms: 10_000,
            max_retry_delay_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config: ProcessorConfig =
            serde_json::from_str(r#"{"batch_rows": 10, "max_retries": 0}"#).unwrap();
        assert_eq!(config.batch_rows, 10);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.fetch_concurrency, 16);
        assert_eq!(config.retry_policy().max_retries, 0);
    }
}
