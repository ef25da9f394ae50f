//! Store configuration.
//!
//! Values can be set with the builder methods or loaded from environment
//! variables with sensible defaults for interactive clients.

use crate::{CacheResult, ConfigError};
use std::time::Duration;

// ============================================================================
// STORE CONFIGURATION
// ============================================================================

/// Tuning knobs for one store instance.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    // ========================================================================
    // Bulk loading
    // ========================================================================
    /// How long single-object fetches for one type are accumulated before
    /// being sent as one batched request.
    pub bulk_load_window: Duration,

    /// Batch size that flushes immediately, without waiting for the window.
    pub bulk_load_max_batch: usize,

    // ========================================================================
    // Revalidation
    // ========================================================================
    /// A non-forced revalidation within this interval of the previous fetch
    /// start is skipped.
    pub dedupe_interval: Duration,

    /// Page size requested by list and link queries when the caller does
    /// not pick one.
    pub default_page_size: Option<u32>,

    // ========================================================================
    // Key lifetime
    // ========================================================================
    /// How long an unreferenced cache key survives before collection.
    pub key_keep_alive: Duration,

    /// How often the background collector runs.
    pub gc_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bulk_load_window: Duration::from_millis(25),
            bulk_load_max_batch: 100,
            dedupe_interval: Duration::ZERO,
            default_page_size: None,
            key_keep_alive: Duration::from_secs(60),
            gc_interval: Duration::from_secs(1),
        }
    }
}

impl StoreConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `LAMINA_BULK_LOAD_WINDOW_MS`: debounce window (default: 25)
    /// - `LAMINA_BULK_LOAD_MAX_BATCH`: flush size (default: 100)
    /// - `LAMINA_DEDUPE_INTERVAL_MS`: revalidation dedupe interval (default: 0)
    /// - `LAMINA_DEFAULT_PAGE_SIZE`: page size for lists (default: unset)
    /// - `LAMINA_KEY_KEEP_ALIVE_SECS`: keep-alive for released keys (default: 60)
    /// - `LAMINA_GC_INTERVAL_MS`: collector period (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bulk_load_window = env_parse::<u64>("LAMINA_BULK_LOAD_WINDOW_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.bulk_load_window);

        let bulk_load_max_batch = env_parse::<usize>("LAMINA_BULK_LOAD_MAX_BATCH")
            .unwrap_or(defaults.bulk_load_max_batch);

        let dedupe_interval = env_parse::<u64>("LAMINA_DEDUPE_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.dedupe_interval);

        let default_page_size =
            env_parse::<u32>("LAMINA_DEFAULT_PAGE_SIZE").or(defaults.default_page_size);

        let key_keep_alive = env_parse::<u64>("LAMINA_KEY_KEEP_ALIVE_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.key_keep_alive);

        let gc_interval = env_parse::<u64>("LAMINA_GC_INTERVAL_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.gc_interval);

        Self {
            bulk_load_window,
            bulk_load_max_batch,
            dedupe_interval,
            default_page_size,
            key_keep_alive,
            gc_interval,
        }
    }

    /// Set the bulk-load debounce window.
    pub fn with_bulk_load_window(mut self, window: Duration) -> Self {
        self.bulk_load_window = window;
        self
    }

    /// Set the bulk-load flush size.
    pub fn with_bulk_load_max_batch(mut self, max: usize) -> Self {
        self.bulk_load_max_batch = max;
        self
    }

    /// Set the revalidation dedupe interval.
    pub fn with_dedupe_interval(mut self, interval: Duration) -> Self {
        self.dedupe_interval = interval;
        self
    }

    /// Set the default page size.
    pub fn with_default_page_size(mut self, size: u32) -> Self {
        self.default_page_size = Some(size);
        self
    }

    /// Set the key keep-alive.
    pub fn with_key_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.key_keep_alive = keep_alive;
        self
    }

    /// Set the collector period.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Reject configurations the store cannot run with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.bulk_load_max_batch == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bulk_load_max_batch".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.gc_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "gc_interval".to_string(),
                value: "0ms".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.default_page_size == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "default_page_size".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1 when set".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
