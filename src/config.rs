//! Configuration Module
//!
//! Handles loading engine defaults and inspector settings from environment variables.

use std::env;
use std::time::Duration;

/// Engine configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
/// Per-query options override the query defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default stale time in milliseconds (0 = stale-while-revalidate on every read)
    pub default_stale_time_ms: u64,
    /// Default GC time in milliseconds after the last subscriber leaves
    pub default_gc_time_ms: u64,
    /// Default number of automatic retries for transient fetch failures
    pub default_retry_count: u32,
    /// Base delay for exponential retry backoff, in milliseconds
    pub retry_base_delay_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds
    pub retry_max_delay_ms: u64,
    /// Whether observed stale queries refetch when the application regains focus
    pub refetch_on_focus: bool,
    /// Background garbage collection interval in seconds
    pub gc_interval: u64,
    /// Inspector HTTP server port
    pub server_port: u16,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `DEFAULT_STALE_TIME_MS` - Default stale time (default: 0)
    /// - `DEFAULT_GC_TIME_MS` - Default GC time (default: 300000)
    /// - `DEFAULT_RETRY_COUNT` - Automatic retries (default: 3)
    /// - `RETRY_BASE_DELAY_MS` - Backoff base delay (default: 1000)
    /// - `RETRY_MAX_DELAY_MS` - Backoff cap (default: 30000)
    /// - `REFETCH_ON_FOCUS` - Refetch stale observed queries on focus (default: true)
    /// - `GC_INTERVAL` - GC frequency in seconds (default: 1)
    /// - `SERVER_PORT` - Inspector HTTP port (default: 3000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_stale_time_ms: parse_env("DEFAULT_STALE_TIME_MS")
                .unwrap_or(defaults.default_stale_time_ms),
            default_gc_time_ms: parse_env("DEFAULT_GC_TIME_MS")
                .unwrap_or(defaults.default_gc_time_ms),
            default_retry_count: parse_env("DEFAULT_RETRY_COUNT")
                .unwrap_or(defaults.default_retry_count),
            retry_base_delay_ms: parse_env("RETRY_BASE_DELAY_MS")
                .unwrap_or(defaults.retry_base_delay_ms),
            retry_max_delay_ms: parse_env("RETRY_MAX_DELAY_MS")
                .unwrap_or(defaults.retry_max_delay_ms),
            refetch_on_focus: parse_env("REFETCH_ON_FOCUS").unwrap_or(defaults.refetch_on_focus),
            gc_interval: parse_env("GC_INTERVAL").unwrap_or(defaults.gc_interval),
            server_port: parse_env("SERVER_PORT").unwrap_or(defaults.server_port),
        }
    }

    pub fn default_stale_time(&self) -> Duration {
        Duration::from_millis(self.default_stale_time_ms)
    }

    pub fn default_gc_time(&self) -> Duration {
        Duration::from_millis(self.default_gc_time_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_stale_time_ms: 0,
            default_gc_time_ms: 300_000,
            default_retry_count: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            refetch_on_focus: true,
            gc_interval: 1,
            server_port: 3000,
        }
    }
}
