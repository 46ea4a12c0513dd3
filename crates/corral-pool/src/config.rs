//! Pool configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a managed-connection pool
///
/// Controls pool sizing, caller wait timeouts, and the background reaping
/// policy (idle, aged, and in-use time limits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Minimum number of connections the reaper leaves in the pool
    min_size: usize,
    /// Maximum number of connections allowed in the pool
    max_size: usize,
    /// Timeout in milliseconds when acquiring a connection from the pool
    acquire_timeout_ms: u64,
    /// Interval in milliseconds between background reap runs
    reap_interval_ms: u64,
    /// Idle time in milliseconds after which a free connection is reaped
    unused_timeout_ms: u64,
    /// Maximum lifetime in milliseconds before a connection is retired
    aged_timeout_ms: Option<u64>,
    /// Maximum time in milliseconds a connection may stay checked out
    max_in_use_time_ms: Option<u64>,
    /// Whether slow driver teardown is offloaded to a background worker
    async_teardown: bool,
}

impl PoolConfig {
    /// Create a new pool configuration with the given min and max sizes
    ///
    /// # Panics
    ///
    /// Panics if `min_size > max_size` or if `max_size` is 0.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        assert!(
            max_size > 0,
            "max_size must be greater than 0, got {}",
            max_size
        );
        assert!(
            min_size <= max_size,
            "min_size ({}) cannot exceed max_size ({})",
            min_size,
            max_size
        );

        Self {
            min_size,
            max_size,
            acquire_timeout_ms: 30_000,   // 30 seconds default
            reap_interval_ms: 180_000,    // 3 minutes default
            unused_timeout_ms: 1_800_000, // 30 minutes default
            aged_timeout_ms: None,
            max_in_use_time_ms: None,
            async_teardown: true,
        }
    }

    /// Set the acquire timeout in milliseconds
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    /// Set the background reap interval in milliseconds
    pub fn with_reap_interval_ms(mut self, interval_ms: u64) -> Self {
        self.reap_interval_ms = interval_ms;
        self
    }

    /// Set the idle timeout in milliseconds
    pub fn with_unused_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.unused_timeout_ms = timeout_ms;
        self
    }

    /// Set the maximum connection lifetime in milliseconds
    pub fn with_aged_timeout_ms(mut self, lifetime_ms: u64) -> Self {
        self.aged_timeout_ms = Some(lifetime_ms);
        self
    }

    /// Set the maximum in-use time in milliseconds
    pub fn with_max_in_use_time_ms(mut self, limit_ms: u64) -> Self {
        self.max_in_use_time_ms = Some(limit_ms);
        self
    }

    /// Enable or disable asynchronous teardown
    pub fn with_async_teardown(mut self, async_teardown: bool) -> Self {
        self.async_teardown = async_teardown;
        self
    }

    /// Get the minimum pool size
    pub fn min_size(&self) -> usize {
        self.min_size
    }

    /// Get the maximum pool size
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Get the acquire timeout as a Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Get the reap interval as a Duration
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Get the idle timeout as a Duration
    pub fn unused_timeout(&self) -> Duration {
        Duration::from_millis(self.unused_timeout_ms)
    }

    /// Get the maximum lifetime as a Duration if set
    pub fn aged_timeout(&self) -> Option<Duration> {
        self.aged_timeout_ms.map(Duration::from_millis)
    }

    /// Get the maximum in-use time as a Duration if set
    pub fn max_in_use_time(&self) -> Option<Duration> {
        self.max_in_use_time_ms.map(Duration::from_millis)
    }

    /// Whether teardown is offloaded to a background worker
    pub fn async_teardown(&self) -> bool {
        self.async_teardown
    }
}

impl Default for PoolConfig {
    /// Create a default pool configuration
    ///
    /// Defaults:
    /// - min_size: 1
    /// - max_size: 10
    /// - acquire_timeout: 30 seconds
    /// - reap_interval: 3 minutes
    /// - unused_timeout: 30 minutes
    /// - aged_timeout: None
    /// - max_in_use_time: None
    /// - async_teardown: true
    fn default() -> Self {
        Self::new(1, 10)
    }
}
