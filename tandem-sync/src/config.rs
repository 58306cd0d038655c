//! Provider configuration.

use std::time::Duration;

/// Backoff schedule for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per flush, including the first (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry (default: 250ms)
    pub initial_backoff: Duration,
    /// Upper bound for any single delay (default: 10s)
    pub max_backoff: Duration,
    /// Growth factor between retries (default: 2.0)
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let secs = (self.initial_backoff.as_secs_f64() * factor)
            .min(self.max_backoff.as_secs_f64())
            .max(0.0);
        Duration::from_secs_f64(secs)
    }
}

/// Presence timing.
#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// How often the local entry is re-written (default: 12s)
    pub heartbeat_interval: Duration,
    /// Peers silent for longer than this are dropped (default: 30s)
    pub ttl: Duration,
    /// How often expired peers are swept (default: 5s). A silent peer is
    /// dropped no later than `ttl + sweep_interval` after its last heartbeat.
    pub sweep_interval: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(12),
            ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl AwarenessConfig {
    pub fn for_testing() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration for one [`DocumentProvider`](crate::provider::DocumentProvider).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Document path in the backing store
    pub path: String,
    /// Quiet period after the last local edit before a flush (default: 500ms)
    pub debounce: Duration,
    /// Longest a flush may be postponed by continuous editing (default: 2s)
    pub max_debounce_wait: Duration,
    /// Retry schedule for transient failures
    pub retry: RetryPolicy,
    /// Presence timing
    pub awareness: AwarenessConfig,
    /// LZ4-compress snapshots before chunking (default: true)
    pub compress: bool,
    /// Chunk payload size; `None` derives it from the store's document limit
    pub chunk_size: Option<usize>,
}

impl ProviderConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            debounce: Duration::from_millis(500),
            max_debounce_wait: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            awareness: AwarenessConfig::default(),
            compress: true,
            chunk_size: None,
        }
    }

    /// Short timers for tests.
    pub fn for_testing(path: impl Into<String>) -> Self {
        Self {
            debounce: Duration::from_millis(100),
            max_debounce_wait: Duration::from_millis(400),
            retry: RetryPolicy::for_testing(),
            awareness: AwarenessConfig::for_testing(),
            ..Self::new(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(30), Duration::from_millis(500));
    }

    #[test]
    fn test_provider_defaults() {
        let config = ProviderConfig::new("docs/readme");
        assert_eq!(config.path, "docs/readme");
        assert_eq!(config.debounce, Duration::from_millis(500));
        assert!(config.max_debounce_wait >= config.debounce);
        assert_eq!(config.awareness.heartbeat_interval, Duration::from_secs(12));
        assert_eq!(config.awareness.ttl, Duration::from_secs(30));
        assert!(config.compress);
    }
}
