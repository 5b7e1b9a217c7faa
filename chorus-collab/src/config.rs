//! Centralized timing and capacity knobs for the collaboration core.
//!
//! Every timeout, interval and threshold used by the lock manager, the
//! protocol handler and the sweeper lives here, so deployments tune one
//! struct instead of chasing constants across modules.

use std::time::Duration;

/// Collaboration core configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// Lease TTL for document locks. Bounds staleness when a holder
    /// crashes without releasing.
    pub lock_ttl: Duration,
    /// How long a submitter waits for the document lock before giving up
    /// with a retryable error. Must stay below any transport-level deadline.
    pub lock_acquire_timeout: Duration,
    /// Pause between lock acquisition attempts.
    pub lock_retry_interval: Duration,
    /// Catch-up requests with more pending operations than this receive a
    /// full snapshot instead of an incremental replay.
    pub catch_up_threshold: usize,
    /// Base interval between cleanup sweeps.
    pub sweep_interval: Duration,
    /// Maximum uniform jitter added to each sweep interval, so multiple
    /// server processes do not sweep in lock-step.
    pub sweep_jitter: Duration,
    /// Broadcast channel capacity per document (messages buffered per
    /// lagging receiver before drops).
    pub broadcast_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            lock_acquire_timeout: Duration::from_secs(30),
            lock_retry_interval: Duration::from_millis(100),
            catch_up_threshold: 100,
            sweep_interval: Duration::from_secs(300),
            sweep_jitter: Duration::from_secs(30),
            broadcast_capacity: 256,
        }
    }
}

impl CollabConfig {
    /// Tight timings for tests: short TTLs, fast retries, small thresholds.
    pub fn for_testing() -> Self {
        Self {
            lock_ttl: Duration::from_secs(2),
            lock_acquire_timeout: Duration::from_millis(500),
            lock_retry_interval: Duration::from_millis(10),
            catch_up_threshold: 10,
            sweep_interval: Duration::from_millis(100),
            sweep_jitter: Duration::from_millis(20),
            broadcast_capacity: 64,
        }
    }
}
