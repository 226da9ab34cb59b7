use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Idempotency guard timing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a record is honoured before it is ignored and purged
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Budget for the guarded operation; exceeding it fails the record
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// How long a duplicate waits for an in-flight owner
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Storage poll cadence while waiting (covers owners in other processes)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A PENDING record older than this is presumed abandoned
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            operation_timeout_ms: default_operation_timeout_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_ms: default_lease_ms(),
        }
    }
}

impl IdempotencyConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_ms as i64)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_operation_timeout_ms() -> u64 {
    30_000
}

fn default_wait_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_lease_ms() -> u64 {
    60_000
}
