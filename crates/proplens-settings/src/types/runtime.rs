//! Transport, monitor and RPC tuning.

use std::time::Duration;

use proplens_core::BackoffPolicy;
use proplens_core::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS,
};
use serde::{Deserialize, Serialize};

/// Realtime socket settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// Upper bound for the TCP/TLS/WebSocket handshake.
    pub connect_timeout_ms: u64,
    /// Keepalive interval assumed when `connection_ack` carries none.
    pub default_keepalive_ms: u64,
    /// Floor for the keepalive check period.
    pub min_keepalive_check_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            default_keepalive_ms: 300_000,
            min_keepalive_check_ms: 1000,
        }
    }
}

impl TransportSettings {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Job monitor settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    /// Retries for submission and for resubscription.
    pub max_retries: u32,
    /// Base delay between retries.
    pub retry_delay_ms: u64,
    /// Growth factor for reconnect delays.
    pub reconnect_backoff_multiplier: f64,
    /// Cap for a single reconnect delay.
    pub max_reconnect_delay_ms: u64,
    /// Maximum silence on a job subscription before it is recycled.
    pub subscription_timeout_ms: u64,
    /// Delay between a terminal update and subscription teardown.
    pub teardown_grace_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            reconnect_backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_reconnect_delay_ms: DEFAULT_MAX_DELAY_MS,
            subscription_timeout_ms: 300_000,
            teardown_grace_ms: 1000,
        }
    }
}

impl MonitorSettings {
    /// Backoff shared by submission retries and resubscription.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.retry_delay_ms,
            self.reconnect_backoff_multiplier,
            self.max_reconnect_delay_ms,
        )
    }

    /// Subscription timeout as a [`Duration`].
    pub fn subscription_timeout(&self) -> Duration {
        Duration::from_millis(self.subscription_timeout_ms)
    }

    /// Teardown grace as a [`Duration`].
    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// GraphQL HTTP client settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSettings {
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl RpcSettings {
    /// Request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
