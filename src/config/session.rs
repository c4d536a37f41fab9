//! Session lifecycle configuration
//!
//! ```toml
//! [session]
//! connect_timeout_ms = 3000
//! request_timeout_ms = 1000
//! ensure_connected_timeout_ms = 10000
//! jitter = 0.2
//!
//! [session.reconnect]
//! max_retries = 0      # unlimited
//! base_delay_ms = 100
//! max_delay_ms = 10000
//! ```

use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Deadline for a single connect attempt
    ///
    /// Default: 3000
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Deadline for every individual store round trip
    ///
    /// A round trip exceeding it is treated as a transient failure.
    /// Default: 1000
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long `ensure_connected()` waits for a live session
    ///
    /// Default: 10000
    #[serde(default = "default_ensure_connected_timeout_ms")]
    pub ensure_connected_timeout_ms: u64,

    /// Relative jitter applied to every reconnect delay, in `[0, 1)`
    ///
    /// Default: 0.2 (delays vary by +/-20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Reconnect backoff; `max_retries = 0` retries until stopped
    #[serde(default = "default_reconnect")]
    pub reconnect: BackoffPolicy,

    /// Capacity of the lifecycle broadcast channel
    ///
    /// Default: 64
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            ensure_connected_timeout_ms: default_ensure_connected_timeout_ms(),
            jitter: default_jitter(),
            reconnect: default_reconnect(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ensure_connected_timeout(&self) -> Duration {
        Duration::from_millis(self.ensure_connected_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "session: connect_timeout_ms and request_timeout_ms must be greater than 0".into(),
            )));
        }
        if self.ensure_connected_timeout_ms < self.connect_timeout_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "session: ensure_connected_timeout_ms ({}) must be >= connect_timeout_ms ({})",
                self.ensure_connected_timeout_ms, self.connect_timeout_ms
            ))));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config(ConfigError::Message(format!(
                "session: jitter must be in [0, 1), got {}",
                self.jitter
            ))));
        }
        if self.event_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "session: event_buffer_size must be greater than 0".into(),
            )));
        }
        self.reconnect.validate("session.reconnect")
    }
}

fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_request_timeout_ms() -> u64 {
    1000
}
fn default_ensure_connected_timeout_ms() -> u64 {
    10_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_reconnect() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        base_delay_ms: 100,
        max_delay_ms: 10_000,
    }
}
fn default_event_buffer_size() -> usize {
    64
}
