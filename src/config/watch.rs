//! Watch engine configuration
//!
//! ```toml
//! [watch]
//! max_rearm_failures = 5
//! subscriber_buffer_size = 32
//!
//! [watch.rearm]
//! base_delay_ms = 50
//! max_delay_ms = 5000
//! ```

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WatchConfig {
    /// Consecutive failed re-arm attempts before `WatchEvent::Degraded` is emitted
    ///
    /// Default: 5
    #[serde(default = "default_max_rearm_failures")]
    pub max_rearm_failures: usize,

    /// Per-subscriber event buffer. Delivery waits when it is full, events are never dropped.
    ///
    /// Default: 32
    #[serde(default = "default_subscriber_buffer_size")]
    pub subscriber_buffer_size: usize,

    /// Delay between failed re-arm attempts. `max_retries` is ignored: a watch keeps
    /// trying until cancelled, reporting degradation through `max_rearm_failures`.
    #[serde(default = "default_rearm")]
    pub rearm: BackoffPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_rearm_failures: default_max_rearm_failures(),
            subscriber_buffer_size: default_subscriber_buffer_size(),
            rearm: default_rearm(),
        }
    }
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_rearm_failures == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch: max_rearm_failures must be greater than 0".into(),
            )));
        }
        if self.subscriber_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch: subscriber_buffer_size must be greater than 0".into(),
            )));
        }
        self.rearm.validate("watch.rearm")
    }
}

fn default_max_rearm_failures() -> usize {
    5
}
fn default_subscriber_buffer_size() -> usize {
    32
}
fn default_rearm() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        base_delay_ms: 50,
        max_delay_ms: 5000,
    }
}
