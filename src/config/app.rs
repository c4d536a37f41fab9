//! Settings for the `confwatch` demo process
//!
//! ```toml
//! [app]
//! store_address = "127.0.0.1:2181"
//! base_path = "/config"
//! update_interval_ms = 5000
//! value_prefix = "192.168.0."
//!
//! [app.keys]
//! db_url = "127.0.0.1"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::utils::path::validate_path;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// Coordination store address, reported in logs
    #[serde(default = "default_store_address")]
    pub store_address: String,

    /// Parent node holding every configuration key
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Configuration keys under `base_path` and their default values
    #[serde(default = "default_keys")]
    pub keys: BTreeMap<String, String>,

    /// Period of the random-value writer; 0 disables it
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Prefix of the random values pushed by the writer
    #[serde(default = "default_value_prefix")]
    pub value_prefix: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_address: default_store_address(),
            base_path: default_base_path(),
            keys: default_keys(),
            update_interval_ms: default_update_interval_ms(),
            value_prefix: default_value_prefix(),
        }
    }
}

impl AppConfig {
    /// Full node path of `key`
    pub fn key_path(
        &self,
        key: &str,
    ) -> String {
        if self.base_path == "/" {
            format!("/{key}")
        } else {
            format!("{}/{key}", self.base_path)
        }
    }

    /// Writer period, `None` when the writer is disabled
    pub fn update_interval(&self) -> Option<Duration> {
        (self.update_interval_ms > 0).then(|| Duration::from_millis(self.update_interval_ms))
    }

    pub fn validate(&self) -> Result<()> {
        validate_path(&self.base_path)?;
        for key in self.keys.keys() {
            if key.is_empty() || key.contains('/') {
                return Err(Error::Config(ConfigError::Message(format!(
                    "app: invalid key {key:?}, keys must be a single path segment"
                ))));
            }
            validate_path(&self.key_path(key))?;
        }
        Ok(())
    }
}

fn default_store_address() -> String {
    "127.0.0.1:2181".to_string()
}
fn default_base_path() -> String {
    "/config".to_string()
}
fn default_keys() -> BTreeMap<String, String> {
    BTreeMap::from([("db_url".to_string(), "127.0.0.1".to_string())])
}
fn default_update_interval_ms() -> u64 {
    5000
}
fn default_value_prefix() -> String {
    "192.168.0.".to_string()
}
