use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Result;

/// Node bootstrap behaviour for [`crate::NodeRegistry`]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Create missing ancestors (with empty values) before the node itself
    ///
    /// Default: true
    #[serde(default = "default_create_parents")]
    pub create_parents: bool,

    /// Retry policy for transient failures during ensure-exists
    #[serde(default = "default_retry")]
    pub retry: BackoffPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            create_parents: default_create_parents(),
            retry: default_retry(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        self.retry.validate("registry.retry")
    }
}

fn default_create_parents() -> bool {
    true
}
fn default_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 10,
        base_delay_ms: 50,
        max_delay_ms: 2000,
    }
}
