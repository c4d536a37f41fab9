use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Result;

/// Optimistic write policy for [`crate::ConfigWriter`]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WriterConfig {
    /// Retries after a version conflict before `ConflictError` is returned
    ///
    /// 0 gives up on the first conflict. Default: 5
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: usize,

    /// Small delay between conflicting attempts
    #[serde(default = "default_conflict_backoff")]
    pub conflict_backoff: BackoffPolicy,

    /// Retry policy for transient (connection) failures
    #[serde(default = "default_transient")]
    pub transient: BackoffPolicy,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: default_max_conflict_retries(),
            conflict_backoff: default_conflict_backoff(),
            transient: default_transient(),
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<()> {
        self.conflict_backoff.validate("writer.conflict_backoff")?;
        self.transient.validate("writer.transient")
    }
}

fn default_max_conflict_retries() -> usize {
    5
}
fn default_conflict_backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        base_delay_ms: 5,
        max_delay_ms: 100,
    }
}
fn default_transient() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 5,
        base_delay_ms: 50,
        max_delay_ms: 2000,
    }
}
