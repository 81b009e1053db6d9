use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

/// Basic retry policy template
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Single attempt timeout (unit: milliseconds)
    #[serde(default = "default_op_timeout_ms")]
    pub timeout_ms: u64,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl BackoffPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Exponential delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay(
        &self,
        attempt: u32,
    ) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(invalid(format!("retry.{name}.timeout_ms must be at least 1ms")));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(format!(
                "retry.{name}.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Divide strategies by exchange kind
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryPolicies {
    /// GET/GETX/DEL exchanges with item owners
    #[serde(default)]
    pub protocol: BackoffPolicy,

    /// INV rounds waiting for INVACK from sharers
    #[serde(default)]
    pub invalidation: BackoffPolicy,

    /// Messenger MSG/MSGACK delivery
    #[serde(default)]
    pub messenger: BackoffPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            protocol: BackoffPolicy {
                max_retries: 10,
                timeout_ms: 500,
                base_delay_ms: 5,
                max_delay_ms: 500,
            },
            invalidation: BackoffPolicy {
                max_retries: 5,
                timeout_ms: 300,
                base_delay_ms: 5,
                max_delay_ms: 200,
            },
            messenger: BackoffPolicy {
                max_retries: 10,
                timeout_ms: 500,
                base_delay_ms: 10,
                max_delay_ms: 1000,
            },
        }
    }
}

impl RetryPolicies {
    pub fn validate(&self) -> Result<()> {
        self.protocol.validate("protocol")?;
        self.invalidation.validate("invalidation")?;
        self.messenger.validate("messenger")?;
        Ok(())
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_op_timeout_ms() -> u64 {
    100
}
fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    1000
}
