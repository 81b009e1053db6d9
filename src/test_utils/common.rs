use bytes::Bytes;

use crate::BackoffPolicy;
use crate::GridConfig;

/// Short timeouts and tight backoff so protocol tests finish quickly.
pub fn test_config() -> GridConfig {
    let mut config = GridConfig::default();
    config.retry.protocol = BackoffPolicy {
        max_retries: 20,
        timeout_ms: 200,
        base_delay_ms: 1,
        max_delay_ms: 20,
    };
    config.retry.invalidation = BackoffPolicy {
        max_retries: 3,
        timeout_ms: 100,
        base_delay_ms: 1,
        max_delay_ms: 10,
    };
    config.retry.messenger = config.retry.protocol;
    config.backup.flush_interval_ms = 5;
    config.backup.ack_timeout_ms = 100;
    config
}

pub fn bytes(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}
