use std::time::Duration;

use sitx_common::types::RowKey;
use sitx_engine::{SiConfig, SiEngine};

/// Engine configuration with short waits so background machinery is
/// observable within test timeouts.
pub fn test_config() -> SiConfig {
    SiConfig {
        keep_alive_interval: Duration::from_millis(10),
        transaction_timeout: Duration::from_millis(50),
        keep_alive_threads: 2,
        read_resolver_threads: 2,
        rollforward_first_wait: Duration::from_millis(5),
        rollforward_second_wait: Duration::from_millis(10),
        rollforward_first_threads: 2,
        rollforward_second_threads: 1,
        rollforward_retries: 500,
        ..Default::default()
    }
}

pub fn create_test_engine() -> SiEngine {
    SiEngine::in_memory(test_config())
}

pub fn row(key: &str) -> RowKey {
    RowKey::from(key)
}

pub fn value(v: &str) -> Vec<u8> {
    v.as_bytes().to_vec()
}
