//! Orchestration configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default size of the prekey batch generated at first initialization.
pub const DEFAULT_INITIAL_PREKEY_COUNT: usize = 50;

/// Default threshold below which prekeys should be replenished.
pub const DEFAULT_PREKEY_LOW_WATER_MARK: usize = 10;

/// Default per-call timeout for key directory requests (10 seconds).
pub const DEFAULT_CLAIM_TIMEOUT_MS: u64 = 10_000;

/// Tunables for a [`crate::CryptoRouter`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// One-time prekeys generated when a fresh identity is created.
    pub initial_prekey_count: usize,

    /// `needs_replenishment` fires when unconsumed prekeys drop below this.
    pub prekey_low_water_mark: usize,

    /// Timeout applied to every key directory call, in milliseconds.
    pub claim_timeout_ms: u64,

    /// Retry a directory call once after a transient network failure.
    pub retry_network_errors: bool,

    /// When set, a device with no prekeys left is claimed once more after
    /// this delay. Unset means exhausted devices are skipped immediately.
    pub exhausted_retry_delay_ms: Option<u64>,
}

impl CryptoConfig {
    /// Directory call timeout.
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    /// Delay before re-claiming an exhausted device, if enabled.
    pub fn exhausted_retry_delay(&self) -> Option<Duration> {
        self.exhausted_retry_delay_ms.map(Duration::from_millis)
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            initial_prekey_count: DEFAULT_INITIAL_PREKEY_COUNT,
            prekey_low_water_mark: DEFAULT_PREKEY_LOW_WATER_MARK,
            claim_timeout_ms: DEFAULT_CLAIM_TIMEOUT_MS,
            retry_network_errors: true,
            exhausted_retry_delay_ms: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CryptoConfig::default();
        assert_eq!(config.initial_prekey_count, 50);
        assert_eq!(config.prekey_low_water_mark, 10);
        assert_eq!(config.claim_timeout(), Duration::from_secs(10));
        assert!(config.retry_network_errors);
        assert_eq!(config.exhausted_retry_delay(), None);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let mut encoded = Vec::new();
        ciborium::into_writer(
            &ciborium::Value::Map(vec![(
                ciborium::Value::Text("exhausted_retry_delay_ms".to_string()),
                ciborium::Value::Integer(250.into()),
            )]),
            &mut encoded,
        )
        .unwrap();

        let config: CryptoConfig = ciborium::from_reader(encoded.as_slice()).unwrap();
        assert_eq!(config.exhausted_retry_delay(), Some(Duration::from_millis(250)));
        assert_eq!(config.initial_prekey_count, DEFAULT_INITIAL_PREKEY_COUNT);
    }
}
