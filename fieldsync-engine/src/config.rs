//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs exposed to the embedding application.
///
/// All fields have conservative defaults suitable for a mobile client on an
/// unreliable link; applications typically override only `cache_time` and
/// `max_attempts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// Time-to-live for cached query results.
    #[serde(with = "duration_ms")]
    pub cache_time: Duration,
    /// Upper bound on a single network fetch or send attempt.
    #[serde(with = "duration_ms")]
    pub network_timeout: Duration,
    /// Refresh stale cache entries in the background while the caller is
    /// served the stale value.
    pub enable_background_refresh: bool,
    /// Retry ceiling for a single mutation before it is parked as errored.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    /// Cap applied to the computed backoff delay.
    #[serde(with = "duration_ms")]
    pub backoff_cap: Duration,
}

// Serialize Duration as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            cache_time: Duration::from_secs(5 * 60),
            network_timeout: Duration::from_secs(10),
            enable_background_refresh: true,
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl SyncEngineConfig {
    /// Backoff delay before the next retry of a mutation that has already
    /// been attempted `attempts` times: `base * 2^attempts`, capped.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts.min(16)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map(|d| d.min(self.backoff_cap))
            .unwrap_or(self.backoff_cap)
    }
}
