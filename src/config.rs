use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::hash::HashAlgorithm;

/// Longest lease a pool will hand out.
pub const MAX_LEASE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Pool configuration.
///
/// Build it with [`PoolConfigBuilder`] or load it from JSON, where durations
/// are given in milliseconds:
///
/// ```json
/// { "lease_ttl_ms": 30000, "sweep_interval_ms": 1000, "algorithm": { "name": "blake3" } }
/// ```
#[derive(Builder, Debug, Clone, Serialize, Deserialize)]
#[builder(pattern = "owned", default)]
#[serde(default)]
pub struct PoolConfig {
    /// How long a unit stays claimed before it is reclaimed.
    #[serde(rename = "lease_ttl_ms", with = "millis")]
    pub lease_ttl: Duration,
    /// How often expired leases are scanned.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// How long an idle session waits before re-checking for work on its own.
    #[serde(rename = "retry_interval_ms", with = "millis")]
    pub retry_interval: Duration,
    pub algorithm: HashAlgorithm,
    #[builder(setter(strip_option))]
    pub max_difficulty: Option<u32>,
    /// Maximum number of units the store holds.
    pub capacity: usize,
    pub completion_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(5),
            algorithm: HashAlgorithm::default(),
            max_difficulty: None,
            capacity: usize::MAX,
            completion_buffer: 1024,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.lease_ttl.is_zero() {
            return Err(Error::InvalidConfig("lease_ttl must be > 0".into()));
        }
        if self.lease_ttl > MAX_LEASE_TTL {
            return Err(Error::InvalidConfig(format!(
                "lease_ttl must not exceed {MAX_LEASE_TTL:?}"
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::InvalidConfig("sweep_interval must be > 0".into()));
        }
        if self.sweep_interval > self.lease_ttl {
            return Err(Error::InvalidConfig(
                "sweep_interval must not exceed lease_ttl".into(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(Error::InvalidConfig("retry_interval must be > 0".into()));
        }
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be >= 1".into()));
        }
        if self.completion_buffer == 0 {
            return Err(Error::InvalidConfig(
                "completion_buffer must be >= 1".into(),
            ));
        }
        if let Some(max) = self.max_difficulty {
            if max > self.algorithm.output_bits() {
                return Err(Error::InvalidConfig(format!(
                    "max_difficulty {max} exceeds {} output bits",
                    self.algorithm.name()
                )));
            }
        }
        Ok(())
    }

    /// Highest difficulty the pool will accept from the producer.
    pub fn difficulty_limit(&self) -> u32 {
        let bits = self.algorithm.output_bits();
        self.max_difficulty.map_or(bits, |max| max.min(bits))
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

impl PoolConfigBuilder {
    pub fn build_validated(self) -> Result<PoolConfig, Error> {
        let config = self
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{ser::Error as _, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis())
            .map_err(|_| S::Error::custom(format!("{value:?} does not fit in u64 milliseconds")))?;
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
