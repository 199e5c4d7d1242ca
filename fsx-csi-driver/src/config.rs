//! Driver configuration.
//!
//! Loaded from an optional JSON file. Every field has a default, so an empty
//! object (or no file at all) yields the FSx for Lustre defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityConfig, CapabilityDescriptor};
use crate::retry::RetryPolicy;
use crate::types::Capacity;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Valid file system sizes: `min_gib`, then multiples of `step_gib`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapacityPolicy {
    pub min_gib: u64,
    pub step_gib: u64,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            min_gib: 1200,
            step_gib: 2400,
        }
    }
}

impl CapacityPolicy {
    /// Smallest valid size, in GiB, that holds `requested`.
    pub fn round_up(&self, requested: Capacity) -> u64 {
        let gib = requested.gib_ceil();
        if gib <= self.min_gib {
            self.min_gib
        } else {
            gib.div_ceil(self.step_gib) * self.step_gib
        }
    }
}

/// Readiness polling of newly created file systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            timeout_ms: 15 * 60 * 1000,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DriverConfig {
    pub capabilities: CapabilityConfig,
    pub capacity: CapacityPolicy,
    pub polling: PollingConfig,
    pub retry: RetryPolicy,
}

impl DriverConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: DriverConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.descriptor().map(|_| ())?;

        if self.capacity.min_gib == 0 || self.capacity.step_gib == 0 {
            return Err(ConfigError::Invalid(
                "capacity.minGib and capacity.stepGib must be positive".to_string(),
            ));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling.intervalMs must be positive".to_string(),
            ));
        }
        if self.polling.timeout_ms < self.polling.interval_ms {
            return Err(ConfigError::Invalid(
                "polling.timeoutMs must be at least polling.intervalMs".to_string(),
            ));
        }
        self.retry.validate().map_err(ConfigError::Invalid)
    }

    /// Build the frozen capability set.
    pub fn descriptor(&self) -> Result<CapabilityDescriptor, ConfigError> {
        CapabilityDescriptor::new(&self.capabilities)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DriverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.capacity.min_gib, 1200);
        assert_eq!(config.polling.interval(), Duration::from_secs(15));
    }

    #[test]
    fn test_capacity_rounding() {
        let policy = CapacityPolicy::default();
        assert_eq!(policy.round_up(Capacity::from_gib(1)), 1200);
        assert_eq!(policy.round_up(Capacity::from_gib(1200)), 1200);
        assert_eq!(policy.round_up(Capacity::from_gib(1201)), 2400);
        assert_eq!(policy.round_up(Capacity::from_gib(2400)), 2400);
        assert_eq!(policy.round_up(Capacity::from_gib(3600)), 4800);

        let scratch1 = CapacityPolicy {
            min_gib: 3600,
            step_gib: 3600,
        };
        assert_eq!(scratch1.round_up(Capacity::from_gib(1200)), 3600);
        assert_eq!(scratch1.round_up(Capacity::from_gib(3601)), 7200);
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"polling": {{"intervalMs": 500, "timeoutMs": 5000}}, "retry": {{"maxAttempts": 2}}}}"#
        )
        .unwrap();

        let config = DriverConfig::load(file.path()).unwrap();
        assert_eq!(config.polling.interval(), Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 2);
        // Untouched sections keep their defaults
        assert_eq!(config.capacity, CapacityPolicy::default());
        assert_eq!(config.capabilities, CapabilityConfig::default());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"polling": {{"intervalMs": 1000, "timeoutMs": 10}}}}"#).unwrap();
        assert!(matches!(
            DriverConfig::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            DriverConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));

        assert!(matches!(
            DriverConfig::load(Path::new("/nonexistent/fsx-csi.json")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_invalid_capabilities_fail_validation() {
        let mut config = DriverConfig::default();
        config.capabilities.driver_name = "not a name".to_string();
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.capacity.step_gib = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
