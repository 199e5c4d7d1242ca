//! Static capability declaration of the driver.
//!
//! Built once from configuration and validated at startup. Lookups never
//! fail; an unsupported value is reported as a [`Support`] variant that the
//! caller checks before issuing a request.

use std::collections::BTreeSet;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{AccessMode, Capacity};

pub const DRIVER_NAME: &str = "fsx.csi.aws.com";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default claim size: the smallest SCRATCH_1 file system.
pub const DEFAULT_CLAIM_SIZE: Capacity = Capacity::from_gib(3600);

/// Feature flags a driver can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Data survives pod restarts
    Persistence,
    /// Files on the volume can be executed
    Exec,
    /// Several pods on one node may use the volume
    MultiPods,
    /// ReadWriteMany access mode
    Rwx,
    /// Raw block volumes
    Block,
    /// Volume snapshots
    Snapshot,
    /// Online expansion
    ControllerExpansion,
}

impl Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Persistence => "persistence",
            Capability::Exec => "exec",
            Capability::MultiPods => "multiPods",
            Capability::Rwx => "rwx",
            Capability::Block => "block",
            Capability::Snapshot => "snapshot",
            Capability::ControllerExpansion => "controllerExpansion",
        };
        f.write_str(name)
    }
}

/// Result of a capability lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Support {
    Supported,
    UnsupportedFsType(String),
    UnsupportedMountOption(String),
}

impl Support {
    pub fn is_supported(&self) -> bool {
        matches!(self, Support::Supported)
    }
}

/// Capability section of the driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapabilityConfig {
    pub driver_name: String,
    pub supported_fs_types: BTreeSet<String>,
    pub supported_mount_options: BTreeSet<String>,
    pub capabilities: BTreeSet<Capability>,
    pub claim_size: String,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            driver_name: DRIVER_NAME.to_string(),
            // "" selects the driver default file system
            supported_fs_types: ["", "lustre"].into_iter().map(String::from).collect(),
            supported_mount_options: ["flock"].into_iter().map(String::from).collect(),
            capabilities: [
                Capability::Persistence,
                Capability::Exec,
                Capability::MultiPods,
                Capability::Rwx,
            ]
            .into_iter()
            .collect(),
            claim_size: DEFAULT_CLAIM_SIZE.to_string(),
        }
    }
}

/// Validated, immutable capability set.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    driver_name: String,
    fs_types: BTreeSet<String>,
    mount_options: BTreeSet<String>,
    capabilities: BTreeSet<Capability>,
    claim_size: Capacity,
}

impl CapabilityDescriptor {
    /// Validate `config` and freeze it.
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        validate_driver_name(&config.driver_name)?;

        let claim_size: Capacity = config.claim_size.parse().map_err(|e| {
            Error::terminal("InvalidConfiguration", format!("claimSize: {}", e))
        })?;
        if claim_size.bytes() == 0 {
            return Err(Error::terminal(
                "InvalidConfiguration",
                "claimSize must be positive",
            ));
        }

        if config.capabilities.contains(&Capability::MultiPods)
            && !config.capabilities.contains(&Capability::Persistence)
        {
            return Err(Error::terminal(
                "InvalidConfiguration",
                "multiPods requires persistence",
            ));
        }

        if config.supported_fs_types.is_empty() {
            return Err(Error::terminal(
                "InvalidConfiguration",
                "at least one filesystem type must be supported",
            ));
        }

        Ok(Self {
            driver_name: config.driver_name.clone(),
            fs_types: config.supported_fs_types.clone(),
            mount_options: config.supported_mount_options.clone(),
            capabilities: config.capabilities.clone(),
            claim_size,
        })
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn claim_size(&self) -> Capacity {
        self.claim_size
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.capabilities.iter().copied()
    }

    /// Check a filesystem type and, optionally, one mount option.
    pub fn supports(&self, fs_type: &str, mount_option: Option<&str>) -> Support {
        if !self.fs_types.contains(fs_type) {
            return Support::UnsupportedFsType(fs_type.to_string());
        }
        match mount_option {
            Some(option) if !self.mount_options.contains(option) => {
                Support::UnsupportedMountOption(option.to_string())
            }
            _ => Support::Supported,
        }
    }

    /// Check every mount option of a request, reporting the first unsupported one.
    pub fn supports_mount_options(&self, options: &[String]) -> Support {
        options
            .iter()
            .find(|o| !self.mount_options.contains(o.as_str()))
            .map(|o| Support::UnsupportedMountOption(o.clone()))
            .unwrap_or(Support::Supported)
    }

    pub fn supports_access_mode(&self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::ReadWriteOnce => true,
            AccessMode::ReadOnlyMany => self.has(Capability::MultiPods),
            AccessMode::ReadWriteMany => self.has(Capability::Rwx),
        }
    }
}

/// CSI driver names follow DNS naming: lowercase labels separated by dots.
fn validate_driver_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.contains('.')
        && name.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(Error::terminal(
            "InvalidConfiguration",
            format!("invalid driver name '{}'", name),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new(&CapabilityConfig::default()).unwrap()
    }

    #[test]
    fn test_default_descriptor() {
        let caps = descriptor();
        assert_eq!(caps.driver_name(), "fsx.csi.aws.com");
        assert_eq!(caps.claim_size(), Capacity::from_gib(3600));
        assert!(caps.has(Capability::Persistence));
        assert!(caps.has(Capability::Exec));
        assert!(caps.has(Capability::MultiPods));
        assert!(caps.has(Capability::Rwx));
        assert!(!caps.has(Capability::Snapshot));
        assert_eq!(caps.capabilities().count(), 4);
    }

    #[test]
    fn test_supports_lookup() {
        let caps = descriptor();
        assert_eq!(caps.supports("", None), Support::Supported);
        assert_eq!(caps.supports("", Some("flock")), Support::Supported);
        assert_eq!(caps.supports("lustre", Some("flock")), Support::Supported);
        assert_eq!(
            caps.supports("ext4", None),
            Support::UnsupportedFsType("ext4".to_string())
        );
        assert_eq!(
            caps.supports("", Some("noatime")),
            Support::UnsupportedMountOption("noatime".to_string())
        );
    }

    #[test]
    fn test_supports_mount_options() {
        let caps = descriptor();
        assert!(caps.supports_mount_options(&[]).is_supported());
        assert!(caps.supports_mount_options(&["flock".to_string()]).is_supported());
        assert_eq!(
            caps.supports_mount_options(&["flock".to_string(), "localflock".to_string()]),
            Support::UnsupportedMountOption("localflock".to_string())
        );
    }

    #[test]
    fn test_access_modes_follow_capabilities() {
        let caps = descriptor();
        assert!(caps.supports_access_mode(AccessMode::ReadWriteOnce));
        assert!(caps.supports_access_mode(AccessMode::ReadWriteMany));

        let config = CapabilityConfig {
            capabilities: [Capability::Persistence].into_iter().collect(),
            ..CapabilityConfig::default()
        };
        let caps = CapabilityDescriptor::new(&config).unwrap();
        assert!(caps.supports_access_mode(AccessMode::ReadWriteOnce));
        assert!(!caps.supports_access_mode(AccessMode::ReadWriteMany));
        assert!(!caps.supports_access_mode(AccessMode::ReadOnlyMany));
    }

    #[test]
    fn test_invalid_configurations() {
        let bad_name = CapabilityConfig {
            driver_name: "FSx_Driver".to_string(),
            ..CapabilityConfig::default()
        };
        assert!(CapabilityDescriptor::new(&bad_name).is_err());

        let multi_without_persistence = CapabilityConfig {
            capabilities: [Capability::MultiPods].into_iter().collect(),
            ..CapabilityConfig::default()
        };
        let err = CapabilityDescriptor::new(&multi_without_persistence).unwrap_err();
        assert!(err.to_string().contains("multiPods"));

        let bad_size = CapabilityConfig {
            claim_size: "lots".to_string(),
            ..CapabilityConfig::default()
        };
        assert!(CapabilityDescriptor::new(&bad_size).is_err());

        let no_fs = CapabilityConfig {
            supported_fs_types: BTreeSet::new(),
            ..CapabilityConfig::default()
        };
        assert!(CapabilityDescriptor::new(&no_fs).is_err());
    }

    #[test]
    fn test_capability_config_deserialize() {
        let config: CapabilityConfig = serde_json::from_str(
            r#"{"capabilities": ["persistence", "rwx"], "supportedMountOptions": ["flock", "noatime"]}"#,
        )
        .unwrap();
        assert_eq!(config.driver_name, DRIVER_NAME);
        assert!(config.capabilities.contains(&Capability::Rwx));
        assert!(config.supported_mount_options.contains("noatime"));
    }
}
