//! Type-safe wrappers for provisioning requests and records.
//!
//! These types provide compile-time safety for values parsed from
//! StorageClass parameters and claim sizes. Each parseable type implements
//! `FromStr` for parsing at API boundaries.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

static SUBNET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^subnet-[0-9a-f]{8,17}$").expect("valid regex"));
static SECURITY_GROUP_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sg-[0-9a-f]{8,17}$").expect("valid regex"));

/// StorageClass parameter keys.
pub const SUBNET_ID_KEY: &str = "subnetId";
pub const SECURITY_GROUP_IDS_KEY: &str = "securityGroupIds";

/// Get current Unix timestamp in seconds
pub(crate) fn unix_timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Capacity
// ============================================================================

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;
const TIB: u64 = GIB * 1024;

/// A storage size in bytes, parsed from Kubernetes quantities such as `1200Gi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Capacity(u64);

impl Capacity {
    pub const fn from_bytes(bytes: u64) -> Self {
        Capacity(bytes)
    }

    pub const fn from_gib(gib: u64) -> Self {
        Capacity(gib * GIB)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }

    /// Size in GiB, rounded up.
    pub const fn gib_ceil(self) -> u64 {
        self.0.div_ceil(GIB)
    }
}

impl Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 != 0 && self.0 % TIB == 0 {
            write!(f, "{}Ti", self.0 / TIB)
        } else if self.0 % GIB == 0 {
            write!(f, "{}Gi", self.0 / GIB)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for Capacity {
    type Err = CapacityParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, suffix) = trimmed.split_at(split);

        let value = digits
            .parse::<u64>()
            .map_err(|_| CapacityParseError(s.to_string()))?;
        let multiplier = match suffix {
            "" => 1,
            "Ki" => KIB,
            "Mi" => MIB,
            "Gi" => GIB,
            "Ti" => TIB,
            _ => return Err(CapacityParseError(s.to_string())),
        };

        value
            .checked_mul(multiplier)
            .map(Capacity)
            .ok_or_else(|| CapacityParseError(s.to_string()))
    }
}

/// Error returned when parsing an invalid capacity quantity.
#[derive(Debug, Clone)]
pub struct CapacityParseError(String);

impl Display for CapacityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid capacity '{}': expected a number with optional Ki, Mi, Gi or Ti suffix",
            self.0
        )
    }
}

impl std::error::Error for CapacityParseError {}

// ============================================================================
// AccessMode
// ============================================================================

/// How many nodes may mount a volume at once, and with which permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AccessMode {
    /// Exclusive read-write on a single node (RWO)
    ReadWriteOnce,
    /// Read-only on any number of nodes (ROX)
    ReadOnlyMany,
    /// Read-write on any number of nodes (RWX)
    ReadWriteMany,
}

impl AccessMode {
    /// Whether several attachments may reference the volume concurrently.
    pub const fn is_shared(self) -> bool {
        matches!(self, AccessMode::ReadOnlyMany | AccessMode::ReadWriteMany)
    }

    /// Whether an attachment in `self` may coexist with one in `other`.
    pub fn compatible_with(self, other: AccessMode) -> bool {
        self.is_shared() && self == other
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            AccessMode::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            AccessMode::ReadWriteMany => write!(f, "ReadWriteMany"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = AccessModeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "readwriteonce" | "rwo" => Ok(AccessMode::ReadWriteOnce),
            "readonlymany" | "rox" => Ok(AccessMode::ReadOnlyMany),
            "readwritemany" | "rwx" => Ok(AccessMode::ReadWriteMany),
            _ => Err(AccessModeParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid access mode.
#[derive(Debug, Clone)]
pub struct AccessModeParseError(String);

impl Display for AccessModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown access mode '{}': expected ReadWriteOnce, ReadOnlyMany or ReadWriteMany",
            self.0
        )
    }
}

impl std::error::Error for AccessModeParseError {}

// ============================================================================
// VolumeState
// ============================================================================

/// Lifecycle of a volume record. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VolumeState {
    Pending,
    Creating,
    Polling,
    Ready,
    Failed,
}

impl VolumeState {
    pub const ALL: [VolumeState; 5] = [
        VolumeState::Pending,
        VolumeState::Creating,
        VolumeState::Polling,
        VolumeState::Ready,
        VolumeState::Failed,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(self, VolumeState::Ready | VolumeState::Failed)
    }

    /// Allowed edges: Pending→Creating→Polling→Ready, and Creating|Polling→Failed.
    pub const fn can_transition_to(self, next: VolumeState) -> bool {
        matches!(
            (self, next),
            (VolumeState::Pending, VolumeState::Creating)
                | (VolumeState::Creating, VolumeState::Polling)
                | (VolumeState::Polling, VolumeState::Ready)
                | (VolumeState::Creating, VolumeState::Failed)
                | (VolumeState::Polling, VolumeState::Failed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VolumeState::Pending => "pending",
            VolumeState::Creating => "creating",
            VolumeState::Polling => "polling",
            VolumeState::Ready => "ready",
            VolumeState::Failed => "failed",
        }
    }
}

impl Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// File system lifecycle as reported by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Creating,
    Available,
    Failed,
    Deleting,
    Misconfigured,
}

impl Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Creating => write!(f, "CREATING"),
            Lifecycle::Available => write!(f, "AVAILABLE"),
            Lifecycle::Failed => write!(f, "FAILED"),
            Lifecycle::Deleting => write!(f, "DELETING"),
            Lifecycle::Misconfigured => write!(f, "MISCONFIGURED"),
        }
    }
}

// ============================================================================
// VolumeParameters
// ============================================================================

/// Network placement parsed from StorageClass parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeParameters {
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    /// Remaining parameters, passed through to the backing store untouched.
    pub extra: BTreeMap<String, String>,
}

impl VolumeParameters {
    /// Parse StorageClass parameters.
    ///
    /// Accepts `subnetId` (or `subnet_id`) and a comma-delimited
    /// `securityGroupIds` (or `security_group_ids`). Both are required.
    pub fn from_map(parameters: &HashMap<String, String>) -> Result<Self> {
        let subnet_id = parameters
            .get(SUBNET_ID_KEY)
            .or_else(|| parameters.get("subnet_id"))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::terminal("InvalidParameter", "subnetId is required"))?;

        if !SUBNET_ID.is_match(&subnet_id) {
            return Err(Error::terminal(
                "InvalidParameter",
                format!("malformed subnetId '{}'", subnet_id),
            ));
        }

        let security_group_ids: Vec<String> = parameters
            .get(SECURITY_GROUP_IDS_KEY)
            .or_else(|| parameters.get("security_group_ids"))
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if security_group_ids.is_empty() {
            return Err(Error::terminal(
                "InvalidParameter",
                "securityGroupIds is required",
            ));
        }
        if let Some(bad) = security_group_ids
            .iter()
            .find(|sg| !SECURITY_GROUP_ID.is_match(sg))
        {
            return Err(Error::terminal(
                "InvalidParameter",
                format!("malformed security group id '{}'", bad),
            ));
        }

        let extra = parameters
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.as_str(),
                    SUBNET_ID_KEY | "subnet_id" | SECURITY_GROUP_IDS_KEY | "security_group_ids"
                )
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            subnet_id,
            security_group_ids,
            extra,
        })
    }
}

// ============================================================================
// VolumeRequest
// ============================================================================

/// A create request. The name is the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeRequest {
    pub name: String,
    pub capacity: Capacity,
    pub parameters: VolumeParameters,
    pub mount_options: Vec<String>,
    /// Requested filesystem type; empty selects the driver default.
    pub fs_type: String,
}

impl VolumeRequest {
    pub fn new(name: impl Into<String>, capacity: Capacity, parameters: VolumeParameters) -> Self {
        Self {
            name: name.into(),
            capacity,
            parameters,
            mount_options: Vec::new(),
            fs_type: String::new(),
        }
    }

    pub fn with_fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = fs_type.into();
        self
    }

    pub fn with_mount_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mount_options = options.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// VolumeRecord
// ============================================================================

fn serialize_error<S: Serializer>(
    error: &Option<Error>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Provisioning state of one logical volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeRecord {
    pub name: String,
    /// External resource ID, assigned once by the backing store.
    pub resource_id: Option<String>,
    pub state: VolumeState,
    pub created_at: i64,
    pub capacity_gib: u64,
    pub last_status: Option<Lifecycle>,
    /// Values a node needs to mount the file system.
    pub context: BTreeMap<String, String>,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
}

impl VolumeRecord {
    pub fn new(name: impl Into<String>, capacity_gib: u64) -> Self {
        Self {
            name: name.into(),
            resource_id: None,
            state: VolumeState::Pending,
            created_at: unix_timestamp_now(),
            capacity_gib,
            last_status: None,
            context: BTreeMap::new(),
            error: None,
        }
    }

    /// Move to `next`, rejecting any edge that would regress the lifecycle.
    pub fn transition(&mut self, next: VolumeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::terminal(
                "InvalidTransition",
                format!("volume '{}' cannot move from {} to {}", self.name, self.state, next),
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Record the failure and move to `Failed`.
    pub fn fail(&mut self, error: Error) -> Result<()> {
        self.transition(VolumeState::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Assign the external resource ID. Reassigning a different ID is refused.
    pub fn assign_resource_id(&mut self, resource_id: &str) -> Result<()> {
        match &self.resource_id {
            Some(existing) if existing != resource_id => Err(Error::AlreadyBound {
                name: self.name.clone(),
                existing: existing.clone(),
                requested: resource_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.resource_id = Some(resource_id.to_string());
                Ok(())
            }
        }
    }
}

// ============================================================================
// AttachmentRecord
// ============================================================================

/// One node's mount of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
    /// Name of the referenced volume (non-owning).
    pub volume: String,
    pub node_id: String,
    pub access_mode: AccessMode,
    pub mount_path: PathBuf,
    pub attached_at: i64,
}
