//! Backing store abstraction.
//!
//! The provisioning core talks to the managed file system service only
//! through [`BackingStore`]. A real cloud client and the in-process
//! [`SimulatedBackingStore`] satisfy the same trait, so the core can be
//! exercised without a live cloud dependency.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Lifecycle;

mod simulated;

pub use simulated::{SimulatedBackingStore, SimulatedConfig};

/// Parameters of a file system create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    /// Idempotency token; repeated creates with the same token return the
    /// same resource.
    pub client_token: String,
    pub capacity_gib: u64,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

/// File system description returned by `describe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystem {
    pub resource_id: String,
    pub lifecycle: Lifecycle,
    pub capacity_gib: u64,
    pub dns_name: String,
    pub mount_name: String,
    /// Set when `lifecycle` is `Failed` or `Misconfigured`.
    pub failure_reason: Option<String>,
}

/// Managed file system control plane.
///
/// Implementations classify their failures: throttling and connectivity
/// problems as [`Error::Transient`](crate::Error::Transient), rejected
/// parameters and quota as [`Error::Terminal`](crate::Error::Terminal),
/// unknown IDs as [`Error::NotFound`](crate::Error::NotFound).
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Submit a create call and return the new resource ID.
    async fn create(&self, params: &CreateParams) -> Result<String>;

    /// Current state of a resource.
    async fn describe(&self, resource_id: &str) -> Result<FileSystem>;

    /// Start deleting a resource.
    async fn delete(&self, resource_id: &str) -> Result<()>;
}
