//! FSx for Lustre CSI provisioning core
//!
//! Coordinates the lifecycle of managed Lustre file systems behind a
//! Kubernetes CSI driver: idempotent create and delete keyed by volume name,
//! background readiness polling, bounded retry of backing-store calls, and
//! access-mode enforcement for node attachments.
//!
//! This library provides:
//! - [`Driver`], the facade the orchestrator-facing layer calls
//! - [`BackingStore`], the seam to the managed file system service, with an
//!   in-process [`SimulatedBackingStore`]
//! - Prometheus metrics and JSON configuration

pub mod attachment;
pub mod backing;
pub mod capability;
pub mod config;
pub mod driver;
pub mod error;
pub mod idempotency;
pub mod metrics;
pub mod provisioner;
pub mod retry;
pub mod types;
pub mod volume_id;

pub use backing::{BackingStore, SimulatedBackingStore, SimulatedConfig};
pub use capability::{Capability, CapabilityDescriptor, DRIVER_NAME, DRIVER_VERSION, Support};
pub use config::{ConfigError, DriverConfig};
pub use driver::Driver;
pub use error::{Error, ErrorKind, Result};
pub use types::{
    AccessMode, AttachmentRecord, Capacity, Lifecycle, VolumeParameters, VolumeRecord,
    VolumeRequest, VolumeState,
};
