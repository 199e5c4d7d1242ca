//! Driver facade
//!
//! Entry point for the orchestrator-facing operations. Validates requests
//! against the capability descriptor, serializes work per volume name, and
//! routes to the provisioner and the attachment coordinator.

use std::path::Path;
use std::sync::Arc;

use tokio_stream::wrappers::WatchStream;
use tracing::{error, info, warn};

use crate::attachment::AttachmentCoordinator;
use crate::backing::BackingStore;
use crate::capability::{CapabilityDescriptor, Support};
use crate::config::{ConfigError, DriverConfig};
use crate::error::{Error, Result};
use crate::metrics::OperationTimer;
use crate::provisioner::Provisioner;
use crate::types::{AccessMode, AttachmentRecord, VolumeRecord, VolumeRequest};

/// FSx for Lustre provisioning driver
///
/// Create and delete of one name, and attach and detach of that name's
/// volume, never overlap. Different names proceed independently.
pub struct Driver {
    descriptor: CapabilityDescriptor,
    provisioner: Provisioner,
    attachments: AttachmentCoordinator,
}

impl Driver {
    /// Create a driver over `backing` with a validated configuration.
    pub fn new(config: &DriverConfig, backing: Arc<dyn BackingStore>) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let descriptor = config.descriptor()?;

        info!(
            driver_name = %descriptor.driver_name(),
            claim_size = %descriptor.claim_size(),
            "Driver initialized"
        );

        Ok(Self {
            descriptor,
            provisioner: Provisioner::new(backing, config),
            attachments: AttachmentCoordinator::new(),
        })
    }

    pub fn capabilities(&self) -> &CapabilityDescriptor {
        &self.descriptor
    }

    /// Create a volume, or return the record already held for its name.
    ///
    /// Returns as soon as the backing store accepted the request; use
    /// [`wait_ready`](Self::wait_ready) to await readiness.
    pub async fn create_volume(&self, request: &VolumeRequest) -> Result<VolumeRecord> {
        let timer = OperationTimer::new("create_volume");

        if request.name.is_empty() {
            timer.failure("InvalidParameter");
            return Err(Error::terminal("InvalidParameter", "volume name is required"));
        }

        if let Support::UnsupportedFsType(fs_type) = self.descriptor.supports(&request.fs_type, None) {
            warn!(name = %request.name, fs_type = %fs_type, "Unsupported filesystem type");
            timer.failure("UnsupportedFsType");
            return Err(Error::terminal(
                "UnsupportedFsType",
                format!("filesystem type '{}' is not supported", fs_type),
            ));
        }

        if let Support::UnsupportedMountOption(option) =
            self.descriptor.supports_mount_options(&request.mount_options)
        {
            warn!(name = %request.name, option = %option, "Unsupported mount option");
            timer.failure("UnsupportedMountOption");
            return Err(Error::terminal(
                "UnsupportedMountOption",
                format!("mount option '{}' is not supported", option),
            ));
        }

        info!(name = %request.name, capacity = %request.capacity, "CreateVolume request");

        let result = self.provisioner.create(request).await;
        match &result {
            Ok(record) => info!(
                name = %record.name,
                resource_id = ?record.resource_id,
                state = %record.state,
                "Volume create accepted"
            ),
            Err(e) => error!(name = %request.name, error = %e, "Failed to create volume"),
        }

        timer.finish(&result);
        result
    }

    /// Delete a volume and drop its attachments. Unknown names succeed.
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        let timer = OperationTimer::new("delete_volume");

        if name.is_empty() {
            timer.failure("InvalidParameter");
            return Err(Error::terminal("InvalidParameter", "volume name is required"));
        }

        info!(name = %name, "DeleteVolume request");

        let guard = self.provisioner.lock(name).await;
        let released = self.attachments.release_volume(name).await;
        if !released.is_empty() {
            warn!(name = %name, count = released.len(), "Deleting volume with active attachments");
        }

        let result = self.provisioner.delete_locked(&guard, name).await;
        match &result {
            Ok(()) => info!(name = %name, "Volume deleted successfully"),
            Err(e) => error!(name = %name, error = %e, "Failed to delete volume"),
        }

        timer.finish(&result);
        result
    }

    pub async fn volume_status(&self, name: &str) -> Result<VolumeRecord> {
        self.provisioner
            .status(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))
    }

    /// Wait until `name` is ready, returning its failure otherwise.
    pub async fn wait_ready(&self, name: &str) -> Result<VolumeRecord> {
        self.provisioner.wait_ready(name).await
    }

    /// Record changes of `name`, starting with the current record.
    pub async fn subscribe(&self, name: &str) -> Result<WatchStream<VolumeRecord>> {
        self.provisioner
            .subscribe(name)
            .await
            .ok_or_else(|| Error::NotFound(format!("volume '{}'", name)))
    }

    pub async fn list_volumes(&self) -> Vec<VolumeRecord> {
        self.provisioner.list().await
    }

    /// Attach a ready volume to a node.
    pub async fn attach(
        &self,
        name: &str,
        node_id: &str,
        access_mode: AccessMode,
        mount_path: &Path,
    ) -> Result<AttachmentRecord> {
        let timer = OperationTimer::new("attach");

        if node_id.is_empty() {
            timer.failure("InvalidParameter");
            return Err(Error::terminal("InvalidParameter", "node ID is required"));
        }
        if !self.descriptor.supports_access_mode(access_mode) {
            timer.failure("UnsupportedAccessMode");
            return Err(Error::terminal(
                "UnsupportedAccessMode",
                format!("access mode {} is not supported", access_mode),
            ));
        }

        info!(name = %name, node_id = %node_id, access_mode = %access_mode, "Attach request");

        let _guard = self.provisioner.lock(name).await;
        let result = match self.provisioner.status(name).await {
            Some(record) => {
                self.attachments
                    .attach(&record, node_id, access_mode, mount_path)
                    .await
            }
            None => Err(Error::NotFound(format!("volume '{}'", name))),
        };

        if let Err(e) = &result {
            warn!(name = %name, node_id = %node_id, error = %e, "Attach failed");
        }
        timer.finish(&result);
        result
    }

    /// Detach a volume from a node. A missing attachment counts as detached.
    pub async fn detach(&self, name: &str, node_id: &str) -> Result<()> {
        let timer = OperationTimer::new("detach");

        info!(name = %name, node_id = %node_id, "Detach request");

        let _guard = self.provisioner.lock(name).await;
        match self.attachments.detach(name, node_id).await {
            Ok(_) => {
                timer.success();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(name = %name, node_id = %node_id, "Attachment not found, treating as already detached");
                timer.success();
                Ok(())
            }
            Err(e) => {
                error!(name = %name, node_id = %node_id, error = %e, "Detach failed");
                timer.failure(e.code());
                Err(e)
            }
        }
    }

    pub async fn attachments(&self, name: &str) -> Vec<AttachmentRecord> {
        self.attachments.attachments(name).await
    }
}
