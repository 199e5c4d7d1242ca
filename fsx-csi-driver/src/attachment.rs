//! Node attachments and access-mode enforcement.
//!
//! Tracks which nodes mount each volume. `ReadWriteOnce` tolerates no other
//! attachment; shared modes coexist only with attachments in the same mode.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{AccessMode, AttachmentRecord, VolumeRecord, VolumeState, unix_timestamp_now};

#[derive(Debug, Default)]
pub struct AttachmentCoordinator {
    attachments: RwLock<HashMap<String, Vec<AttachmentRecord>>>,
}

impl AttachmentCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `volume` to `node_id` at `mount_path`.
    ///
    /// Repeating an existing attachment returns the stored record.
    pub async fn attach(
        &self,
        volume: &VolumeRecord,
        node_id: &str,
        access_mode: AccessMode,
        mount_path: &Path,
    ) -> Result<AttachmentRecord> {
        if volume.state != VolumeState::Ready {
            return Err(Error::NotReady {
                name: volume.name.clone(),
                state: volume.state,
            });
        }

        let mut attachments = self.attachments.write().await;
        let existing = attachments.entry(volume.name.clone()).or_default();

        if let Some(same) = existing.iter().find(|a| {
            a.node_id == node_id && a.access_mode == access_mode && a.mount_path == mount_path
        }) {
            debug!(volume = %volume.name, node_id = %node_id, "Attachment already exists");
            return Ok(same.clone());
        }

        let conflicting = existing.iter().find(|a| {
            !access_mode.compatible_with(a.access_mode)
                || (a.node_id == node_id && a.mount_path == mount_path)
        });
        if let Some(held) = conflicting {
            warn!(
                volume = %volume.name,
                node_id = %node_id,
                requested = %access_mode,
                held_by = %held.node_id,
                held_mode = %held.access_mode,
                "Attach refused"
            );
            return Err(Error::Conflict {
                volume: volume.name.clone(),
                node: node_id.to_string(),
                requested: access_mode.to_string(),
                held_by: held.node_id.clone(),
                held_mode: held.access_mode.to_string(),
            });
        }

        let record = AttachmentRecord {
            volume: volume.name.clone(),
            node_id: node_id.to_string(),
            access_mode,
            mount_path: mount_path.to_path_buf(),
            attached_at: unix_timestamp_now(),
        };
        existing.push(record.clone());
        metrics::set_attachment_count(count(&attachments));

        info!(
            volume = %volume.name,
            node_id = %node_id,
            access_mode = %access_mode,
            mount_path = %mount_path.display(),
            "Volume attached"
        );
        Ok(record)
    }

    /// Remove every attachment of `volume` on `node_id`.
    pub async fn detach(&self, volume: &str, node_id: &str) -> Result<Vec<AttachmentRecord>> {
        let mut attachments = self.attachments.write().await;

        let Some(existing) = attachments.get_mut(volume) else {
            return Err(Error::NotFound(format!(
                "attachment of volume '{}' on node '{}'",
                volume, node_id
            )));
        };
        let (removed, kept): (Vec<_>, Vec<_>) =
            existing.drain(..).partition(|a| a.node_id == node_id);
        *existing = kept;
        if existing.is_empty() {
            attachments.remove(volume);
        }

        if removed.is_empty() {
            return Err(Error::NotFound(format!(
                "attachment of volume '{}' on node '{}'",
                volume, node_id
            )));
        }

        metrics::set_attachment_count(count(&attachments));
        info!(volume = %volume, node_id = %node_id, count = removed.len(), "Volume detached");
        Ok(removed)
    }

    /// Drop all attachments of a deleted volume.
    pub async fn release_volume(&self, volume: &str) -> Vec<AttachmentRecord> {
        let mut attachments = self.attachments.write().await;
        let released = attachments.remove(volume).unwrap_or_default();
        if !released.is_empty() {
            metrics::set_attachment_count(count(&attachments));
            info!(volume = %volume, count = released.len(), "Released attachments of deleted volume");
        }
        released
    }

    /// Attachments of `volume`, ordered by node.
    pub async fn attachments(&self, volume: &str) -> Vec<AttachmentRecord> {
        let mut records = self
            .attachments
            .read()
            .await
            .get(volume)
            .cloned()
            .unwrap_or_default();
        records.sort_by(|a, b| a.node_id.cmp(&b.node_id).then(a.mount_path.cmp(&b.mount_path)));
        records
    }

    pub async fn len(&self) -> usize {
        count(&*self.attachments.read().await)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn count(attachments: &HashMap<String, Vec<AttachmentRecord>>) -> usize {
    attachments.values().map(Vec::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(name: &str) -> VolumeRecord {
        let mut record = VolumeRecord::new(name, 1200);
        record.transition(VolumeState::Creating).unwrap();
        record.assign_resource_id("fs-0123456789abcdef0").unwrap();
        record.transition(VolumeState::Polling).unwrap();
        record.transition(VolumeState::Ready).unwrap();
        record
    }

    fn path(node: &str) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/var/lib/kubelet/pods/{}/mount", node))
    }

    #[tokio::test]
    async fn test_rwo_is_exclusive() {
        let coordinator = AttachmentCoordinator::new();
        let volume = ready("vol-a");

        coordinator
            .attach(&volume, "node-1", AccessMode::ReadWriteOnce, &path("node-1"))
            .await
            .unwrap();
        let err = coordinator
            .attach(&volume, "node-2", AccessMode::ReadWriteOnce, &path("node-2"))
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            Error::Conflict { held_by, .. } if held_by == "node-1"
        ));
        assert_eq!(coordinator.attachments("vol-a").await.len(), 1);

        coordinator.detach("vol-a", "node-1").await.unwrap();
        coordinator
            .attach(&volume, "node-2", AccessMode::ReadWriteOnce, &path("node-2"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let coordinator = AttachmentCoordinator::new();
        let volume = ready("vol-a");

        let first = coordinator
            .attach(&volume, "node-1", AccessMode::ReadWriteOnce, &path("node-1"))
            .await
            .unwrap();
        let second = coordinator
            .attach(&volume, "node-1", AccessMode::ReadWriteOnce, &path("node-1"))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(coordinator.len().await, 1);
    }

    #[tokio::test]
    async fn test_shared_modes_coexist_only_with_themselves() {
        let coordinator = AttachmentCoordinator::new();
        let volume = ready("vol-a");

        for node in ["node-1", "node-2", "node-3"] {
            coordinator
                .attach(&volume, node, AccessMode::ReadWriteMany, &path(node))
                .await
                .unwrap();
        }
        assert_eq!(coordinator.attachments("vol-a").await.len(), 3);

        let err = coordinator
            .attach(&volume, "node-4", AccessMode::ReadOnlyMany, &path("node-4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let err = coordinator
            .attach(&volume, "node-4", AccessMode::ReadWriteOnce, &path("node-4"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_mode_change_on_same_target_conflicts() {
        let coordinator = AttachmentCoordinator::new();
        let volume = ready("vol-a");

        coordinator
            .attach(&volume, "node-1", AccessMode::ReadOnlyMany, &path("node-1"))
            .await
            .unwrap();
        let err = coordinator
            .attach(&volume, "node-1", AccessMode::ReadWriteMany, &path("node-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn test_attach_requires_ready_volume() {
        let coordinator = AttachmentCoordinator::new();
        let mut volume = VolumeRecord::new("vol-a", 1200);
        volume.transition(VolumeState::Creating).unwrap();

        let err = coordinator
            .attach(&volume, "node-1", AccessMode::ReadWriteMany, &path("node-1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            Error::NotReady {
                name: "vol-a".to_string(),
                state: VolumeState::Creating
            }
        );
        assert!(err.is_retryable());
        assert!(coordinator.is_empty().await);
    }

    #[tokio::test]
    async fn test_detach_missing_is_not_found() {
        let coordinator = AttachmentCoordinator::new();
        let volume = ready("vol-a");

        assert!(
            coordinator
                .detach("vol-a", "node-1")
                .await
                .unwrap_err()
                .is_not_found()
        );

        coordinator
            .attach(&volume, "node-1", AccessMode::ReadWriteMany, &path("node-1"))
            .await
            .unwrap();
        assert!(
            coordinator
                .detach("vol-a", "node-2")
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(coordinator.len().await, 1);
    }

    #[tokio::test]
    async fn test_release_volume_drops_everything() {
        let coordinator = AttachmentCoordinator::new();
        let volume = ready("vol-a");
        let other = ready("vol-b");

        for node in ["node-1", "node-2"] {
            coordinator
                .attach(&volume, node, AccessMode::ReadWriteMany, &path(node))
                .await
                .unwrap();
        }
        coordinator
            .attach(&other, "node-1", AccessMode::ReadWriteOnce, &path("node-1"))
            .await
            .unwrap();

        assert_eq!(coordinator.release_volume("vol-a").await.len(), 2);
        assert!(coordinator.attachments("vol-a").await.is_empty());
        assert_eq!(coordinator.len().await, 1);
        assert!(coordinator.release_volume("vol-a").await.is_empty());
    }
}
