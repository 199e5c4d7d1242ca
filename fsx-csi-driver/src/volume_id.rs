//! Mapping between logical volume names and backing-store resource IDs.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Bindings {
    by_name: HashMap<String, String>,
    by_resource: HashMap<String, String>,
}

/// Two-way map of volume name ↔ resource ID.
///
/// A name is bound at most once; rebinding it to another ID fails with
/// [`Error::AlreadyBound`]. Unbinding releases both directions.
#[derive(Debug, Default)]
pub struct VolumeIdMapper {
    bindings: RwLock<Bindings>,
}

impl VolumeIdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `resource_id`. Binding the same pair again is a no-op.
    pub async fn bind(&self, name: &str, resource_id: &str) -> Result<()> {
        let mut bindings = self.bindings.write().await;

        if let Some(existing) = bindings.by_name.get(name) {
            if existing == resource_id {
                return Ok(());
            }
            return Err(Error::AlreadyBound {
                name: name.to_string(),
                existing: existing.clone(),
                requested: resource_id.to_string(),
            });
        }
        if let Some(owner) = bindings.by_resource.get(resource_id) {
            return Err(Error::AlreadyBound {
                name: name.to_string(),
                existing: format!("{} (owned by '{}')", resource_id, owner),
                requested: resource_id.to_string(),
            });
        }

        bindings
            .by_name
            .insert(name.to_string(), resource_id.to_string());
        bindings
            .by_resource
            .insert(resource_id.to_string(), name.to_string());
        debug!(name = %name, resource_id = %resource_id, "Bound volume");
        Ok(())
    }

    pub async fn resource_id(&self, name: &str) -> Option<String> {
        self.bindings.read().await.by_name.get(name).cloned()
    }

    pub async fn name_of(&self, resource_id: &str) -> Option<String> {
        self.bindings
            .read()
            .await
            .by_resource
            .get(resource_id)
            .cloned()
    }

    /// Remove the binding for `name`, returning the resource ID it held.
    pub async fn unbind(&self, name: &str) -> Option<String> {
        let mut bindings = self.bindings.write().await;
        let resource_id = bindings.by_name.remove(name)?;
        bindings.by_resource.remove(&resource_id);
        debug!(name = %name, resource_id = %resource_id, "Unbound volume");
        Some(resource_id)
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
