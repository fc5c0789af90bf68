//! Applies components into a management cluster
//!
//! Objects are created in a fixed kind order so that whatever a later object
//! depends on (its Namespace, the CRD defining it, the Secret it mounts) is
//! already in place. Existing objects are replaced under the current
//! resource version.

use std::sync::Arc;

use tracing::{debug, info};

use tugboat_common::{ErrorContext, ObjectStore, Resource, Result};

use crate::components::Components;

/// Kinds created ahead of everything else, in this order
const CREATE_PRIORITY: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "Secret",
    "ConfigMap",
    "ServiceAccount",
    "LimitRange",
    "Pod",
    "ReplicaSet",
    "Endpoints",
];

/// Position of `kind` in the create order; unlisted kinds go last
pub fn create_priority(kind: &str) -> usize {
    CREATE_PRIORITY
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(CREATE_PRIORITY.len())
}

/// Order objects for creation, keeping manifest order within a kind class
pub fn sort_for_create(objects: &mut [Resource]) {
    objects.sort_by_cached_key(|o| create_priority(&o.kind()));
}

/// Create-or-update for manifest objects
#[derive(Clone)]
pub struct ComponentsReconciler {
    store: Arc<dyn ObjectStore>,
}

impl ComponentsReconciler {
    /// Reconciler writing to `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Install or upgrade every object of a bundle
    pub async fn create(&self, components: &Components) -> Result<()> {
        info!(
            provider = %components.name(),
            version = %components.version(),
            namespace = %components.target_namespace(),
            "Creating provider components"
        );
        self.apply(components.objects().to_vec())
            .await
            .context_with(|| format!("creating components of provider \"{}\"", components.name()))
    }

    /// Create or update arbitrary objects in creation order
    pub async fn apply(&self, mut objects: Vec<Resource>) -> Result<()> {
        sort_for_create(&mut objects);
        for obj in objects {
            self.create_or_update(obj).await?;
        }
        Ok(())
    }

    async fn create_or_update(&self, mut obj: Resource) -> Result<()> {
        let key = obj.key();
        match self.store.get(&key).await {
            Ok(current) => {
                obj.meta_mut().resource_version = current.meta().resource_version.clone();
                self.store
                    .update(&obj)
                    .await
                    .context_with(|| format!("updating {}", key))?;
                debug!(object = %key, "Updated component");
            }
            Err(e) if e.is_not_found() => {
                obj.clear_resource_version();
                self.store
                    .create(&obj)
                    .await
                    .context_with(|| format!("creating {}", key))?;
                debug!(object = %key, "Created component");
            }
            Err(e) => return Err(e.with_context(format!("reading {}", key))),
        }
        Ok(())
    }
}
