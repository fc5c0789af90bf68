//! Object store abstraction
//!
//! A management cluster is reached through [`ObjectStore`]. Writes carry the
//! object's resource version, so an update of an object that changed since it
//! was read fails with [`Error::Conflict`](crate::Error::Conflict) rather than
//! clobbering it.

use async_trait::async_trait;

use crate::object::{Gvk, ObjectKey, Resource};
use crate::selector::LabelSelector;
use crate::Result;

/// What to list
#[derive(Clone, Debug, Default)]
pub struct ListQuery {
    /// Kind to list; `None` lists every kind that can be listed and deleted
    pub gvk: Option<Gvk>,
    /// Namespace to restrict namespaced kinds to; `None` lists across all
    /// namespaces. Cluster-scoped objects are never filtered out by this.
    pub namespace: Option<String>,
    /// Label requirements
    pub labels: LabelSelector,
}

impl ListQuery {
    /// List objects of one kind
    pub fn of(gvk: Gvk) -> Self {
        Self {
            gvk: Some(gvk),
            ..Default::default()
        }
    }

    /// List objects of every kind
    pub fn all_kinds() -> Self {
        Self::default()
    }

    /// Restrict to a namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict by labels
    pub fn with_labels(mut self, labels: LabelSelector) -> Self {
        self.labels = labels;
        self
    }
}

/// Deletion propagation policy for dependents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Propagation {
    /// Delete the object now, dependents afterwards
    Background,
    /// Delete dependents before the object
    Foreground,
    /// Leave dependents in place
    Orphan,
}

/// Typed create/get/update/delete/list over a management cluster
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a single object
    async fn get(&self, key: &ObjectKey) -> Result<Resource>;

    /// List objects matching a query
    async fn list(&self, query: &ListQuery) -> Result<Vec<Resource>>;

    /// Create an object, returning the stored version
    async fn create(&self, obj: &Resource) -> Result<Resource>;

    /// Replace an object, using its resource version as the concurrency token
    async fn update(&self, obj: &Resource) -> Result<Resource>;

    /// Delete an object
    async fn delete(&self, key: &ObjectKey, propagation: Option<Propagation>) -> Result<()>;

    /// Namespace used when an object or reference does not name one
    fn current_namespace(&self) -> String;
}
