//! In-process ObjectStore
//!
//! Behaves like an API server as far as tugboat can tell: uids and resource
//! versions are assigned on write, namespaced objects can only be created in
//! an existing Namespace (the store's current namespace always exists), stale
//! updates are rejected, objects with
//! finalizers are only marked for deletion, deleting a Namespace removes its
//! contents, and non-orphaning deletes remove owned dependents. Deployments
//! report their desired replicas as ready straight away unless stalled.
//! Individual operations can be made to fail for error-path tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DeploymentStatus;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;

use crate::object::{is_cluster_scoped, Gvk, ObjectKey, Resource};
use crate::store::{ListQuery, ObjectStore, Propagation};
use crate::{Error, Result};

/// Store operation, used to target injected failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// get
    Get,
    /// list
    List,
    /// create
    Create,
    /// update
    Update,
    /// delete
    Delete,
}

#[derive(Clone, Debug)]
struct InjectedFailure {
    operation: Operation,
    kind: String,
    name: Option<String>,
    forbidden: bool,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Resource>,
    next_version: u64,
    failures: Vec<InjectedFailure>,
    stalled_deployments: bool,
    created: Vec<ObjectKey>,
    deleted: Vec<ObjectKey>,
}

/// ObjectStore keeping everything in memory
pub struct MemoryStore {
    namespace: String,
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store whose current namespace is `default`
    pub fn new() -> Self {
        Self::with_namespace("default")
    }

    /// Empty store with a specific current namespace
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Store pre-populated with objects, as if they had been created
    pub fn seeded(objects: impl IntoIterator<Item = Resource>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    /// Put an object in place without going through create.
    ///
    /// Status and existing metadata are kept as given; uid and resource
    /// version are filled in when missing.
    pub fn insert(&self, mut obj: Resource) {
        let mut state = self.state.lock();
        self.default_namespace(&mut obj);
        state.next_version += 1;
        let version = state.next_version;
        let meta = obj.meta_mut();
        meta.uid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        meta.resource_version
            .get_or_insert_with(|| version.to_string());
        state.objects.insert(obj.key(), obj);
    }

    /// Make every `operation` on `kind` (optionally only `name`) fail
    pub fn fail_on(&self, operation: Operation, kind: &str, name: Option<&str>) {
        self.state.lock().failures.push(InjectedFailure {
            operation,
            kind: kind.to_string(),
            name: name.map(str::to_string),
            forbidden: false,
        });
    }

    /// Make every `operation` on `kind` fail as forbidden
    pub fn forbid(&self, operation: Operation, kind: &str) {
        self.state.lock().failures.push(InjectedFailure {
            operation,
            kind: kind.to_string(),
            name: None,
            forbidden: true,
        });
    }

    /// Keep Deployment status where it is instead of converging to spec
    pub fn stall_deployments(&self) {
        self.state.lock().stalled_deployments = true;
    }

    /// Whether an object exists
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.state.lock().objects.contains_key(key)
    }

    /// Current copy of an object, if present
    pub fn object(&self, key: &ObjectKey) -> Option<Resource> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Every object currently stored
    pub fn objects(&self) -> Vec<Resource> {
        self.state.lock().objects.values().cloned().collect()
    }

    /// Keys of successfully created objects, in creation order
    pub fn creation_order(&self) -> Vec<ObjectKey> {
        self.state.lock().created.clone()
    }

    /// Keys of explicitly deleted objects, in deletion order
    pub fn deletions(&self) -> Vec<ObjectKey> {
        self.state.lock().deleted.clone()
    }

    fn default_namespace(&self, obj: &mut Resource) {
        let kind = obj.kind();
        let meta = obj.meta_mut();
        if is_cluster_scoped(&kind) {
            meta.namespace = None;
        } else if meta.namespace.as_deref().map_or(true, str::is_empty) {
            meta.namespace = Some(self.namespace.clone());
        }
    }

    fn check_failure(state: &State, operation: Operation, kind: &str, name: Option<&str>) -> Result<()> {
        let hit = state.failures.iter().find(|f| {
            f.operation == operation
                && f.kind == kind
                && (f.name.is_none() || f.name.as_deref() == name)
        });
        match hit {
            Some(f) if f.forbidden => Err(Error::Forbidden {
                key: format!("{} {}", kind, name.unwrap_or_default()),
                message: "injected forbidden response".to_string(),
            }),
            Some(_) => Err(Error::store(
                format!("{:?}", operation).to_lowercase(),
                format!("injected failure for {} {}", kind, name.unwrap_or_default()),
            )),
            None => Ok(()),
        }
    }

    fn converge(state: &State, obj: &mut Resource) {
        if state.stalled_deployments {
            return;
        }
        if let Resource::Deployment(deployment) = obj {
            let replicas = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1);
            deployment.status = Some(DeploymentStatus {
                replicas: Some(replicas),
                ready_replicas: Some(replicas),
                available_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                ..Default::default()
            });
        }
    }

    /// Remove an object and everything that goes with it
    fn remove_cascading(state: &mut State, key: &ObjectKey, propagation: Option<Propagation>) {
        let Some(removed) = state.objects.remove(key) else {
            return;
        };

        let mut dependents = Vec::new();
        if let Resource::Namespace(_) = removed {
            dependents.extend(
                state
                    .objects
                    .keys()
                    .filter(|k| k.namespace.as_deref() == Some(removed.name()))
                    .cloned(),
            );
        }
        if propagation != Some(Propagation::Orphan) {
            if let Some(uid) = removed.meta().uid.as_deref() {
                dependents.extend(
                    state
                        .objects
                        .iter()
                        .filter(|(_, obj)| {
                            obj.meta()
                                .owner_references
                                .iter()
                                .flatten()
                                .any(|o| o.uid == uid)
                        })
                        .map(|(k, _)| k.clone()),
                );
            }
        }

        for dependent in dependents {
            Self::remove_cascading(state, &dependent, propagation);
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Resource> {
        let state = self.state.lock();
        Self::check_failure(&state, Operation::Get, &key.gvk.kind, Some(&key.name))?;
        state.objects.get(key).cloned().ok_or_else(|| Error::NotFound {
            key: key.to_string(),
        })
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Resource>> {
        let state = self.state.lock();
        if let Some(gvk) = &query.gvk {
            Self::check_failure(&state, Operation::List, &gvk.kind, None)?;
        }
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| query.gvk.as_ref().map_or(true, |g| *g == key.gvk))
            .filter(|(key, _)| {
                query.namespace.is_none()
                    || key.namespace.is_none()
                    || key.namespace.as_deref() == query.namespace.as_deref()
            })
            .filter(|(_, obj)| query.labels.matches(obj.meta().labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &Resource) -> Result<Resource> {
        let mut obj = obj.clone();
        self.default_namespace(&mut obj);
        let key = obj.key();

        let mut state = self.state.lock();
        Self::check_failure(&state, Operation::Create, &key.gvk.kind, Some(&key.name))?;
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                key: key.to_string(),
            });
        }
        if let Some(ns) = key.namespace.as_deref() {
            let namespace = ObjectKey::cluster_scoped(Gvk::of::<Namespace>(), ns);
            if ns != self.namespace && !state.objects.contains_key(&namespace) {
                return Err(Error::NotFound {
                    key: namespace.to_string(),
                });
            }
        }
        if obj.meta().resource_version.is_some() {
            return Err(Error::store(
                "create",
                format!("resourceVersion should not be set on {}", key),
            ));
        }

        state.next_version += 1;
        let version = state.next_version;
        let meta = obj.meta_mut();
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.resource_version = Some(version.to_string());
        meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        meta.deletion_timestamp = None;
        Self::converge(&state, &mut obj);

        state.objects.insert(key.clone(), obj.clone());
        state.created.push(key);
        Ok(obj)
    }

    async fn update(&self, obj: &Resource) -> Result<Resource> {
        let mut obj = obj.clone();
        self.default_namespace(&mut obj);
        let key = obj.key();

        let mut state = self.state.lock();
        Self::check_failure(&state, Operation::Update, &key.gvk.kind, Some(&key.name))?;
        let Some(current) = state.objects.get(&key) else {
            return Err(Error::NotFound {
                key: key.to_string(),
            });
        };
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if current.meta().resource_version.as_deref() != Some(rv) {
                return Err(Error::Conflict {
                    key: key.to_string(),
                    message: "the object has been modified; please apply your changes to the latest version".to_string(),
                });
            }
        }
        let uid = current.meta().uid.clone();
        let deletion_timestamp = current.meta().deletion_timestamp.clone();

        state.next_version += 1;
        let version = state.next_version;
        let meta = obj.meta_mut();
        meta.uid = uid;
        meta.resource_version = Some(version.to_string());
        meta.deletion_timestamp = deletion_timestamp;
        Self::converge(&state, &mut obj);

        let finalized = obj.is_being_deleted()
            && obj.meta().finalizers.as_ref().map_or(true, Vec::is_empty);
        state.objects.insert(key.clone(), obj.clone());
        if finalized {
            Self::remove_cascading(&mut state, &key, None);
        }
        Ok(obj)
    }

    async fn delete(&self, key: &ObjectKey, propagation: Option<Propagation>) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_failure(&state, Operation::Delete, &key.gvk.kind, Some(&key.name))?;
        let Some(current) = state.objects.get_mut(key) else {
            return Err(Error::NotFound {
                key: key.to_string(),
            });
        };

        let has_finalizers = current
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            current
                .meta_mut()
                .deletion_timestamp
                .get_or_insert_with(|| Time(chrono::Utc::now()));
        } else {
            Self::remove_cascading(&mut state, key, propagation);
        }
        state.deleted.push(key.clone());
        Ok(())
    }

    fn current_namespace(&self) -> String {
        self.namespace.clone()
    }
}
