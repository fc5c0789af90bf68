//! ObjectStore backed by a live API server

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams, PropagationPolicy};
use kube::discovery::{verbs, ApiCapabilities, ApiResource, Discovery, Scope};
use kube::Client;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::kube_utils::build_api_resource;
use crate::object::{is_cluster_scoped, Gvk, ObjectKey, Resource};
use crate::store::{ListQuery, ObjectStore, Propagation};
use crate::{Error, Result};

/// Group whose resources duplicate those served by newer groups
const LEGACY_DUPLICATE_GROUP: &str = "extensions";

/// Store talking to a Kubernetes API server through kube-rs
pub struct KubeStore {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeStore {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovery: RwLock::new(None),
        }
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>> {
        if !refresh {
            if let Some(d) = self.discovery.read().await.as_ref() {
                return Ok(d.clone());
            }
        }

        debug!("Running API discovery");
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::store("discovery", format!("API discovery failed: {}", e)))?;
        let discovery = Arc::new(discovery);
        *self.discovery.write().await = Some(discovery.clone());
        Ok(discovery)
    }

    /// Resolve a kind to its API resource and scope.
    ///
    /// Discovery is cached; a miss refreshes it once so kinds whose CRDs were
    /// installed after the first lookup are found. Kinds still unknown fall
    /// back to a guessed plural.
    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, bool)> {
        let target = kube::core::GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);

        for refresh in [false, true] {
            let discovery = self.discovery(refresh).await?;
            if let Some((ar, caps)) = discovery.resolve_gvk(&target) {
                return Ok((ar, caps.scope == Scope::Namespaced));
            }
        }

        trace!(gvk = %gvk, "Kind not discovered, guessing API resource");
        Ok((
            build_api_resource(&gvk.api_version(), &gvk.kind),
            !is_cluster_scoped(&gvk.kind),
        ))
    }

    fn api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            (true, None) => Api::default_namespaced_with(self.client.clone(), ar),
            (false, _) => Api::all_with(self.client.clone(), ar),
        }
    }

    fn list_api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }

    async fn list_resource(
        &self,
        ar: &ApiResource,
        namespaced: bool,
        query: &ListQuery,
    ) -> Result<Vec<Resource>> {
        let api = self.list_api(ar, namespaced, query.namespace.as_deref());
        let mut params = ListParams::default();
        if !query.labels.is_empty() {
            params = params.labels(&query.labels.to_selector_string());
        }

        let list = api
            .list(&params)
            .await
            .map_err(|e| classify(e, "list", &ar.kind))?;

        list.items
            .into_iter()
            .map(|mut obj| {
                obj.types = Some(kube::core::TypeMeta {
                    api_version: ar.api_version.clone(),
                    kind: ar.kind.clone(),
                });
                Resource::from_dynamic(obj)
            })
            .collect()
    }

    /// Every kind that can be listed and deleted, once per kind
    async fn listable_kinds(&self) -> Result<Vec<(ApiResource, ApiCapabilities)>> {
        let discovery = self.discovery(true).await?;
        let mut kinds = Vec::new();
        for group in discovery.groups() {
            if group.name() == LEGACY_DUPLICATE_GROUP {
                continue;
            }
            for (ar, caps) in group.recommended_resources() {
                if caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::DELETE) {
                    kinds.push((ar, caps));
                }
            }
        }
        Ok(kinds)
    }
}

/// Map a kube error onto the store taxonomy, naming the object involved
fn classify(err: kube::Error, operation: &str, subject: &str) -> Error {
    match Error::from(err) {
        Error::NotFound { .. } => Error::NotFound {
            key: subject.to_string(),
        },
        Error::AlreadyExists { .. } => Error::AlreadyExists {
            key: subject.to_string(),
        },
        Error::Forbidden { message, .. } => Error::Forbidden {
            key: subject.to_string(),
            message,
        },
        Error::Conflict { message, .. } => Error::Conflict {
            key: subject.to_string(),
            message,
        },
        other => other.with_context(format!("{} {}", operation, subject)),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Resource> {
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let api = self.api(&ar, namespaced, key.namespace.as_deref());
        let mut obj = api
            .get(&key.name)
            .await
            .map_err(|e| classify(e, "get", &key.to_string()))?;
        obj.types = Some(kube::core::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        Resource::from_dynamic(obj)
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Resource>> {
        match &query.gvk {
            Some(gvk) => {
                let (ar, namespaced) = self.resolve(gvk).await?;
                self.list_resource(&ar, namespaced, query).await
            }
            None => {
                let mut all = Vec::new();
                for (ar, caps) in self.listable_kinds().await? {
                    let namespaced = caps.scope == Scope::Namespaced;
                    match self.list_resource(&ar, namespaced, query).await {
                        Ok(items) => all.extend(items),
                        Err(e) if e.is_not_found() => {
                            trace!(kind = %ar.kind, "Kind disappeared during list, skipping");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(all)
            }
        }
    }

    async fn create(&self, obj: &Resource) -> Result<Resource> {
        let key = obj.key();
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let api = self.api(&ar, namespaced, key.namespace.as_deref());
        let mut created = api
            .create(&PostParams::default(), &obj.to_dynamic()?)
            .await
            .map_err(|e| classify(e, "create", &key.to_string()))?;
        debug!(object = %key, "Created");
        created.types = Some(kube::core::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        Resource::from_dynamic(created)
    }

    async fn update(&self, obj: &Resource) -> Result<Resource> {
        let key = obj.key();
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let api = self.api(&ar, namespaced, key.namespace.as_deref());
        let mut updated = api
            .replace(&key.name, &PostParams::default(), &obj.to_dynamic()?)
            .await
            .map_err(|e| classify(e, "update", &key.to_string()))?;
        debug!(object = %key, "Updated");
        updated.types = Some(kube::core::TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
        Resource::from_dynamic(updated)
    }

    async fn delete(&self, key: &ObjectKey, propagation: Option<Propagation>) -> Result<()> {
        let (ar, namespaced) = self.resolve(&key.gvk).await?;
        let api = self.api(&ar, namespaced, key.namespace.as_deref());
        let params = DeleteParams {
            propagation_policy: propagation.map(|p| match p {
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Foreground => PropagationPolicy::Foreground,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..Default::default()
        };
        api.delete(&key.name, &params)
            .await
            .map_err(|e| classify(e, "delete", &key.to_string()))?;
        debug!(object = %key, "Deleted");
        Ok(())
    }

    fn current_namespace(&self) -> String {
        self.client.default_namespace().to_string()
    }
}
