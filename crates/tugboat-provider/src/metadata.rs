//! Registry of installed providers
//!
//! The registry lives in the management cluster itself: a
//! `providers.clusterctl.cluster.x-k8s.io` CRD plus one `Provider` object per
//! installed instance, stored in the namespace the instance was installed into.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kube::CustomResourceExt;
use tracing::{debug, info};

use tugboat_common::crd::{Provider, ProviderType};
use tugboat_common::kube_utils::poll_until;
use tugboat_common::{
    Error, ErrorContext, Gvk, ListQuery, ObjectKey, ObjectStore, Resource, Result,
};

/// How long to wait for a freshly installed registry CRD to be served
const REGISTRY_READY_TIMEOUT: Duration = Duration::from_secs(60);
const REGISTRY_READY_INTERVAL: Duration = Duration::from_secs(2);

/// Restricts a registry listing
#[derive(Clone, Debug, Default)]
pub struct ProviderFilter {
    /// Only providers with this name
    pub name: Option<String>,
    /// Only providers installed in this namespace
    pub namespace: Option<String>,
    /// Only providers of this type
    pub provider_type: Option<ProviderType>,
}

impl ProviderFilter {
    /// Filter matching every provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a provider name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restrict to a namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict to a provider type
    pub fn with_type(mut self, provider_type: ProviderType) -> Self {
        self.provider_type = Some(provider_type);
        self
    }

    fn matches(&self, provider: &Provider) -> bool {
        self.name.as_deref().map_or(true, |n| provider.name() == n)
            && self
                .namespace
                .as_deref()
                .map_or(true, |ns| provider.namespace() == ns)
            && self
                .provider_type
                .map_or(true, |t| provider.spec.provider_type == t)
    }
}

/// Reads and writes Provider records in one management cluster
#[derive(Clone)]
pub struct MetadataRegistry {
    store: Arc<dyn ObjectStore>,
    ready_timeout: Duration,
    ready_interval: Duration,
}

impl MetadataRegistry {
    /// Registry backed by `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            ready_timeout: REGISTRY_READY_TIMEOUT,
            ready_interval: REGISTRY_READY_INTERVAL,
        }
    }

    /// Override how long to wait for a new registry CRD to be served
    pub fn with_ready_wait(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ready_interval = interval;
        self.ready_timeout = timeout;
        self
    }

    /// Store this registry writes to
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Install the registry CRD if it is missing.
    ///
    /// Returns whether it was already there; a cluster without it has never
    /// had a provider installed.
    pub async fn ensure_metadata(&self) -> Result<bool> {
        let crd = Resource::CustomResourceDefinition(Provider::crd());
        match self.store.create(&crd).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {
                debug!("Provider registry already installed");
                return Ok(true);
            }
            Err(e) => return Err(e.with_context("installing the provider registry")),
        }

        info!("Installed provider registry");
        let store = self.store.clone();
        poll_until(
            self.ready_timeout,
            self.ready_interval,
            "provider registry to be served",
            || {
                let store = store.clone();
                async move {
                    store.list(&ListQuery::of(Gvk::of::<Provider>())).await?;
                    Ok(true)
                }
            },
        )
        .await?;
        Ok(false)
    }

    /// Persist a provider record, replacing any record with the same identity
    pub async fn create(&self, provider: &Provider) -> Result<()> {
        let key = record_key(provider.namespace(), provider.name());
        let mut record = provider.clone();
        record.metadata.resource_version = None;
        record.metadata.uid = None;

        match self.store.get(&key).await {
            Ok(current) => {
                record.metadata.resource_version = current.meta().resource_version.clone();
                self.store
                    .update(&Resource::Provider(record))
                    .await
                    .context_with(|| format!("updating provider record {}", key))?;
                debug!(provider = %provider.instance_name(), "Updated provider record");
            }
            Err(e) if e.is_not_found() => {
                self.store
                    .create(&Resource::Provider(record))
                    .await
                    .context_with(|| format!("creating provider record {}", key))?;
                debug!(provider = %provider.instance_name(), "Created provider record");
            }
            Err(e) => return Err(e.with_context(format!("reading provider record {}", key))),
        }
        Ok(())
    }

    /// Fetch one record
    pub async fn get(&self, namespace: &str, name: &str) -> Result<Provider> {
        let key = record_key(namespace, name);
        match self.store.get(&key).await? {
            Resource::Provider(provider) => Ok(provider),
            other => Err(Error::serialization_for_kind(
                other.kind(),
                format!("{} is not a Provider", key),
            )),
        }
    }

    /// List records matching `filter`
    pub async fn list(&self, filter: &ProviderFilter) -> Result<Vec<Provider>> {
        let mut query = ListQuery::of(Gvk::of::<Provider>());
        if let Some(ns) = &filter.namespace {
            query = query.in_namespace(ns.clone());
        }
        let objects = self
            .store
            .list(&query)
            .await
            .context_with(|| "listing installed providers")?;

        Ok(objects
            .into_iter()
            .filter_map(|obj| match obj {
                Resource::Provider(p) => Some(p),
                _ => None,
            })
            .filter(|p| filter.matches(p))
            .collect())
    }

    /// Name of the only installed provider of `provider_type`, if exactly one
    pub async fn default_provider(&self, provider_type: ProviderType) -> Result<Option<String>> {
        let providers = self
            .list(&ProviderFilter::new().with_type(provider_type))
            .await?;
        Ok(single(providers.iter().map(|p| p.name().to_string())))
    }

    /// Version shared by every instance of `name`, if they agree
    pub async fn default_version(&self, name: &str) -> Result<Option<String>> {
        let providers = self.list(&ProviderFilter::new().with_name(name)).await?;
        Ok(single(providers.iter().map(|p| p.spec.version.clone())))
    }

    /// Namespace of the only instance of `name`, if exactly one
    pub async fn default_namespace(&self, name: &str) -> Result<Option<String>> {
        let providers = self.list(&ProviderFilter::new().with_name(name)).await?;
        Ok(single(providers.iter().map(|p| p.namespace().to_string())))
    }

    /// Check that installing `candidate` keeps the installed instances of
    /// the same provider consistent.
    pub async fn validate(&self, candidate: &Provider) -> Result<()> {
        let name = candidate.name();
        let instances = self.list(&ProviderFilter::new().with_name(name)).await?;
        if instances.is_empty() {
            return Ok(());
        }

        if instances
            .iter()
            .any(|p| p.namespace() == candidate.namespace())
        {
            return Err(Error::validation(format!(
                "There is already an instance of the \"{}\" provider installed in the \"{}\" namespace",
                name,
                candidate.namespace()
            )));
        }

        if instances
            .iter()
            .any(|p| p.spec.version != candidate.spec.version)
        {
            return Err(Error::validation(format!(
                "The new instance of the \"{}\" provider has a version different than other instances of the same provider",
                name
            )));
        }

        let watched = candidate.spec.watched_namespace.as_str();
        if watched.is_empty() {
            return Err(Error::validation(format!(
                "The new instance of the \"{}\" provider is going to watch for objects in namespaces already controlled by other providers",
                name
            )));
        }

        if instances.iter().any(|p| {
            p.spec.watched_namespace.is_empty() || p.spec.watched_namespace == watched
        }) {
            return Err(Error::validation(format!(
                "The new instance of the \"{}\" provider is going to watch for objects in the namespace \"{}\" that is already controlled by other providers",
                name, watched
            )));
        }

        Ok(())
    }
}

fn record_key(namespace: &str, name: &str) -> ObjectKey {
    ObjectKey::namespaced(Gvk::of::<Provider>(), namespace, name)
}

/// The value when all candidates agree on exactly one
fn single(values: impl Iterator<Item = String>) -> Option<String> {
    let distinct: BTreeSet<String> = values.collect();
    if distinct.len() == 1 {
        distinct.into_iter().next()
    } else {
        None
    }
}
