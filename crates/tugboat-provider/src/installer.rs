//! Queued provider installation
//!
//! Bundles are validated as they are added and only written once the whole
//! batch is known to be acceptable, so a bad infrastructure provider does not
//! leave a half-initialised management cluster behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use tracing::{info, warn};

use tugboat_common::crd::ProviderType;
use tugboat_common::{
    Error, ErrorContext, Gvk, ObjectKey, ObjectStore, Resource, Result, CLUSTERCTL_PROVIDER_LABEL,
};

use crate::components::Components;
use crate::metadata::{MetadataRegistry, ProviderFilter};
use crate::reconciler::ComponentsReconciler;

/// Validates and installs a batch of providers
pub struct ProviderInstaller {
    store: Arc<dyn ObjectStore>,
    registry: MetadataRegistry,
    reconciler: ComponentsReconciler,
    queue: Vec<Components>,
}

impl ProviderInstaller {
    /// Installer writing to `store`
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_registry(MetadataRegistry::new(store))
    }

    /// Installer using an existing registry handle
    pub fn with_registry(registry: MetadataRegistry) -> Self {
        let store = registry.store().clone();
        Self {
            reconciler: ComponentsReconciler::new(store.clone()),
            store,
            registry,
            queue: Vec::new(),
        }
    }

    /// Bundles waiting for [`install`](Self::install)
    pub fn queued(&self) -> &[Components] {
        &self.queue
    }

    /// Validate a bundle against the installed providers and queue it.
    ///
    /// With `force` a failed validation is logged and the bundle queued anyway.
    pub async fn add(&mut self, components: Components, force: bool) -> Result<()> {
        let provider = components.provider();
        if let Err(e) = self.registry.validate(&provider).await {
            if !force {
                return Err(e.with_context(format!(
                    "Installing provider \"{}\" can lead to a non functioning management cluster (you can use --force to ignore this error)",
                    provider.instance_name()
                )));
            }
            warn!(provider = %provider.instance_name(), error = %e, "Ignoring validation error because of --force");
        }

        info!(
            provider = %provider.instance_name(),
            provider_type = %components.provider_type(),
            version = %components.version(),
            "Queued provider"
        );
        self.queue.push(components);
        Ok(())
    }

    /// Install every queued bundle in order, stopping at the first failure.
    ///
    /// Returns the installed bundles. Bundles installed before a failure stay
    /// installed.
    pub async fn install(&mut self) -> Result<Vec<Components>> {
        let queue = std::mem::take(&mut self.queue);
        for components in &queue {
            self.reconciler.create(components).await?;
            self.registry
                .create(&components.provider())
                .await
                .context_with(|| format!("recording provider \"{}\"", components.name()))?;
            info!(
                provider = %components.name(),
                namespace = %components.target_namespace(),
                version = %components.version(),
                "Installed provider"
            );
        }

        self.detach_shared_namespaces().await?;
        Ok(queue)
    }

    /// Drop the provider label from namespaces that host more than one provider
    async fn detach_shared_namespaces(&self) -> Result<()> {
        let mut per_namespace: BTreeMap<String, usize> = BTreeMap::new();
        for provider in self.registry.list(&ProviderFilter::new()).await? {
            *per_namespace.entry(provider.namespace().to_string()).or_default() += 1;
        }

        for (namespace, count) in per_namespace {
            if count <= 1 {
                continue;
            }
            let key = ObjectKey::cluster_scoped(Gvk::of::<Namespace>(), &namespace);
            let mut obj = match self.store.get(&key).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.with_context(format!("reading {}", key))),
            };

            let removed = obj
                .meta_mut()
                .labels
                .as_mut()
                .and_then(|labels| labels.remove(CLUSTERCTL_PROVIDER_LABEL));
            if removed.is_none() {
                continue;
            }

            self.store
                .update(&obj)
                .await
                .context_with(|| format!("detaching {}", key))?;
            info!(namespace = %namespace, providers = count, "Detached namespace shared by several providers");
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProviderInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInstaller")
            .field("queued", &self.queue.iter().map(Components::name).collect::<Vec<_>>())
            .finish()
    }
}

/// Reject a bundle whose declared role differs from the requested one
pub fn ensure_type(components: &Components, expected: ProviderType) -> Result<()> {
    if components.provider_type() != expected {
        return Err(Error::configuration(format!(
            "can't use \"{}\" provider as an \"{}\", it is a \"{}\"",
            components.name(),
            expected,
            components.provider_type()
        )));
    }
    Ok(())
}
