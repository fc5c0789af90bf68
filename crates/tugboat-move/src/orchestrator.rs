//! End-to-end pivot of a management cluster
//!
//! 1. install every source provider in the target (unless already there)
//! 2. scale the source controllers down
//! 3. move the Cluster API objects
//! 4. delete the provider components from the source

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use tracing::info;

use tugboat_common::crd::Provider;
use tugboat_common::{
    ErrorContext, Gvk, LabelSelector, ListQuery, ObjectKey, ObjectStore, Resource, Result,
    CLUSTERCTL_LABEL, CLUSTERCTL_PROVIDER_LABEL,
};
use tugboat_provider::{
    ComponentsReconciler, ComponentsTeardown, MetadataRegistry, ProviderFilter, TeardownConfig,
};

use crate::config::MoverConfig;
use crate::mover::ObjectMover;

/// Moves providers and their objects from a source to a target cluster
pub struct PivotOrchestrator {
    source: Arc<dyn ObjectStore>,
    target: Arc<dyn ObjectStore>,
    mover_config: MoverConfig,
    teardown_config: TeardownConfig,
}

impl PivotOrchestrator {
    /// Pivot from `source` to `target` with default timing
    pub fn new(source: Arc<dyn ObjectStore>, target: Arc<dyn ObjectStore>) -> Self {
        Self {
            source,
            target,
            mover_config: MoverConfig::default(),
            teardown_config: TeardownConfig::default(),
        }
    }

    /// Override object move timing
    pub fn with_mover_config(mut self, config: MoverConfig) -> Self {
        self.mover_config = config;
        self
    }

    /// Override controller scale-down timing
    pub fn with_teardown_config(mut self, config: TeardownConfig) -> Self {
        self.teardown_config = config;
        self
    }

    /// Run the pivot. Stops at the first failure, leaving both clusters as
    /// they are at that point.
    pub async fn pivot(&self) -> Result<()> {
        let source_registry = MetadataRegistry::new(self.source.clone());
        let target_registry = MetadataRegistry::new(self.target.clone());

        let providers = source_registry.list(&ProviderFilter::new()).await?;
        info!(count = providers.len(), "Pivoting providers");

        for provider in &providers {
            let installed = target_registry
                .list(&ProviderFilter::new().with_name(provider.name()))
                .await?;
            if installed.iter().any(|p| p.same_installation(provider)) {
                info!(provider = %provider.instance_name(), "Provider already installed in target cluster, skipping");
                continue;
            }

            target_registry
                .validate(provider)
                .await
                .context_with(|| format!("installing provider {} in target cluster", provider.instance_name()))?;
            self.pivot_components(provider, &target_registry)
                .await
                .context_with(|| format!("installing provider {} in target cluster", provider.instance_name()))?;
        }

        let teardown = ComponentsTeardown::with_config(self.source.clone(), self.teardown_config.clone());
        for provider in &providers {
            teardown.scale_down_controllers(provider).await?;
        }

        ObjectMover::with_config(self.source.clone(), self.target.clone(), self.mover_config.clone())
            .pivot()
            .await?;

        for (i, provider) in providers.iter().enumerate() {
            // the last instance of a provider takes the shared CRDs with it
            let delete_crd = !providers[i + 1..]
                .iter()
                .any(|other| other.name() == provider.name());
            teardown
                .delete(provider, false, delete_crd)
                .await
                .context_with(|| format!("deleting provider {} from source cluster", provider.instance_name()))?;
        }

        info!("Pivot complete");
        Ok(())
    }

    /// Copy the live components of `provider` into the target and record it
    async fn pivot_components(&self, provider: &Provider, target_registry: &MetadataRegistry) -> Result<()> {
        info!(provider = %provider.instance_name(), "Installing provider in target cluster");

        let query = ListQuery::all_kinds()
            .in_namespace(provider.namespace())
            .with_labels(
                LabelSelector::new()
                    .has(CLUSTERCTL_LABEL)
                    .eq(CLUSTERCTL_PROVIDER_LABEL, provider.name()),
            );
        let mut objects: Vec<Resource> = self
            .source
            .list(&query)
            .await?
            .into_iter()
            .filter(|o| !matches!(o, Resource::Provider(_) | Resource::Namespace(_)))
            .map(prepare_component)
            .collect();

        // a namespace shared with other providers has lost its provider label
        let key = ObjectKey::cluster_scoped(Gvk::of::<Namespace>(), provider.namespace());
        let namespace = self
            .source
            .get(&key)
            .await
            .context_with(|| format!("reading {}", key))?;
        objects.push(prepare_component(namespace));

        ComponentsReconciler::new(self.target.clone())
            .apply(objects)
            .await?;
        target_registry.create(provider).await
    }
}

/// Strip what the source cluster assigned to a component
fn prepare_component(mut obj: Resource) -> Resource {
    obj.clear_resource_version();
    obj.meta_mut().uid = None;
    if let Resource::Service(service) = &mut obj {
        if let Some(spec) = service.spec.as_mut() {
            let cluster_ip = spec.type_.as_deref().map_or(true, |t| t == "ClusterIP");
            let headless = spec.cluster_ip.as_deref() == Some("None");
            if cluster_ip && !headless {
                spec.cluster_ip = None;
                spec.cluster_ips = None;
            }
        }
    }
    obj
}
