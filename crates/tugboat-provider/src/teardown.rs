//! Removing a provider's components
//!
//! Controllers are scaled to zero first so they stop reconciling the objects
//! that are about to disappear. What gets deleted depends on whether the
//! namespace and CRDs are kept:
//!
//! | namespace | CRDs   | deleted                                                      |
//! |-----------|--------|--------------------------------------------------------------|
//! | kept      | kept   | labelled objects except the Namespace and CRDs               |
//! | deleted   | kept   | the Namespace (cascading its contents) and labelled cluster-scoped objects except CRDs |
//! | deleted   | deleted| the Namespace and every labelled cluster-scoped object       |

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use tracing::{debug, info};

use tugboat_common::crd::Provider;
use tugboat_common::kube_utils::poll_until;
use tugboat_common::object::is_cluster_scoped;
use tugboat_common::{
    Error, ErrorContext, Gvk, LabelSelector, ListQuery, ObjectKey, ObjectStore, Resource, Result,
    CLUSTERCTL_PROVIDER_LABEL,
};

/// Poll interval while waiting for controllers to stop
pub const DEFAULT_SCALE_DOWN_INTERVAL: Duration = Duration::from_secs(10);
/// Upper bound on waiting for controllers to stop
pub const DEFAULT_SCALE_DOWN_TIMEOUT: Duration = Duration::from_secs(600);

/// Teardown timing
#[derive(Clone, Debug)]
pub struct TeardownConfig {
    /// Poll interval while waiting for controllers to stop
    pub scale_down_interval: Duration,
    /// Upper bound on waiting for controllers to stop
    pub scale_down_timeout: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            scale_down_interval: DEFAULT_SCALE_DOWN_INTERVAL,
            scale_down_timeout: DEFAULT_SCALE_DOWN_TIMEOUT,
        }
    }
}

impl TeardownConfig {
    /// Config with default timing
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval
    pub fn with_scale_down_interval(mut self, interval: Duration) -> Self {
        self.scale_down_interval = interval;
        self
    }

    /// Set the wait bound
    pub fn with_scale_down_timeout(mut self, timeout: Duration) -> Self {
        self.scale_down_timeout = timeout;
        self
    }
}

/// Scales down and deletes provider components
#[derive(Clone)]
pub struct ComponentsTeardown {
    store: Arc<dyn ObjectStore>,
    config: TeardownConfig,
}

impl ComponentsTeardown {
    /// Teardown against `store` with default timing
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_config(store, TeardownConfig::default())
    }

    /// Teardown against `store` with explicit timing
    pub fn with_config(store: Arc<dyn ObjectStore>, config: TeardownConfig) -> Self {
        Self { store, config }
    }

    /// Scale every controller Deployment of `provider` to zero and wait
    /// until none of their pods are left running.
    pub async fn scale_down_controllers(&self, provider: &Provider) -> Result<()> {
        let query = ListQuery::of(Gvk::of::<Deployment>())
            .in_namespace(provider.namespace())
            .with_labels(provider_selector(provider));
        let deployments = self
            .store
            .list(&query)
            .await
            .context_with(|| format!("listing controllers of provider {}", provider.instance_name()))?;

        for obj in deployments {
            let key = obj.key();
            let Resource::Deployment(mut deployment) = obj else {
                continue;
            };
            let spec = deployment.spec.get_or_insert_with(Default::default);
            if spec.replicas == Some(0) {
                debug!(deployment = %key, "Controller already scaled down");
                continue;
            }

            info!(provider = %provider.instance_name(), deployment = %key.name, "Scaling down controller");
            spec.replicas = Some(0);
            self.store
                .update(&Resource::Deployment(deployment))
                .await
                .context_with(|| format!("scaling down {}", key))?;

            let store = self.store.clone();
            let wait_key = key.clone();
            poll_until(
                self.config.scale_down_timeout,
                self.config.scale_down_interval,
                format!("{} to scale down", key),
                || {
                    let store = store.clone();
                    let key = wait_key.clone();
                    async move { is_scaled_down(store.as_ref(), &key).await }
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Delete the components of `provider` and its registry record.
    ///
    /// Controllers are scaled down first unless the CRDs are going away too.
    pub async fn delete(
        &self,
        provider: &Provider,
        force_delete_namespace: bool,
        force_delete_crd: bool,
    ) -> Result<()> {
        info!(
            provider = %provider.instance_name(),
            delete_namespace = force_delete_namespace,
            delete_crd = force_delete_crd,
            "Deleting provider"
        );

        if !force_delete_crd {
            self.scale_down_controllers(provider).await?;
        }

        let query = ListQuery::all_kinds()
            .in_namespace(provider.namespace())
            .with_labels(provider_selector(provider));
        let objects = self
            .store
            .list(&query)
            .await
            .context_with(|| format!("listing components of provider {}", provider.instance_name()))?;

        let to_delete = objects
            .iter()
            .map(Resource::key)
            .filter(|key| select_for_delete(key, force_delete_namespace, force_delete_crd));

        for key in to_delete {
            debug!(object = %key, "Deleting component");
            match self.store.delete(&key, None).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.with_context(format!("deleting {}", key))),
            }
        }

        let record = ObjectKey::namespaced(Gvk::of::<Provider>(), provider.namespace(), provider.name());
        match self.store.delete(&record, None).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.with_context(format!("deleting provider record {}", record))),
        }

        info!(provider = %provider.instance_name(), "Provider deleted");
        Ok(())
    }
}

fn provider_selector(provider: &Provider) -> LabelSelector {
    LabelSelector::new().eq(CLUSTERCTL_PROVIDER_LABEL, provider.name())
}

/// Whether a labelled object is deleted explicitly
fn select_for_delete(key: &ObjectKey, force_delete_namespace: bool, force_delete_crd: bool) -> bool {
    match key.gvk.kind.as_str() {
        "CustomResourceDefinition" => force_delete_crd,
        "Namespace" => force_delete_namespace,
        // removed with the namespace
        kind if force_delete_namespace => is_cluster_scoped(kind),
        _ => true,
    }
}

async fn is_scaled_down(store: &dyn ObjectStore, key: &ObjectKey) -> Result<bool> {
    let deployment = match store.get(key).await? {
        Resource::Deployment(d) => d,
        other => {
            return Err(Error::serialization_for_kind(
                other.kind(),
                format!("{} is not a Deployment", key),
            ))
        }
    };
    let status = deployment.status.unwrap_or_default();
    Ok(status.replicas.unwrap_or(0) == 0
        && status.ready_replicas.unwrap_or(0) == 0
        && status.available_replicas.unwrap_or(0) == 0)
}
