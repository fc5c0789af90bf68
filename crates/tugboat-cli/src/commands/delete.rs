//! Delete command - Remove providers from a management cluster
//!
//! Usage: tugboat delete [--all | <ref>...] [-n] [-c]
//!
//! Provider namespaces and CRDs are kept unless `--delete-namespace` or
//! `--delete-crd` is given; CRDs are shared by every instance of a provider.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use tugboat_common::crd::Provider;
use tugboat_common::ObjectStore;
use tugboat_provider::{ComponentsTeardown, MetadataRegistry, ProviderFilter, ProviderRef};

use super::connect;
use crate::{Error, Result};

/// Remove providers from a management cluster
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Providers to delete, as `[namespace/]name`
    pub providers: Vec<String>,

    /// Delete every installed provider
    #[arg(long)]
    pub all: bool,

    /// Also delete the namespaces the providers are installed in
    #[arg(short = 'n', long)]
    pub delete_namespace: bool,

    /// Also delete the provider CRDs, and with them every object of those kinds
    #[arg(short = 'c', long)]
    pub delete_crd: bool,

    /// Path to kubeconfig for the management cluster
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

/// What to delete
#[derive(Debug, Clone, Default)]
pub struct DeleteRequest {
    pub providers: Vec<String>,
    pub all: bool,
    pub delete_namespace: bool,
    pub delete_crd: bool,
}

impl From<&DeleteArgs> for DeleteRequest {
    fn from(args: &DeleteArgs) -> Self {
        Self {
            providers: args.providers.clone(),
            all: args.all,
            delete_namespace: args.delete_namespace,
            delete_crd: args.delete_crd,
        }
    }
}

pub async fn run(args: DeleteArgs) -> Result<()> {
    let store = connect(args.kubeconfig.as_deref()).await?;
    let deleted = delete(store, &DeleteRequest::from(&args)).await?;
    for provider in &deleted {
        println!("Deleted provider {}", provider.instance_name());
    }
    Ok(())
}

/// Delete the requested providers, returning their records
pub async fn delete(store: Arc<dyn ObjectStore>, request: &DeleteRequest) -> Result<Vec<Provider>> {
    match (request.all, request.providers.is_empty()) {
        (true, false) => {
            return Err(Error::validation(
                "The --all flag can't be used in combination with the list of providers",
            ))
        }
        (false, true) => {
            return Err(Error::validation(
                "At least one provider should be specified or the --all flag should be set",
            ))
        }
        _ => {}
    }

    let registry = MetadataRegistry::new(store.clone());
    registry.ensure_metadata().await?;

    let providers = if request.all {
        registry.list(&ProviderFilter::new()).await?
    } else {
        let mut providers = Vec::with_capacity(request.providers.len());
        for reference in &request.providers {
            providers.push(resolve(&registry, reference).await?);
        }
        providers
    };

    let teardown = ComponentsTeardown::new(store);
    for provider in &providers {
        teardown
            .delete(provider, request.delete_namespace, request.delete_crd)
            .await?;
    }
    info!(count = providers.len(), "Providers deleted");
    Ok(providers)
}

/// Find the installed record a reference points at
async fn resolve(registry: &MetadataRegistry, reference: &str) -> Result<Provider> {
    let reference = ProviderRef::parse(reference)?;
    let namespace = match reference.namespace {
        Some(ns) => ns,
        None => registry
            .default_namespace(&reference.name)
            .await?
            .ok_or_else(|| {
                Error::validation(format!(
                    "Unable to find default namespace for \"{}\" provider. Please specify the provider's namespace",
                    reference.name
                ))
            })?,
    };

    match registry.get(&namespace, &reference.name).await {
        Ok(provider) => Ok(provider),
        Err(e) if e.is_not_found() => Err(Error::validation(format!(
            "Failed to find provider \"{}\"",
            reference.name
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use kube::CustomResourceExt;
    use rstest::rstest;
    use tugboat_common::crd::ProviderType;
    use tugboat_common::memory::MemoryStore;
    use tugboat_common::{Gvk, ObjectKey, Resource};

    fn record(ns: &str, name: &str, watched: &str) -> Resource {
        Resource::Provider(Provider::record(
            ns,
            name,
            ProviderType::Infrastructure,
            "v0.2.0",
            watched,
        ))
    }

    fn controller(ns: &str, name: &str) -> Resource {
        Resource::from_yaml(&format!(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {name}-controller-manager
  namespace: {ns}
  labels:
    clusterctl.cluster.x-k8s.io: ""
    clusterctl.cluster.x-k8s.io/provider: {name}
spec:
  replicas: 0
  selector: {{}}
  template: {{}}
"#
        ))
        .unwrap()
    }

    fn controller_key(ns: &str, name: &str) -> ObjectKey {
        ObjectKey::namespaced(
            Gvk::of::<Deployment>(),
            ns,
            format!("{}-controller-manager", name),
        )
    }

    fn store(objects: Vec<Resource>) -> Arc<MemoryStore> {
        let mut seeded = vec![Resource::CustomResourceDefinition(Provider::crd())];
        seeded.extend(objects);
        Arc::new(MemoryStore::seeded(seeded))
    }

    #[rstest]
    #[case::names_and_all(vec!["docker"], true, "can't be used in combination")]
    #[case::nothing(vec![], false, "At least one provider")]
    #[tokio::test]
    async fn selection_must_be_unambiguous(
        #[case] providers: Vec<&str>,
        #[case] all: bool,
        #[case] message: &str,
    ) {
        let request = DeleteRequest {
            providers: providers.into_iter().map(str::to_string).collect(),
            all,
            ..Default::default()
        };
        let err = delete(store(vec![]), &request).await.unwrap_err();
        assert!(err.to_string().contains(message), "{}", err);
    }

    // ==========================================================================
    // Story Tests: Deleting providers
    // ==========================================================================

    /// Story: A single instance is found without naming its namespace
    #[tokio::test]
    async fn story_delete_by_name_uses_default_namespace() {
        let store = store(vec![
            record("capd-system", "docker", ""),
            controller("capd-system", "docker"),
        ]);
        let request = DeleteRequest {
            providers: vec!["docker".to_string()],
            ..Default::default()
        };

        let deleted = delete(store.clone(), &request).await.unwrap();

        assert_eq!(deleted.len(), 1);
        assert!(!store.contains(&controller_key("capd-system", "docker")));
        assert!(MetadataRegistry::new(store)
            .list(&ProviderFilter::new())
            .await
            .unwrap()
            .is_empty());
    }

    /// Story: Several instances need the namespace spelled out
    #[tokio::test]
    async fn story_ambiguous_name_needs_namespace() {
        let store = store(vec![
            record("team-a", "docker", "team-a"),
            record("team-b", "docker", "team-b"),
            controller("team-a", "docker"),
            controller("team-b", "docker"),
        ]);

        let err = delete(
            store.clone(),
            &DeleteRequest {
                providers: vec!["docker".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Unable to find default namespace"), "{}", err);

        delete(
            store.clone(),
            &DeleteRequest {
                providers: vec!["team-b/docker".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(store.contains(&controller_key("team-a", "docker")));
        assert!(!store.contains(&controller_key("team-b", "docker")));
    }

    /// Story: Naming a provider that is not installed fails before deleting
    #[tokio::test]
    async fn story_unknown_provider_is_reported() {
        let store = store(vec![
            record("capd-system", "docker", ""),
            controller("capd-system", "docker"),
        ]);
        let request = DeleteRequest {
            providers: vec!["capd-system/docker".to_string(), "other/kubeadm".to_string()],
            ..Default::default()
        };

        let err = delete(store.clone(), &request).await.unwrap_err();

        assert!(err.to_string().contains("Failed to find provider \"kubeadm\""), "{}", err);
        assert!(store.contains(&controller_key("capd-system", "docker")));
    }

    /// Story: --all removes every installed provider
    #[tokio::test]
    async fn story_delete_all() {
        let store = store(vec![
            record("team-a", "docker", "team-a"),
            record("capi-system", "cluster-api", ""),
            controller("team-a", "docker"),
            controller("capi-system", "cluster-api"),
        ]);
        let request = DeleteRequest {
            all: true,
            delete_crd: true,
            ..Default::default()
        };

        let deleted = delete(store.clone(), &request).await.unwrap();

        assert_eq!(deleted.len(), 2);
        assert!(!store.contains(&controller_key("team-a", "docker")));
        assert!(!store.contains(&controller_key("capi-system", "cluster-api")));
    }
}
