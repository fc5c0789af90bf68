//! Components bundle of a provider
//!
//! A bundle is the set of manifest objects implementing one provider, already
//! rewritten for the installation at hand:
//!
//! - every namespaced object is forced into the target namespace, and a
//!   Namespace object for it is added when the manifest has none
//! - the `manager` container of each controller watches the requested namespace
//! - every object carries the clusterctl labels, which later drive teardown
//!   and pivot

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use tugboat_common::crd::{Provider, ProviderType};
use tugboat_common::object::is_cluster_scoped;
use tugboat_common::{Error, Resource, Result, CLUSTERCTL_LABEL, CLUSTERCTL_PROVIDER_LABEL};

/// Container whose args carry the watch namespace
const CONTROLLER_CONTAINER_NAME: &str = "manager";
/// Controller flag restricting reconciliation to one namespace
const NAMESPACE_ARG_PREFIX: &str = "--namespace=";

/// How to lay out a bundle
#[derive(Clone, Debug)]
pub struct ComponentsOptions {
    /// Provider name
    pub name: String,
    /// Provider role
    pub provider_type: ProviderType,
    /// Provider version
    pub version: String,
    /// Namespace to install into; defaults to the manifest's Namespace object
    pub target_namespace: Option<String>,
    /// Namespace the controllers should watch; empty keeps the manifest's
    pub watching_namespace: String,
}

impl ComponentsOptions {
    /// Options for a provider version, keeping the manifest's namespaces
    pub fn new(name: impl Into<String>, provider_type: ProviderType, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider_type,
            version: version.into(),
            target_namespace: None,
            watching_namespace: String::new(),
        }
    }

    /// Install into `namespace`
    pub fn with_target_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.target_namespace = (!namespace.is_empty()).then_some(namespace);
        self
    }

    /// Make the controllers watch `namespace`
    pub fn with_watching_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.watching_namespace = namespace.into();
        self
    }
}

/// Manifest objects of one provider, ready to install
#[derive(Clone, Debug)]
pub struct Components {
    name: String,
    provider_type: ProviderType,
    version: String,
    target_namespace: String,
    watching_namespace: String,
    objects: Vec<Resource>,
}

impl Components {
    /// Build a bundle from a multi-document YAML manifest
    pub fn from_yaml(yaml: &str, options: ComponentsOptions) -> Result<Self> {
        let mut objects = Vec::new();
        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = Value::deserialize(document).map_err(|e| {
                Error::serialization(format!(
                    "invalid components manifest for provider \"{}\": {}",
                    options.name, e
                ))
            })?;
            if value.is_null() {
                continue;
            }
            objects.push(Resource::from_value(value)?);
        }
        Self::from_objects(objects, options)
    }

    /// Build a bundle from parsed manifest objects
    pub fn from_objects(mut objects: Vec<Resource>, options: ComponentsOptions) -> Result<Self> {
        let namespaces: Vec<String> = objects
            .iter()
            .filter(|o| matches!(o, Resource::Namespace(_)))
            .map(|o| o.name().to_string())
            .collect();
        if namespaces.len() > 1 {
            return Err(Error::configuration(format!(
                "Invalid manifest for provider \"{}\". There should be no more than one resource with Kind Namespace in the provider components yaml",
                options.name
            )));
        }

        let target_namespace = match (&options.target_namespace, namespaces.first()) {
            (Some(ns), _) => ns.clone(),
            (None, Some(ns)) if !ns.is_empty() => ns.clone(),
            _ => {
                return Err(Error::configuration(
                    "target namespace can't be defaulted. Please specify a target namespace",
                ))
            }
        };

        fix_target_namespace(&mut objects, &target_namespace);
        if namespaces.is_empty() {
            debug!(namespace = %target_namespace, provider = %options.name, "Adding missing Namespace to components");
            objects.push(Resource::Namespace(Namespace {
                metadata: ObjectMeta {
                    name: Some(target_namespace.clone()),
                    ..Default::default()
                },
                ..Default::default()
            }));
        }

        let current = inspect_watch_namespace(&objects)?;
        let watching_namespace = if options.watching_namespace.is_empty() {
            current
        } else {
            if options.watching_namespace != current {
                fix_watch_namespace(&mut objects, &options.watching_namespace);
            }
            options.watching_namespace.clone()
        };

        for obj in &mut objects {
            add_common_labels(obj.meta_mut(), &options.name);
        }

        Ok(Self {
            name: options.name,
            provider_type: options.provider_type,
            version: options.version,
            target_namespace,
            watching_namespace,
            objects,
        })
    }

    /// Provider name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provider role
    pub fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    /// Provider version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Namespace every namespaced object lives in
    pub fn target_namespace(&self) -> &str {
        &self.target_namespace
    }

    /// Namespace the controllers watch; empty for all namespaces
    pub fn watching_namespace(&self) -> &str {
        &self.watching_namespace
    }

    /// Objects in manifest order
    pub fn objects(&self) -> &[Resource] {
        &self.objects
    }

    /// Registry record describing this installation
    pub fn provider(&self) -> Provider {
        let mut provider = Provider::record(
            &self.target_namespace,
            &self.name,
            self.provider_type,
            &self.version,
            &self.watching_namespace,
        );
        add_common_labels(&mut provider.metadata, &self.name);
        provider
    }
}

fn fix_target_namespace(objects: &mut [Resource], target_namespace: &str) {
    for obj in objects {
        if let Resource::Namespace(ns) = obj {
            ns.metadata.name = Some(target_namespace.to_string());
        } else if !is_cluster_scoped(&obj.kind()) {
            obj.meta_mut().namespace = Some(target_namespace.to_string());
        }
    }
}

fn manager_args(deployment: &Deployment) -> impl Iterator<Item = &Vec<String>> {
    deployment
        .spec
        .iter()
        .filter_map(|s| s.template.spec.as_ref())
        .flat_map(|pod| pod.containers.iter())
        .filter(|c| c.name == CONTROLLER_CONTAINER_NAME)
        .filter_map(|c| c.args.as_ref())
}

/// The namespace controllers are currently told to watch
fn inspect_watch_namespace(objects: &[Resource]) -> Result<String> {
    let mut found: Option<String> = None;
    for obj in objects {
        let Resource::Deployment(deployment) = obj else {
            continue;
        };
        for args in manager_args(deployment) {
            for arg in args {
                let Some(ns) = arg.strip_prefix(NAMESPACE_ARG_PREFIX) else {
                    continue;
                };
                match &found {
                    Some(prev) if prev != ns => {
                        return Err(Error::configuration(
                            "Invalid manifest. All the controllers should watch the same namespace",
                        ))
                    }
                    _ => found = Some(ns.to_string()),
                }
            }
        }
    }
    Ok(found.unwrap_or_default())
}

/// Point every controller at `namespace`; empty removes the restriction
fn fix_watch_namespace(objects: &mut [Resource], namespace: &str) {
    for obj in objects {
        let Resource::Deployment(deployment) = obj else {
            continue;
        };
        let containers = deployment
            .spec
            .iter_mut()
            .filter_map(|s| s.template.spec.as_mut())
            .flat_map(|pod| pod.containers.iter_mut())
            .filter(|c| c.name == CONTROLLER_CONTAINER_NAME);

        for container in containers {
            let args = container.args.get_or_insert_with(Vec::new);
            args.retain(|a| !a.starts_with(NAMESPACE_ARG_PREFIX));
            if !namespace.is_empty() {
                args.push(format!("{}{}", NAMESPACE_ARG_PREFIX, namespace));
            }
        }
    }
}

fn add_common_labels(meta: &mut ObjectMeta, provider_name: &str) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(CLUSTERCTL_LABEL.to_string(), String::new());
    labels.insert(
        CLUSTERCTL_PROVIDER_LABEL.to_string(),
        provider_name.to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: capd-system
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: dockerclusters.infrastructure.cluster.x-k8s.io
spec:
  group: infrastructure.cluster.x-k8s.io
  names:
    kind: DockerCluster
    plural: dockerclusters
  scope: Namespaced
  versions: []
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: capd-controller-manager
  namespace: capd-system
spec:
  selector:
    matchLabels:
      control-plane: controller-manager
  template:
    metadata:
      labels:
        control-plane: controller-manager
    spec:
      containers:
      - name: manager
        image: capd-manager:dev
        args:
        - --metrics-addr=127.0.0.1:8080
      - name: kube-rbac-proxy
        image: kube-rbac-proxy:v0.4.1
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: capd-manager-role
rules: []
"#;

    fn docker() -> ComponentsOptions {
        ComponentsOptions::new("docker", ProviderType::Infrastructure, "v0.2.0")
    }

    fn manager(components: &Components) -> Vec<String> {
        components
            .objects()
            .iter()
            .find_map(|o| match o {
                Resource::Deployment(d) => manager_args(d).next().cloned(),
                _ => None,
            })
            .unwrap_or_default()
    }

    // ==========================================================================
    // Story Tests: Laying out a bundle
    // ==========================================================================

    /// Story: Without options the manifest's own namespace is used
    #[test]
    fn story_target_namespace_defaults_to_manifest_namespace() {
        let components = Components::from_yaml(MANIFEST, docker()).unwrap();

        assert_eq!(components.target_namespace(), "capd-system");
        assert_eq!(components.watching_namespace(), "");
        assert_eq!(components.objects().len(), 4);

        for obj in components.objects() {
            let labels = obj.meta().labels.as_ref().unwrap();
            assert_eq!(labels.get(CLUSTERCTL_LABEL).map(String::as_str), Some(""));
            assert_eq!(
                labels.get(CLUSTERCTL_PROVIDER_LABEL).map(String::as_str),
                Some("docker")
            );
        }
    }

    /// Story: An explicit target namespace renames the Namespace and moves
    /// every namespaced object while cluster-scoped ones stay put
    #[test]
    fn story_target_namespace_override() {
        let components =
            Components::from_yaml(MANIFEST, docker().with_target_namespace("team-a-capd")).unwrap();

        for obj in components.objects() {
            match obj.kind().as_str() {
                "Namespace" => assert_eq!(obj.name(), "team-a-capd"),
                "Deployment" => assert_eq!(obj.namespace(), Some("team-a-capd")),
                _ => assert_eq!(obj.namespace(), None, "{}", obj.key()),
            }
        }
    }

    /// Story: A manifest without a Namespace gets one injected
    #[test]
    fn story_missing_namespace_is_injected() {
        let manifest = MANIFEST.split_once("---").unwrap().1;
        let components =
            Components::from_yaml(manifest, docker().with_target_namespace("capd-system")).unwrap();

        let namespaces: Vec<_> = components
            .objects()
            .iter()
            .filter(|o| o.kind() == "Namespace")
            .collect();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0].name(), "capd-system");
        assert!(namespaces[0].meta().labels.is_some());
    }

    #[test]
    fn missing_namespace_without_target_cannot_be_defaulted() {
        let manifest = MANIFEST.split_once("---").unwrap().1;
        let err = Components::from_yaml(manifest, docker()).unwrap_err();
        assert!(err.to_string().contains("target namespace can't be defaulted"));
    }

    #[test]
    fn more_than_one_namespace_is_rejected() {
        let manifest = format!(
            "{}\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: other\n",
            MANIFEST
        );
        let err = Components::from_yaml(&manifest, docker()).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    // ==========================================================================
    // Story Tests: Watch namespace
    // ==========================================================================

    /// Story: Requesting a watch namespace rewrites the manager args only
    #[test]
    fn story_watching_namespace_is_written_to_manager_args() {
        let components =
            Components::from_yaml(MANIFEST, docker().with_watching_namespace("team-a")).unwrap();

        assert_eq!(components.watching_namespace(), "team-a");
        assert_eq!(
            manager(&components),
            vec![
                "--metrics-addr=127.0.0.1:8080".to_string(),
                "--namespace=team-a".to_string()
            ]
        );

        let rewritten =
            Components::from_objects(components.objects().to_vec(), docker().with_watching_namespace("team-b"))
                .unwrap();
        assert_eq!(
            manager(&rewritten),
            vec![
                "--metrics-addr=127.0.0.1:8080".to_string(),
                "--namespace=team-b".to_string()
            ]
        );
    }

    /// Story: Without a request the manifest's watch namespace is reported
    #[test]
    fn story_watching_namespace_is_read_back() {
        let manifest = MANIFEST.replace(
            "- --metrics-addr=127.0.0.1:8080",
            "- --metrics-addr=127.0.0.1:8080\n        - --namespace=team-c",
        );
        let components = Components::from_yaml(&manifest, docker()).unwrap();
        assert_eq!(components.watching_namespace(), "team-c");
        assert_eq!(components.provider().spec.watched_namespace, "team-c");
    }

    #[test]
    fn provider_record_matches_bundle() {
        let components = Components::from_yaml(
            MANIFEST,
            docker()
                .with_target_namespace("ns1")
                .with_watching_namespace("team-a"),
        )
        .unwrap();
        let provider = components.provider();

        assert_eq!(provider.instance_name(), "ns1/docker");
        assert_eq!(provider.spec.provider_type, ProviderType::Infrastructure);
        assert_eq!(provider.spec.version, "v0.2.0");
        assert_eq!(provider.spec.watched_namespace, "team-a");
        assert_eq!(
            provider
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(CLUSTERCTL_PROVIDER_LABEL))
                .map(String::as_str),
            Some("docker")
        );
    }
}
