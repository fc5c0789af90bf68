//! Object model shared by every store
//!
//! [`Resource`] is a closed set of the kinds tugboat reasons about, plus a
//! catch-all [`Resource::Other`] for manifest objects that are only ever
//! created, listed and deleted. Conversion between the typed variants and the
//! wire form goes through `serde_json`.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, ObjectReference, Secret, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, TypeMeta};
use serde_json::Value;

use crate::crd::{Cluster, Machine, MachineDeployment, MachineSet, Provider};
use crate::kube_utils::parse_api_version;
use crate::{Error, Result};

/// Kinds that are never namespaced
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "PodSecurityPolicy",
    "CertificateSigningRequest",
    "ClusterRoleBinding",
    "ClusterRole",
    "VolumeAttachment",
    "StorageClass",
    "CSIDriver",
    "CSINode",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "CustomResourceDefinition",
    "PriorityClass",
    "RuntimeClass",
];

/// Whether objects of `kind` live outside any namespace
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Group, version and kind of an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvk {
    /// API group; empty for the core group
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind
    pub kind: String,
}

impl Gvk {
    /// Build from parts
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Build from an `apiVersion` string such as `apps/v1` or `v1`
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = parse_api_version(api_version);
        Self::new(group, version, kind)
    }

    /// GVK of a statically typed resource
    pub fn of<K: kube::Resource<DynamicType = ()>>() -> Self {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    /// The `apiVersion` string
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// Identity of an object in a store
///
/// Also used as the opaque reference the mover follows for infrastructure
/// and bootstrap objects it has no type for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Group, version and kind
    pub gvk: Gvk,
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object
    pub fn namespaced(gvk: Gvk, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object
    pub fn cluster_scoped(gvk: Gvk, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of a statically typed object
    pub fn of<K: kube::Resource<DynamicType = ()>>(obj: &K) -> Self {
        let meta = kube::Resource::meta(obj);
        Self {
            gvk: Gvk::of::<K>(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    /// Resolve an object reference found in a spec.
    ///
    /// References without a namespace point into `default_namespace`.
    pub fn from_reference(reference: &ObjectReference, default_namespace: &str) -> Result<Self> {
        let (Some(api_version), Some(kind), Some(name)) = (
            reference.api_version.as_deref(),
            reference.kind.as_deref(),
            reference.name.as_deref(),
        ) else {
            return Err(Error::configuration(format!(
                "incomplete object reference {:?}: apiVersion, kind and name are required",
                reference
            )));
        };

        let namespace = reference
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace);

        Ok(Self::namespaced(
            Gvk::from_api_version(api_version, kind),
            namespace,
            name,
        ))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk.kind, ns, self.name),
            None => write!(f, "{} {}", self.gvk.kind, self.name),
        }
    }
}

/// An object held by a store
#[derive(Clone, Debug)]
pub enum Resource {
    /// Core Namespace
    Namespace(Namespace),
    /// CustomResourceDefinition
    CustomResourceDefinition(CustomResourceDefinition),
    /// apps/v1 Deployment
    Deployment(Deployment),
    /// Core Service
    Service(Service),
    /// Core Secret
    Secret(Secret),
    /// Provider registry record
    Provider(Provider),
    /// Cluster API Cluster
    Cluster(Cluster),
    /// Cluster API MachineDeployment
    MachineDeployment(MachineDeployment),
    /// Cluster API MachineSet
    MachineSet(MachineSet),
    /// Cluster API Machine
    Machine(Machine),
    /// Any other kind, kept as an untyped object
    Other(DynamicObject),
}

macro_rules! with_inner {
    ($self:expr, $obj:ident => $body:expr) => {
        match $self {
            Resource::Namespace($obj) => $body,
            Resource::CustomResourceDefinition($obj) => $body,
            Resource::Deployment($obj) => $body,
            Resource::Service($obj) => $body,
            Resource::Secret($obj) => $body,
            Resource::Provider($obj) => $body,
            Resource::Cluster($obj) => $body,
            Resource::MachineDeployment($obj) => $body,
            Resource::MachineSet($obj) => $body,
            Resource::Machine($obj) => $body,
            Resource::Other($obj) => $body,
        }
    };
}

macro_rules! impl_from_typed {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Resource {
                fn from(obj: $variant) -> Self {
                    Resource::$variant(obj)
                }
            }

            impl TryFrom<Resource> for $variant {
                type Error = Resource;

                fn try_from(obj: Resource) -> std::result::Result<Self, Resource> {
                    match obj {
                        Resource::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

impl_from_typed!(
    Namespace,
    CustomResourceDefinition,
    Deployment,
    Service,
    Secret,
    Provider,
    Cluster,
    MachineDeployment,
    MachineSet,
    Machine,
);

impl From<DynamicObject> for Resource {
    fn from(obj: DynamicObject) -> Self {
        Resource::Other(obj)
    }
}

impl Resource {
    /// Object metadata
    pub fn meta(&self) -> &ObjectMeta {
        with_inner!(self, obj => kube::Resource::meta(obj))
    }

    /// Mutable object metadata
    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        with_inner!(self, obj => kube::Resource::meta_mut(obj))
    }

    /// Group, version and kind
    pub fn gvk(&self) -> Gvk {
        match self {
            Resource::Namespace(_) => Gvk::of::<Namespace>(),
            Resource::CustomResourceDefinition(_) => Gvk::of::<CustomResourceDefinition>(),
            Resource::Deployment(_) => Gvk::of::<Deployment>(),
            Resource::Service(_) => Gvk::of::<Service>(),
            Resource::Secret(_) => Gvk::of::<Secret>(),
            Resource::Provider(_) => Gvk::of::<Provider>(),
            Resource::Cluster(_) => Gvk::of::<Cluster>(),
            Resource::MachineDeployment(_) => Gvk::of::<MachineDeployment>(),
            Resource::MachineSet(_) => Gvk::of::<MachineSet>(),
            Resource::Machine(_) => Gvk::of::<Machine>(),
            Resource::Other(obj) => obj
                .types
                .as_ref()
                .map(|t| Gvk::from_api_version(&t.api_version, &t.kind))
                .unwrap_or_else(|| Gvk::new("", "", "")),
        }
    }

    /// Kind of the object
    pub fn kind(&self) -> String {
        self.gvk().kind
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, if any
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }

    /// Store identity
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            gvk: self.gvk(),
            namespace: self.meta().namespace.clone(),
            name: self.name().to_string(),
        }
    }

    /// Drop the concurrency token so the object can be created elsewhere
    pub fn clear_resource_version(&mut self) {
        self.meta_mut().resource_version = None;
    }

    /// Drop all owner references
    pub fn clear_owner_references(&mut self) {
        self.meta_mut().owner_references = None;
    }

    /// Drop all finalizers
    pub fn clear_finalizers(&mut self) {
        self.meta_mut().finalizers = Some(Vec::new());
    }

    /// True when the object is being torn down in place
    pub fn is_being_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Wire representation
    pub fn to_value(&self) -> Result<Value> {
        let kind = self.kind();
        with_inner!(self, obj => serde_json::to_value(obj))
            .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
    }

    /// Untyped representation, as sent to the API server
    pub fn to_dynamic(&self) -> Result<DynamicObject> {
        let gvk = self.gvk();
        let mut obj: DynamicObject = serde_json::from_value(self.to_value()?)
            .map_err(|e| Error::serialization_for_kind(&gvk.kind, e.to_string()))?;
        obj.types = Some(TypeMeta {
            api_version: gvk.api_version(),
            kind: gvk.kind,
        });
        Ok(obj)
    }

    /// Parse the wire representation, picking the typed variant when known
    pub fn from_value(value: Value) -> Result<Self> {
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization("object has no apiVersion"))?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::serialization("object has no kind"))?;
        let gvk = Gvk::from_api_version(api_version, kind);

        fn typed<T: serde::de::DeserializeOwned>(gvk: &Gvk, value: Value) -> Result<T> {
            serde_json::from_value(value)
                .map_err(|e| Error::serialization_for_kind(&gvk.kind, e.to_string()))
        }

        let resource = if gvk == Gvk::of::<Namespace>() {
            Resource::Namespace(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<CustomResourceDefinition>() {
            Resource::CustomResourceDefinition(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<Deployment>() {
            Resource::Deployment(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<Service>() {
            Resource::Service(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<Secret>() {
            Resource::Secret(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<Provider>() {
            Resource::Provider(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<Cluster>() {
            Resource::Cluster(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<MachineDeployment>() {
            Resource::MachineDeployment(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<MachineSet>() {
            Resource::MachineSet(typed(&gvk, value)?)
        } else if gvk == Gvk::of::<Machine>() {
            Resource::Machine(typed(&gvk, value)?)
        } else {
            Resource::Other(typed(&gvk, value)?)
        };
        Ok(resource)
    }

    /// Convert an untyped object returned by the API server
    pub fn from_dynamic(obj: DynamicObject) -> Result<Self> {
        let value = serde_json::to_value(&obj)?;
        Self::from_value(value)
    }

    /// Parse a single YAML document
    pub fn from_yaml(doc: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(doc)
            .map_err(|e| Error::serialization(format!("invalid manifest: {}", e)))?;
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ProviderType;
    use rstest::rstest;

    #[test]
    fn known_kinds_parse_into_typed_variants() {
        let ns = Resource::from_yaml("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: capi-system\n")
            .unwrap();
        assert!(matches!(ns, Resource::Namespace(_)));
        assert_eq!(ns.key().to_string(), "Namespace capi-system");

        let provider = Resource::from(Provider::record(
            "capi-system",
            "cluster-api",
            ProviderType::Core,
            "v0.3.0",
            "",
        ));
        let parsed = Resource::from_value(provider.to_value().unwrap()).unwrap();
        assert!(matches!(parsed, Resource::Provider(_)));
    }

    #[test]
    fn unknown_kinds_stay_untyped_with_type_meta() {
        let obj = Resource::from_yaml(
            "apiVersion: infrastructure.cluster.x-k8s.io/v1alpha2\nkind: DockerCluster\nmetadata:\n  name: c1\n  namespace: ns1\nspec:\n  foo: bar\n",
        )
        .unwrap();

        assert!(matches!(obj, Resource::Other(_)));
        assert_eq!(
            obj.gvk(),
            Gvk::new("infrastructure.cluster.x-k8s.io", "v1alpha2", "DockerCluster")
        );
        assert_eq!(obj.to_value().unwrap()["spec"]["foo"], "bar");
    }

    #[test]
    fn typed_variants_convert_back_out() {
        let secret = Resource::from_yaml("apiVersion: v1\nkind: Secret\nmetadata:\n  name: c1-kubeconfig\n  namespace: ns1\n")
            .unwrap();
        let typed = Secret::try_from(secret).unwrap();
        assert_eq!(ObjectKey::of(&typed).to_string(), "Secret ns1/c1-kubeconfig");

        let not_a_machine = Resource::from(typed);
        let back = Machine::try_from(not_a_machine).unwrap_err();
        assert_eq!(back.kind(), "Secret");
    }

    #[test]
    fn documents_without_type_information_are_rejected() {
        let err = Resource::from_yaml("metadata:\n  name: x\n").unwrap_err();
        assert!(err.to_string().contains("apiVersion"));
    }

    #[test]
    fn reference_namespace_defaults_to_owner_namespace() {
        let reference = ObjectReference {
            api_version: Some("infrastructure.cluster.x-k8s.io/v1alpha2".to_string()),
            kind: Some("DockerMachine".to_string()),
            name: Some("m1".to_string()),
            ..Default::default()
        };
        let key = ObjectKey::from_reference(&reference, "ns1").unwrap();
        assert_eq!(key.namespace.as_deref(), Some("ns1"));
        assert_eq!(key.to_string(), "DockerMachine ns1/m1");

        let incomplete = ObjectReference {
            name: Some("m1".to_string()),
            ..Default::default()
        };
        assert!(ObjectKey::from_reference(&incomplete, "ns1").is_err());
    }

    #[rstest]
    #[case::crd("CustomResourceDefinition", true)]
    #[case::cluster_role("ClusterRole", true)]
    #[case::webhook("MutatingWebhookConfiguration", true)]
    #[case::deployment("Deployment", false)]
    #[case::role("Role", false)]
    #[case::capi_cluster("Cluster", false)]
    fn cluster_scoped_kinds(#[case] kind: &str, #[case] expected: bool) {
        assert_eq!(is_cluster_scoped(kind), expected);
    }

    #[test]
    fn metadata_clearing_helpers() {
        let mut secret = Resource::from_yaml(
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: c1-kubeconfig\n  namespace: ns1\n  resourceVersion: \"42\"\n  finalizers: [x]\n  ownerReferences:\n  - apiVersion: v1\n    kind: Foo\n    name: f\n    uid: u\n",
        )
        .unwrap();
        secret.clear_resource_version();
        secret.clear_owner_references();
        secret.clear_finalizers();
        assert!(secret.meta().resource_version.is_none());
        assert!(secret.meta().owner_references.is_none());
        assert_eq!(secret.meta().finalizers.as_deref(), Some(&[][..]));
    }
}
