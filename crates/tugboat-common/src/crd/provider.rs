//! Provider registry record

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Name of the CustomResourceDefinition backing the registry
pub const PROVIDER_CRD_NAME: &str = "providers.clusterctl.cluster.x-k8s.io";

/// Role a provider plays in the management cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ProviderType {
    /// The Cluster API core controllers
    #[serde(rename = "CoreProvider")]
    Core,
    /// Turns machines into nodes
    #[serde(rename = "BootstrapProvider")]
    Bootstrap,
    /// Provisions the underlying infrastructure
    #[serde(rename = "InfrastructureProvider")]
    Infrastructure,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core => write!(f, "CoreProvider"),
            Self::Bootstrap => write!(f, "BootstrapProvider"),
            Self::Infrastructure => write!(f, "InfrastructureProvider"),
        }
    }
}

/// An installed provider instance
///
/// Identified by namespace and name. Several instances of the same provider
/// may coexist in different namespaces as long as they share a version and
/// watch disjoint namespaces.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clusterctl.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "Provider",
    plural = "providers",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Watch Namespace","type":"string","jsonPath":".spec.watchedNamespace"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    /// Provider role
    #[serde(rename = "type")]
    pub provider_type: ProviderType,

    /// Installed version
    pub version: String,

    /// Namespace the controllers reconcile; empty means all namespaces
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub watched_namespace: String,
}

impl Provider {
    /// Build a record for a provider installed in `namespace`
    pub fn record(
        namespace: &str,
        name: &str,
        provider_type: ProviderType,
        version: &str,
        watched_namespace: &str,
    ) -> Self {
        let mut provider = Provider::new(
            name,
            ProviderSpec {
                provider_type,
                version: version.to_string(),
                watched_namespace: watched_namespace.to_string(),
            },
        );
        provider.metadata.namespace = Some(namespace.to_string());
        provider
    }

    /// Provider name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace the provider is installed in
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// `namespace/name`, used in logs and error messages
    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    /// True when both records describe the same installation
    pub fn same_installation(&self, other: &Provider) -> bool {
        self.spec.version == other.spec.version
            && self.spec.watched_namespace == other.spec.watched_namespace
    }
}
