//! Cluster API kinds relocated by the mover
//!
//! Only the references the mover follows are typed. Everything else lives in
//! the flattened `extra` maps so an object survives a move byte-for-byte
//! apart from the fields the mover deliberately clears.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// API group of the Cluster API kinds
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// API version of the Cluster API kinds handled by the mover
pub const CAPI_VERSION: &str = "v1alpha2";

/// Cluster spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Provider-specific cluster infrastructure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Cluster status, carried through opaquely
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterStatus {
    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// MachineDeployment spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "MachineDeployment",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineDeploymentSpec {
    /// Template for the machines this deployment rolls out
    #[serde(default)]
    pub template: MachineTemplateSpec,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// MachineSet spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "MachineSet",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Template for the machines this set keeps running
    #[serde(default)]
    pub template: MachineTemplateSpec,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Machine template embedded in MachineDeployments and MachineSets
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Spec of the machines created from this template
    #[serde(default)]
    pub spec: MachineSpec,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Machine spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "Machine",
    namespaced,
    status = "MachineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Bootstrap configuration
    #[serde(default)]
    pub bootstrap: Bootstrap,

    /// Provider-specific machine infrastructure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Bootstrap section of a machine spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Provider-specific bootstrap configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<ObjectReference>,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Machine status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node the machine has been assigned, once provisioned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,

    /// Fields not interpreted by tugboat
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Machine {
    /// True once the machine has been assigned a node
    pub fn has_node_ref(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.node_ref.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let value = serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1alpha2",
            "kind": "Machine",
            "metadata": {"name": "m1", "namespace": "ns1"},
            "spec": {
                "version": "v1.16.3",
                "providerID": "docker:////m1",
                "bootstrap": {
                    "configRef": {"apiVersion": "bootstrap.cluster.x-k8s.io/v1alpha2", "kind": "KubeadmConfig", "name": "m1"},
                    "data": "Y2xvdWQtaW5pdA=="
                },
                "infrastructureRef": {"apiVersion": "infrastructure.cluster.x-k8s.io/v1alpha2", "kind": "DockerMachine", "name": "m1"}
            },
            "status": {"phase": "running", "nodeRef": {"kind": "Node", "name": "node-1"}}
        });

        let machine: Machine = serde_json::from_value(value.clone()).unwrap();
        assert!(machine.has_node_ref());
        assert_eq!(
            machine
                .spec
                .bootstrap
                .config_ref
                .as_ref()
                .and_then(|r| r.kind.as_deref()),
            Some("KubeadmConfig")
        );
        assert_eq!(serde_json::to_value(&machine).unwrap(), value);
    }

    #[test]
    fn machine_without_status_is_not_ready() {
        let machine = Machine::new("m1", MachineSpec::default());
        assert!(!machine.has_node_ref());
    }
}
