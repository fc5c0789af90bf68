//! Custom resource types tugboat reads and writes
//!
//! `Provider` is tugboat's own registry record. The Cluster API kinds are
//! modelled only as far as the mover needs to walk the object graph; every
//! other field is carried through untouched.

mod capi;
mod provider;

pub use capi::{
    Bootstrap, Cluster, ClusterSpec, ClusterStatus, Machine, MachineDeployment,
    MachineDeploymentSpec, MachineSet, MachineSetSpec, MachineSpec, MachineStatus,
    MachineTemplateSpec, CAPI_GROUP, CAPI_VERSION,
};
pub use provider::{Provider, ProviderSpec, ProviderType, PROVIDER_CRD_NAME};
