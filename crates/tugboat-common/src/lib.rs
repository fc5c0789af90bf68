//! Common types for tugboat: object model, store abstraction, errors and utilities
//!
//! Everything above this crate talks to a management cluster through the
//! [`store::ObjectStore`] trait and the closed [`object::Resource`] enum:
//!
//! ```text
//!   provider installer / teardown / mover
//!                  │
//!                  ▼
//!        ObjectStore (get/list/create/update/delete)
//!          │                         │
//!     KubeStore (kube-rs)      MemoryStore (in-process)
//! ```
//!
//! `MemoryStore` is only built for tests, or with the `test-utils` feature.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_store;
pub mod kube_utils;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod object;
pub mod selector;
pub mod store;

pub use error::{Error, ErrorContext};
pub use object::{Gvk, ObjectKey, Resource};
pub use selector::LabelSelector;
pub use store::{ListQuery, ObjectStore, Propagation};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label present (with an empty value) on every object installed as part of a provider
pub const CLUSTERCTL_LABEL: &str = "clusterctl.cluster.x-k8s.io";

/// Label carrying the name of the provider an object belongs to
pub const CLUSTERCTL_PROVIDER_LABEL: &str = "clusterctl.cluster.x-k8s.io/provider";

/// Label linking machine resources to the Cluster they belong to
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Name of the default core provider
pub const CORE_PROVIDER_NAME: &str = "cluster-api";
