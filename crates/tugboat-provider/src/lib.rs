//! Provider lifecycle in a management cluster
//!
//! - [`metadata`]: the registry of installed providers and its consistency rules
//! - [`components`]: a provider's manifest objects laid out for one installation
//! - [`reconciler`]: create-or-update of manifest objects in priority order
//! - [`installer`]: validate a batch of providers, then install them
//! - [`teardown`]: scale a provider's controllers down and delete its objects
//! - [`reference`]: `[namespace/]name[:version]` provider references

pub mod components;
pub mod installer;
pub mod metadata;
pub mod reconciler;
pub mod reference;
pub mod teardown;

pub use components::{Components, ComponentsOptions};
pub use installer::{ensure_type, ProviderInstaller};
pub use metadata::{MetadataRegistry, ProviderFilter};
pub use reconciler::{create_priority, sort_for_create, ComponentsReconciler};
pub use reference::ProviderRef;
pub use teardown::{ComponentsTeardown, TeardownConfig};
