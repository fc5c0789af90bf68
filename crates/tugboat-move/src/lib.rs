//! Pivot of a management cluster for tugboat
//!
//! [`PivotOrchestrator`] hands a management cluster over to another one:
//! providers are installed in the target, the source controllers are scaled
//! down, [`ObjectMover`] relocates the Cluster API objects and the provider
//! components are finally removed from the source.

#![deny(missing_docs)]

pub mod config;
pub mod mover;
pub mod orchestrator;

pub use config::{MoverConfig, MACHINE_READY_TIMEOUT_ENV};
pub use mover::ObjectMover;
pub use orchestrator::PivotOrchestrator;
