//! Pivot command - Move a management cluster to another cluster
//!
//! Usage: tugboat pivot --to <kubeconfig> [--kubeconfig <kubeconfig>]
//!
//! Installs the source providers in the target, moves every Cluster API
//! object, then removes the providers from the source.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use tugboat_common::ObjectStore;
use tugboat_move::PivotOrchestrator;
use tugboat_provider::MetadataRegistry;

use super::connect;
use crate::Result;

/// Move providers and Cluster API objects to another management cluster
#[derive(Args, Debug)]
pub struct PivotArgs {
    /// Path to kubeconfig for the target management cluster
    #[arg(long)]
    pub to: PathBuf,

    /// Path to kubeconfig for the source management cluster
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,
}

pub async fn run(args: PivotArgs) -> Result<()> {
    let source = connect(args.kubeconfig.as_deref()).await?;
    let target = connect(Some(args.to.as_path())).await?;
    pivot(source, target).await?;
    println!("Pivot complete.");
    Ok(())
}

/// Make sure both clusters carry a provider registry, then pivot
pub async fn pivot(source: Arc<dyn ObjectStore>, target: Arc<dyn ObjectStore>) -> Result<()> {
    for (side, store) in [("source", &source), ("target", &target)] {
        let existed = MetadataRegistry::new(store.clone()).ensure_metadata().await?;
        info!(cluster = side, existed, "Provider registry ready");
    }

    PivotOrchestrator::new(source, target).pivot().await?;
    Ok(())
}
