//! Init command - Install providers into a management cluster
//!
//! Usage: tugboat init [--core <ref>] [-b <ref>]... [-i <ref>]...
//!
//! A provider reference is `[namespace/]name[:version]`. On a cluster with no
//! provider registry yet the core provider defaults to `cluster-api`.
//! Every requested provider is validated against the installed ones before
//! anything is installed.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use tugboat_common::crd::ProviderType;
use tugboat_common::{ObjectStore, CORE_PROVIDER_NAME};
use tugboat_provider::{ensure_type, Components, MetadataRegistry, ProviderInstaller, ProviderRef};

use super::connect;
use crate::config::TugboatConfig;
use crate::repository::{ComponentsRequest, ComponentsSource, FsRepository};
use crate::Result;

/// Install providers into a management cluster
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Core provider to install (defaults to cluster-api on a new cluster)
    #[arg(long)]
    pub core: Option<String>,

    /// Bootstrap providers to install
    #[arg(short = 'b', long = "bootstrap")]
    pub bootstrap: Vec<String>,

    /// Infrastructure providers to install
    #[arg(short = 'i', long = "infrastructure")]
    pub infrastructure: Vec<String>,

    /// Namespace to install providers into, unless the reference names one
    #[arg(long)]
    pub target_namespace: Option<String>,

    /// Namespace the providers' controllers watch (all namespaces when unset)
    #[arg(long)]
    pub watching_namespace: Option<String>,

    /// Install even if validation against the installed providers fails
    #[arg(long)]
    pub force: bool,

    /// Path to kubeconfig for the management cluster
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Path to the tugboat config file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Providers to install, by role
#[derive(Debug, Clone, Default)]
pub struct InitRequest {
    pub core: Option<String>,
    pub bootstrap: Vec<String>,
    pub infrastructure: Vec<String>,
    pub target_namespace: String,
    pub watching_namespace: String,
    pub force: bool,
}

impl From<&InitArgs> for InitRequest {
    fn from(args: &InitArgs) -> Self {
        Self {
            core: args.core.clone(),
            bootstrap: args.bootstrap.clone(),
            infrastructure: args.infrastructure.clone(),
            target_namespace: args.target_namespace.clone().unwrap_or_default(),
            watching_namespace: args.watching_namespace.clone().unwrap_or_default(),
            force: args.force,
        }
    }
}

pub async fn run(args: InitArgs) -> Result<()> {
    let config = TugboatConfig::load(args.config.as_deref())?;
    let repository = FsRepository::new(config);
    let store = connect(args.kubeconfig.as_deref()).await?;

    let installed = init(store, &repository, &InitRequest::from(&args)).await?;
    if installed.is_empty() {
        println!("No providers to install.");
        return Ok(());
    }
    println!("Installed providers:");
    for components in &installed {
        println!(
            "  {:<24} {:<24} {:<12} {}",
            components.name(),
            components.provider_type(),
            components.version(),
            components.target_namespace()
        );
    }
    Ok(())
}

/// Install the requested providers, returning what was installed
pub async fn init(
    store: Arc<dyn ObjectStore>,
    source: &dyn ComponentsSource,
    request: &InitRequest,
) -> Result<Vec<Components>> {
    let registry = MetadataRegistry::new(store);
    let initialized = registry.ensure_metadata().await?;

    let core = match (&request.core, initialized) {
        (Some(core), _) => Some(core.clone()),
        (None, false) => {
            info!(provider = CORE_PROVIDER_NAME, "New management cluster, defaulting core provider");
            Some(CORE_PROVIDER_NAME.to_string())
        }
        (None, true) => None,
    };

    let requested = core
        .iter()
        .map(|r| (r.as_str(), ProviderType::Core))
        .chain(request.bootstrap.iter().map(|r| (r.as_str(), ProviderType::Bootstrap)))
        .chain(
            request
                .infrastructure
                .iter()
                .map(|r| (r.as_str(), ProviderType::Infrastructure)),
        );

    let mut installer = ProviderInstaller::with_registry(registry);
    for (reference, provider_type) in requested {
        let provider = ProviderRef::parse(reference)?;
        let components = source
            .components(&ComponentsRequest {
                name: provider.name.clone(),
                version: provider.version.clone(),
                target_namespace: provider
                    .namespace
                    .clone()
                    .unwrap_or_else(|| request.target_namespace.clone()),
                watching_namespace: request.watching_namespace.clone(),
            })
            .await?;
        ensure_type(&components, provider_type)?;
        installer.add(components, request.force).await?;
    }

    Ok(installer.install().await?)
}
