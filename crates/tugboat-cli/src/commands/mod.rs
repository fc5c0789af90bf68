//! CLI commands

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use tugboat_common::kube_store::KubeStore;
use tugboat_common::kube_utils::create_client;
use tugboat_common::ObjectStore;

use crate::config::resolve_kubeconfig;
use crate::Result;

pub mod delete;
pub mod init;
pub mod pivot;

/// Connect to the management cluster named by a kubeconfig.
///
/// `explicit` goes through the kubeconfig resolution chain; `None` at the end
/// of it lets kube infer the configuration.
pub async fn connect(explicit: Option<&Path>) -> Result<Arc<dyn ObjectStore>> {
    let kubeconfig = resolve_kubeconfig(explicit);
    debug!(kubeconfig = ?kubeconfig, "Connecting to management cluster");
    let client = create_client(kubeconfig.as_deref()).await?;
    Ok(Arc::new(KubeStore::new(client)))
}
