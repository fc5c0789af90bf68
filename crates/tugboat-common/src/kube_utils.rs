//! Kubernetes client helpers and bounded polling

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll until a condition is met or the timeout expires.
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors from the check are treated as "not yet": they are logged and the
/// poll continues. The first check runs immediately.
///
/// # Example
/// ```ignore
/// poll_until(
///     Duration::from_secs(600),
///     Duration::from_secs(10),
///     "deployment capd-controller-manager scaled to zero",
///     || async { Ok(is_scaled_down(&store, &key).await?) },
/// )
/// .await?;
/// ```
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = std::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!("Polling condition not yet met, retrying...");
            }
            Err(e) => {
                trace!("Polling check returned error (retrying): {}", e);
            }
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout(
                timeout_msg,
                format!("still not satisfied after {}s", timeout.as_secs()),
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::configuration(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::configuration(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::configuration(format!("failed to infer config: {}", e)))?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config)
        .map_err(|e| Error::store("create_client", format!("failed to create client: {}", e)))
}

/// Split an `apiVersion` into group and version.
///
/// ```
/// use tugboat_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource without discovery, guessing the plural.
///
/// Only used when discovery does not know the kind yet.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Kinds whose plural is not derivable by the simple rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("podsecuritypolicy", "podsecuritypolicies"),
    ("priorityclass", "priorityclasses"),
    ("runtimeclass", "runtimeclasses"),
    ("storageclass", "storageclasses"),
    ("ingressclass", "ingressclasses"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn pluralize_known_and_regular_kinds() {
        assert_eq!(pluralize_kind("MachineDeployment"), "machinedeployments");
        assert_eq!(pluralize_kind("ClusterClass"), "clusterclasses");
        assert_eq!(pluralize_kind("KubeadmConfigTemplate"), "kubeadmconfigtemplates");
        assert_eq!(pluralize_kind("StorageClass"), "storageclasses");
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Endpoints"), "endpoints");
    }

    #[test]
    fn build_api_resource_for_core_and_grouped_kinds() {
        let ar = build_api_resource("v1", "ConfigMap");
        assert_eq!(ar.group, "");
        assert_eq!(ar.plural, "configmaps");

        let ar = build_api_resource("infrastructure.cluster.x-k8s.io/v1alpha2", "DockerMachine");
        assert_eq!(ar.group, "infrastructure.cluster.x-k8s.io");
        assert_eq!(ar.version, "v1alpha2");
        assert_eq!(ar.plural, "dockermachines");
    }

    #[tokio::test]
    async fn poll_until_returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        poll_until(
            Duration::from_secs(5),
            Duration::from_millis(1),
            "counter reaches three",
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_times_out_with_timeout_error() {
        let err = poll_until(
            Duration::from_millis(20),
            Duration::from_millis(5),
            "never",
            || async { Err(Error::validation("not yet")) },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert!(err.to_string().contains("never"));
    }
}
