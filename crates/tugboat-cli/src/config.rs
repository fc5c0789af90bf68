//! tugboat CLI configuration stored at `~/.tugboat/`.
//!
//! `~/.tugboat/config.yaml` (or the file named by `--config` /
//! `TUGBOAT_CONFIG`) may set:
//!
//! ```yaml
//! providersDir: /srv/tugboat/providers
//! providers:
//!   - name: metal
//!     type: InfrastructureProvider
//! variables:
//!   DOCKER_NETWORK: kind
//! ```
//!
//! Providers listed here are merged over the built-in ones; an entry with the
//! name of a built-in provider replaces it.
//!
//! The kubeconfig resolution chain (highest priority first):
//! 1. Explicit `--kubeconfig` flag
//! 2. `TUGBOAT_KUBECONFIG` environment variable
//! 3. Fall back to kube default (`KUBECONFIG` env / `~/.kube/config`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tugboat_common::crd::ProviderType;
use tugboat_common::CORE_PROVIDER_NAME;
use tugboat_provider::reference::validate_dns_label;

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".tugboat";
const CONFIG_FILE_NAME: &str = "config.yaml";
const PROVIDERS_DIR_NAME: &str = "providers";
const TUGBOAT_CONFIG_ENV: &str = "TUGBOAT_CONFIG";
const TUGBOAT_PROVIDERS_DIR_ENV: &str = "TUGBOAT_PROVIDERS_DIR";
const TUGBOAT_KUBECONFIG_ENV: &str = "TUGBOAT_KUBECONFIG";

/// A provider the repository knows how to install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
}

impl ProviderEntry {
    fn new(name: &str, provider_type: ProviderType) -> Self {
        Self {
            name: name.to_string(),
            provider_type,
        }
    }
}

/// Contents of the config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    providers_dir: Option<PathBuf>,
    #[serde(default)]
    providers: Vec<ProviderEntry>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

/// Effective CLI configuration
#[derive(Debug, Clone)]
pub struct TugboatConfig {
    /// Root of the local provider repository
    pub providers_dir: PathBuf,
    /// Known providers, sorted by name
    pub providers: Vec<ProviderEntry>,
    /// Values for `${VAR}` placeholders in provider manifests
    pub variables: BTreeMap<String, String>,
}

fn default_providers() -> Vec<ProviderEntry> {
    vec![
        ProviderEntry::new(CORE_PROVIDER_NAME, ProviderType::Core),
        ProviderEntry::new("kubeadm", ProviderType::Bootstrap),
        ProviderEntry::new("aws", ProviderType::Infrastructure),
        ProviderEntry::new("docker", ProviderType::Infrastructure),
        ProviderEntry::new("vsphere", ProviderType::Infrastructure),
    ]
}

impl TugboatConfig {
    /// Built-in providers, repository under `providers_dir`
    pub fn with_defaults(providers_dir: PathBuf) -> Self {
        let mut providers = default_providers();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            providers_dir,
            providers,
            variables: BTreeMap::new(),
        }
    }

    /// Load the configuration for a command.
    ///
    /// An explicitly named file must exist; the default one may be missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let default_dir = tugboat_dir()?.join(PROVIDERS_DIR_NAME);
        let providers_dir_env = std::env::var(TUGBOAT_PROVIDERS_DIR_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let (path, required) = match resolve_config_path(explicit) {
            Some(path) => (path, true),
            None => (tugboat_dir()?.join(CONFIG_FILE_NAME), false),
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                debug!(path = %path.display(), "No config file, using defaults");
                String::new()
            }
            Err(e) => {
                return Err(Error::command_failed(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let config = Self::from_yaml(&contents, default_dir).map_err(|e| match e {
            Error::Yaml { source, .. } => Error::Yaml {
                path: path.clone(),
                source,
            },
            other => other,
        })?;
        Ok(match providers_dir_env {
            Some(dir) => config.with_providers_dir(dir),
            None => config,
        })
    }

    /// Parse config file contents; an empty document means defaults
    pub fn from_yaml(contents: &str, default_providers_dir: PathBuf) -> Result<Self> {
        let file: ConfigFile = if contents.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str::<Option<ConfigFile>>(contents)
                .map_err(|source| Error::Yaml {
                    path: PathBuf::from(CONFIG_FILE_NAME),
                    source,
                })?
                .unwrap_or_default()
        };

        let mut providers: BTreeMap<String, ProviderEntry> = default_providers()
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for entry in file.providers {
            let name = entry.name.to_lowercase();
            validate_dns_label(&name).map_err(|e| {
                Error::validation(format!("invalid provider name \"{}\" in config: {}", entry.name, e))
            })?;
            providers.insert(
                name.clone(),
                ProviderEntry {
                    name,
                    provider_type: entry.provider_type,
                },
            );
        }

        Ok(Self {
            providers_dir: file.providers_dir.unwrap_or(default_providers_dir),
            providers: providers.into_values().collect(),
            variables: file.variables,
        })
    }

    /// Override the repository root
    pub fn with_providers_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.providers_dir = dir.into();
        self
    }

    /// Look up a provider by name
    pub fn provider(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Value of a manifest variable; the environment wins over the config file
    pub fn variable(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .or_else(|| self.variables.get(name).cloned())
    }
}

/// Returns `~/.tugboat/`.
pub fn tugboat_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Config file named by the flag or `TUGBOAT_CONFIG`, if any
fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    std::env::var(TUGBOAT_CONFIG_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

/// Resolve a kubeconfig path using the priority chain.
///
/// Returns `None` to let kube infer the configuration.
pub fn resolve_kubeconfig(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    std::env::var(TUGBOAT_KUBECONFIG_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}
