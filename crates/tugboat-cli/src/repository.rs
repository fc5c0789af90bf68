//! Local provider repository
//!
//! Provider manifests live under the repository root as
//! `<root>/<name>/<version>/components.yaml`. When no version is requested
//! the highest version directory is used, comparing numeric runs as numbers
//! so `v0.10.0` sorts after `v0.9.1`.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use tugboat_provider::{Components, ComponentsOptions};

use crate::config::TugboatConfig;
use crate::{Error, Result};

const COMPONENTS_FILE_NAME: &str = "components.yaml";

/// What to read from the repository
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ComponentsRequest {
    pub name: String,
    /// `None` picks the latest available version
    pub version: Option<String>,
    /// Empty keeps the namespace from the manifest
    pub target_namespace: String,
    /// Empty keeps the watch namespace from the manifest
    pub watching_namespace: String,
}

/// Source of provider components
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComponentsSource: Send + Sync {
    /// Read and prepare the components of a provider
    async fn components(&self, request: &ComponentsRequest) -> Result<Components>;
}

/// Repository on the local filesystem
pub struct FsRepository {
    config: TugboatConfig,
}

impl FsRepository {
    pub fn new(config: TugboatConfig) -> Self {
        Self { config }
    }

    fn root(&self) -> &Path {
        &self.config.providers_dir
    }

    /// Highest version available for a provider
    pub fn latest_version(&self, name: &str) -> Result<String> {
        let dir = self.root().join(name);
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            Error::command_failed(format!(
                "failed to read versions of provider \"{}\" from {}: {}",
                name,
                dir.display(),
                e
            ))
        })?;

        let mut latest: Option<String> = None;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let version = entry.file_name().to_string_lossy().into_owned();
            if latest
                .as_deref()
                .map_or(true, |l| compare_versions(&version, l) == Ordering::Greater)
            {
                latest = Some(version);
            }
        }

        latest.ok_or_else(|| {
            Error::command_failed(format!(
                "no versions of provider \"{}\" found in {}",
                name,
                dir.display()
            ))
        })
    }

    fn components_path(&self, name: &str, version: &str) -> PathBuf {
        self.root().join(name).join(version).join(COMPONENTS_FILE_NAME)
    }
}

#[async_trait]
impl ComponentsSource for FsRepository {
    async fn components(&self, request: &ComponentsRequest) -> Result<Components> {
        let entry = self.config.provider(&request.name).ok_or_else(|| {
            Error::validation(format!(
                "provider \"{}\" is not defined in the configuration",
                request.name
            ))
        })?;

        let version = match &request.version {
            Some(v) => v.clone(),
            None => self.latest_version(&request.name)?,
        };
        let path = self.components_path(&request.name, &version);
        debug!(provider = %request.name, path = %path.display(), "Reading components");
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::command_failed(format!("failed to read {}: {}", path.display(), e))
        })?;

        let yaml = substitute_variables(&raw, |name| self.config.variable(name))?;
        let options = ComponentsOptions::new(&request.name, entry.provider_type, &version)
            .with_target_namespace(&request.target_namespace)
            .with_watching_namespace(&request.watching_namespace);
        let components = Components::from_yaml(&yaml, options)?;

        info!(
            provider = %components.name(),
            version = %components.version(),
            namespace = %components.target_namespace(),
            objects = components.objects().len(),
            "Loaded provider components"
        );
        Ok(components)
    }
}

/// Replace `${NAME}` placeholders (spaces around the name allowed).
///
/// Fails listing every variable `lookup` has no value for.
pub fn substitute_variables(text: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut missing = BTreeSet::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let name = after[..end].trim();
        if is_variable_name(name) {
            match lookup(name) {
                Some(value) => out.push_str(&value),
                None => {
                    missing.insert(name.to_string());
                }
            }
        } else {
            out.push_str(&rest[start..start + 2 + end + 1]);
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    if !missing.is_empty() {
        let names: Vec<String> = missing.into_iter().collect();
        return Err(Error::validation(format!(
            "value for variables [{}] is not set",
            names.join(", ")
        )));
    }
    Ok(out)
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum VersionPart<'a> {
    Text(&'a str),
    Number(u64),
}

/// Split into alternating digit and non-digit runs
fn version_parts(version: &str) -> Vec<VersionPart<'_>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let bytes = version.as_bytes();
    while start < bytes.len() {
        let digit = bytes[start].is_ascii_digit();
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() == digit {
            end += 1;
        }
        let run = &version[start..end];
        parts.push(match run.parse::<u64>() {
            Ok(n) if digit => VersionPart::Number(n),
            _ => VersionPart::Text(run),
        });
        start = end;
    }
    parts
}

/// Order versions comparing numeric runs numerically
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    version_parts(a).cmp(&version_parts(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use tugboat_common::crd::ProviderType;

    const DOCKER_COMPONENTS: &str = r#"
apiVersion: v1
kind: Namespace
metadata:
  name: capd-system
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: capd-controller-manager
  namespace: capd-system
spec:
  selector: {}
  template:
    spec:
      containers:
        - name: manager
          image: ${ IMAGE_REGISTRY }/capd-manager:dev
          args: ["--namespace=${WATCH_NAMESPACE}"]
"#;

    fn repository(root: &Path, variables: &[(&str, &str)]) -> FsRepository {
        let mut config = TugboatConfig::with_defaults(root.to_path_buf());
        config.variables = variables
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        FsRepository::new(config)
    }

    fn write_components(root: &Path, name: &str, version: &str, contents: &str) {
        let dir = root.join(name).join(version);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(COMPONENTS_FILE_NAME), contents).unwrap();
    }

    #[rstest]
    #[case("v0.10.0", "v0.9.1", Ordering::Greater)]
    #[case("v0.2.0", "v0.2.0", Ordering::Equal)]
    #[case("v2", "v10", Ordering::Less)]
    #[case("v1.2.3", "v1.12.0", Ordering::Less)]
    fn versions_compare_numerically(#[case] a: &str, #[case] b: &str, #[case] expected: Ordering) {
        assert_eq!(compare_versions(a, b), expected);
    }

    #[test]
    fn substitution_fills_every_placeholder() {
        let out = substitute_variables("a: ${A}\nb: ${ B }-${A}\n", |name| match name {
            "A" => Some("1".to_string()),
            "B" => Some("2".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(out, "a: 1\nb: 2-1\n");
    }

    #[test]
    fn substitution_lists_all_missing_variables() {
        let err = substitute_variables("${ZED} ${ALPHA} ${ZED}", |_| None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: value for variables [ALPHA, ZED] is not set"
        );
    }

    #[test]
    fn substitution_leaves_non_variables_alone() {
        let text = "cmd: echo ${} ${1abc} ${unterminated";
        assert_eq!(substitute_variables(text, |_| None).unwrap(), text);
    }

    #[test]
    fn latest_version_ignores_files() {
        let root = tempfile::tempdir().unwrap();
        write_components(root.path(), "docker", "v0.9.1", "");
        write_components(root.path(), "docker", "v0.10.0", "");
        std::fs::write(root.path().join("docker").join("v9.9.9"), "not a dir").unwrap();

        let repo = repository(root.path(), &[]);
        assert_eq!(repo.latest_version("docker").unwrap(), "v0.10.0");
    }

    // ==========================================================================
    // Story Tests: Loading provider components
    // ==========================================================================

    /// Story: Components are read for the latest version, variables are
    /// substituted and the bundle is prepared for the requested namespaces
    #[tokio::test]
    async fn story_load_latest_components() {
        let root = tempfile::tempdir().unwrap();
        write_components(root.path(), "docker", "v0.2.0", DOCKER_COMPONENTS);
        write_components(root.path(), "docker", "v0.3.0", DOCKER_COMPONENTS);
        let repo = repository(
            root.path(),
            &[("IMAGE_REGISTRY", "registry.local"), ("WATCH_NAMESPACE", "")],
        );

        let components = repo
            .components(&ComponentsRequest {
                name: "docker".to_string(),
                target_namespace: "infra".to_string(),
                watching_namespace: "team-a".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(components.version(), "v0.3.0");
        assert_eq!(components.provider_type(), ProviderType::Infrastructure);
        assert_eq!(components.target_namespace(), "infra");
        assert_eq!(components.watching_namespace(), "team-a");
    }

    /// Story: A manifest referencing unset variables is refused
    #[tokio::test]
    async fn story_missing_variables_fail_the_load() {
        let root = tempfile::tempdir().unwrap();
        write_components(root.path(), "docker", "v0.2.0", DOCKER_COMPONENTS);
        let repo = repository(root.path(), &[("WATCH_NAMESPACE", "")]);

        let err = repo
            .components(&ComponentsRequest {
                name: "docker".to_string(),
                version: Some("v0.2.0".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("[IMAGE_REGISTRY]"), "{}", err);
    }

    /// Story: Only configured providers can be loaded
    #[tokio::test]
    async fn story_unknown_provider_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let repo = repository(root.path(), &[]);

        let err = repo
            .components(&ComponentsRequest {
                name: "metal".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}
