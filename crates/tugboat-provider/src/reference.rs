//! Provider references as typed on the command line

use std::fmt;
use std::str::FromStr;

use tugboat_common::{Error, Result};

/// Longest DNS-1123 label
const MAX_LABEL_LEN: usize = 63;

/// `[namespace/]name[:version]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRef {
    /// Namespace the provider is (to be) installed in
    pub namespace: Option<String>,
    /// Provider name
    pub name: String,
    /// Requested version
    pub version: Option<String>,
}

impl ProviderRef {
    /// Parse a reference, lower-casing it
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim().to_lowercase();

        let (namespace, rest) = match input.split_once('/') {
            Some((ns, rest)) => (Some(ns.to_string()), rest),
            None => (None, input.as_str()),
        };
        let (name, version) = match rest.split_once(':') {
            Some((name, version)) => (name.to_string(), Some(version.to_string())),
            None => (rest.to_string(), None),
        };

        if let Some(ns) = &namespace {
            validate_dns_label(ns)
                .map_err(|e| Error::configuration(format!("invalid provider namespace in \"{}\": {}", input, e)))?;
        }
        validate_dns_label(&name)
            .map_err(|e| Error::configuration(format!("invalid provider name in \"{}\": {}", input, e)))?;
        if version.as_deref().is_some_and(str::is_empty) {
            return Err(Error::configuration(format!(
                "invalid provider reference \"{}\": version cannot be empty",
                input
            )));
        }

        Ok(Self {
            namespace,
            name,
            version,
        })
    }
}

impl FromStr for ProviderRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = &self.namespace {
            write!(f, "{}/", ns)?;
        }
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            write!(f, ":{}", version)?;
        }
        Ok(())
    }
}

/// Validate a DNS-1123 label.
///
/// Rules:
/// - 1 to 63 characters
/// - lowercase alphanumeric or hyphen
/// - starts and ends with an alphanumeric character
pub fn validate_dns_label(s: &str) -> std::result::Result<(), String> {
    if s.is_empty() {
        return Err("cannot be empty".to_string());
    }
    if s.len() > MAX_LABEL_LEN {
        return Err(format!("must be no more than {} characters: {}", MAX_LABEL_LEN, s));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!("must be lowercase alphanumeric with hyphens: {}", s));
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(format!("must start and end with an alphanumeric character: {}", s));
    }
    Ok(())
}
