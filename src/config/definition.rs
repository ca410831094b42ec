//! Cluster definition: the immutable input to a provisioning run
//!
//! A definition is loaded once from YAML or JSON and never mutated afterwards.
//! Provider-specific configuration is a tagged enum keyed by `type`, so each
//! provider carries exactly the credentials it needs.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::DefinitionError;

/// Maximum length of a cluster name (DNS label limit)
pub const MAX_CLUSTER_NAME_LEN: usize = 63;

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// Supported git hosting providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProvider {
    Github,
    Gitlab,
}

impl GitProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitProvider::Github => "github",
            GitProvider::Gitlab => "gitlab",
        }
    }

    /// SSH host used for the gitops remote
    pub fn ssh_host(&self) -> &'static str {
        match self {
            GitProvider::Github => "github.com",
            GitProvider::Gitlab => "gitlab.com",
        }
    }
}

impl fmt::Display for GitProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Vultr: a single API key covers DNS, compute and object storage
    Vultr { api_key: String },
    /// DigitalOcean: API token plus Spaces keys for the state store bucket
    Digitalocean {
        token: String,
        spaces_key: String,
        spaces_secret: String,
    },
}

impl ProviderConfig {
    /// Short provider identity as recorded on the cluster record
    pub fn name(&self) -> &'static str {
        match self {
            ProviderConfig::Vultr { .. } => "vultr",
            ProviderConfig::Digitalocean { .. } => "digitalocean",
        }
    }

    fn expand_env(&mut self) -> Result<(), DefinitionError> {
        match self {
            ProviderConfig::Vultr { api_key } => {
                *api_key = expand(api_key)?;
            }
            ProviderConfig::Digitalocean {
                token,
                spaces_key,
                spaces_secret,
            } => {
                *token = expand(token)?;
                *spaces_key = expand(spaces_key)?;
                *spaces_secret = expand(spaces_secret)?;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        let missing = match self {
            ProviderConfig::Vultr { api_key } => api_key.is_empty().then_some("api_key"),
            ProviderConfig::Digitalocean {
                token,
                spaces_key,
                spaces_secret,
            } => {
                if token.is_empty() {
                    Some("token")
                } else if spaces_key.is_empty() {
                    Some("spaces_key")
                } else if spaces_secret.is_empty() {
                    Some("spaces_secret")
                } else {
                    None
                }
            }
        };

        match missing {
            Some(field) => Err(DefinitionError::Invalid(format!(
                "provider {} requires a non-empty {}",
                self.name(),
                field
            ))),
            None => Ok(()),
        }
    }
}

/// Everything a caller supplies to provision one cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDefinition {
    pub cluster_name: String,
    pub domain_name: String,
    pub admin_email: String,
    pub git_provider: GitProvider,
    pub git_owner: String,
    /// Token for the git provider; supports `${VAR}` expansion
    pub git_token: String,
    pub region: String,
    pub node_type: String,
    #[serde(default = "default_node_count")]
    pub node_count: u32,
    /// Telemetry opt-in
    #[serde(default = "default_telemetry")]
    pub telemetry: bool,
    pub provider: ProviderConfig,
}

fn default_node_count() -> u32 {
    3
}

fn default_telemetry() -> bool {
    true
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

fn expand(value: &str) -> Result<String, DefinitionError> {
    shellexpand::env(value)
        .map(|v| v.into_owned())
        .map_err(|e| DefinitionError::EnvExpansion(e.to_string()))
}

/// Check a cluster name is a valid DNS label
pub fn is_valid_cluster_name(name: &str) -> bool {
    let pattern = Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap();
    !name.is_empty() && name.len() <= MAX_CLUSTER_NAME_LEN && pattern.is_match(name)
}

/// Check a domain looks like a registrable name (at least one dot, no scheme)
pub fn is_valid_domain(domain: &str) -> bool {
    let pattern =
        Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?\.)+[a-z]([-a-z0-9]*[a-z0-9])?$").unwrap();
    pattern.is_match(domain)
}

impl ClusterDefinition {
    /// Parse a definition from YAML (JSON is valid YAML), expand environment
    /// references and validate it
    pub fn from_str(content: &str) -> Result<Self, DefinitionError> {
        let mut definition: ClusterDefinition =
            serde_yaml::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        definition.expand_env()?;
        definition.validate()?;
        Ok(definition)
    }

    fn expand_env(&mut self) -> Result<(), DefinitionError> {
        self.git_token = expand(&self.git_token)?;
        self.provider.expand_env()
    }

    /// Validate field shapes
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !is_valid_cluster_name(&self.cluster_name) {
            return Err(DefinitionError::Invalid(format!(
                "cluster name '{}' must be a lowercase DNS label",
                self.cluster_name
            )));
        }
        if !is_valid_domain(&self.domain_name) {
            return Err(DefinitionError::Invalid(format!(
                "domain '{}' is not a valid domain name",
                self.domain_name
            )));
        }
        if self.git_owner.is_empty() {
            return Err(DefinitionError::Invalid("git_owner is required".to_string()));
        }
        if self.node_count == 0 {
            return Err(DefinitionError::Invalid(
                "node_count must be at least 1".to_string(),
            ));
        }
        self.provider.validate()
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Name of the object storage bucket holding terraform state
    pub fn state_store_bucket(&self) -> String {
        format!("{}-state-store", self.cluster_name)
    }
}
