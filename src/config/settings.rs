//! Operator settings and per-cluster workspace layout
//!
//! Settings live in `~/.clusterforge/config` (YAML). Every field has a
//! default, so a missing file is equivalent to an empty one.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Attempts made by the domain liveness probe before giving up
pub const DEFAULT_LIVENESS_ATTEMPTS: u32 = 100;

/// Seconds between liveness resolution attempts
pub const DEFAULT_LIVENESS_INTERVAL_SECS: u64 = 10;

/// Seconds to wait after cluster creation before touching the control plane
pub const DEFAULT_SETTLE_DELAY_SECS: u64 = 30;

/// Lease time-to-live; renewed at every stage boundary
pub const DEFAULT_LEASE_TTL_SECS: u64 = 2 * 60 * 60;

/// Nameserver used when the system resolver cannot answer
pub const DEFAULT_BACKUP_RESOLVER: &str = "8.8.8.8";

/// Default telemetry collection endpoint
pub const DEFAULT_TELEMETRY_ENDPOINT: &str = "https://api.segment.io/v1/track";

/// Default settings directory: ~/.clusterforge
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clusterforge")
}

/// Default settings file location: ~/.clusterforge/config
pub fn default_settings_path() -> PathBuf {
    default_home_dir().join("config")
}

/// Operator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root for per-cluster workspaces
    pub home_dir: PathBuf,

    /// Directory for the file-backed record store
    pub store_dir: PathBuf,

    /// Fallback nameserver for TXT lookups
    pub backup_resolver: IpAddr,

    pub liveness_attempts: u32,
    pub liveness_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub lease_ttl_secs: u64,

    pub telemetry_endpoint: String,

    /// Write key for the telemetry endpoint; telemetry is disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_write_key: Option<String>,

    /// Directory holding the gitops repository template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gitops_template_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        let home_dir = default_home_dir();
        Self {
            store_dir: home_dir.join("clusters"),
            home_dir,
            backup_resolver: DEFAULT_BACKUP_RESOLVER
                .parse()
                .unwrap_or(IpAddr::from([8, 8, 8, 8])),
            liveness_attempts: DEFAULT_LIVENESS_ATTEMPTS,
            liveness_interval_secs: DEFAULT_LIVENESS_INTERVAL_SECS,
            settle_delay_secs: DEFAULT_SETTLE_DELAY_SECS,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
            telemetry_endpoint: DEFAULT_TELEMETRY_ENDPOINT.to_string(),
            telemetry_write_key: None,
            gitops_template_dir: None,
        }
    }
}

impl Settings {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Workspace layout for one cluster
    pub fn workspace(&self, cluster_name: &str) -> Workspace {
        Workspace::new(self.home_dir.join(cluster_name))
    }
}

/// Filesystem layout of one cluster's local working state
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Downloaded CLI tools (kubectl, argocd)
    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    /// Local clone of the gitops repository
    pub fn gitops_dir(&self) -> PathBuf {
        self.root.join("gitops")
    }

    /// Terraform module directory for a given stack inside the gitops repo
    pub fn terraform_dir(&self, stack: &str) -> PathBuf {
        self.gitops_dir().join("terraform").join(stack)
    }

    /// Backed-up TLS material from a previous installation
    pub fn ssl_backup_dir(&self) -> PathBuf {
        self.root.join("ssl")
    }

    /// Bot SSH key material
    pub fn ssh_dir(&self) -> PathBuf {
        self.root.join("ssh")
    }

    /// Kubeconfig written by the cluster terraform stack
    pub fn kubeconfig(&self) -> PathBuf {
        self.root.join("kubeconfig")
    }
}

// ============================================================================
// SBIO: Pure parsing, thin I/O wrapper
// ============================================================================

/// Parse settings from a YAML string
pub fn parse_settings(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::Settings(e.to_string()))
}

/// Load settings from disk, falling back to defaults when the file is absent
pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}
