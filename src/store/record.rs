//! The cluster record: durable checkpoint of one provisioning run

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::StoreError;
use crate::config::ClusterDefinition;
use crate::objectstore::StateStoreDetails;

/// Length of a record id (uuid v4, simple hex form)
pub const RECORD_ID_LEN: usize = 32;

/// Coarse provisioning status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    /// Record created, nothing attempted yet
    #[default]
    #[serde(rename = "")]
    Initial,
    Provisioning,
    Provisioned,
    Error,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterStatus::Initial => "",
            ClusterStatus::Provisioning => "provisioning",
            ClusterStatus::Provisioned => "provisioned",
            ClusterStatus::Error => "error",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(ClusterStatus::Initial),
            "provisioning" => Ok(ClusterStatus::Provisioning),
            "provisioned" => Ok(ClusterStatus::Provisioned),
            "error" => Ok(ClusterStatus::Error),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Exclusive claim on a cluster record by one provisioning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Fields that may be written through `update_field`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    Status,
    InProgress,
    InstallToolsCheck,
    DomainLivenessCheck,
    StateStoreCredsCheck,
    GitInitCheck,
    KbotSetupCheck,
    GitopsReadyCheck,
    GitTerraformApplyCheck,
    GitopsPushedCheck,
    CloudTerraformApplyCheck,
    ClusterSecretsCreatedCheck,
    ArgocdInstallCheck,
    ArgocdInitializeCheck,
    ArgocdCreateRegistryCheck,
    VaultInitializedCheck,
    VaultTerraformApplyCheck,
    UsersTerraformApplyCheck,
    StateStoreDetails,
}

impl RecordField {
    pub const ALL: &'static [RecordField] = &[
        RecordField::Status,
        RecordField::InProgress,
        RecordField::InstallToolsCheck,
        RecordField::DomainLivenessCheck,
        RecordField::StateStoreCredsCheck,
        RecordField::GitInitCheck,
        RecordField::KbotSetupCheck,
        RecordField::GitopsReadyCheck,
        RecordField::GitTerraformApplyCheck,
        RecordField::GitopsPushedCheck,
        RecordField::CloudTerraformApplyCheck,
        RecordField::ClusterSecretsCreatedCheck,
        RecordField::ArgocdInstallCheck,
        RecordField::ArgocdInitializeCheck,
        RecordField::ArgocdCreateRegistryCheck,
        RecordField::VaultInitializedCheck,
        RecordField::VaultTerraformApplyCheck,
        RecordField::UsersTerraformApplyCheck,
        RecordField::StateStoreDetails,
    ];

    /// Document key of the field
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordField::Status => "status",
            RecordField::InProgress => "in_progress",
            RecordField::InstallToolsCheck => "install_tools_check",
            RecordField::DomainLivenessCheck => "domain_liveness_check",
            RecordField::StateStoreCredsCheck => "state_store_creds_check",
            RecordField::GitInitCheck => "git_init_check",
            RecordField::KbotSetupCheck => "kbot_setup_check",
            RecordField::GitopsReadyCheck => "gitops_ready_check",
            RecordField::GitTerraformApplyCheck => "git_terraform_apply_check",
            RecordField::GitopsPushedCheck => "gitops_pushed_check",
            RecordField::CloudTerraformApplyCheck => "cloud_terraform_apply_check",
            RecordField::ClusterSecretsCreatedCheck => "cluster_secrets_created_check",
            RecordField::ArgocdInstallCheck => "argocd_install_check",
            RecordField::ArgocdInitializeCheck => "argocd_initialize_check",
            RecordField::ArgocdCreateRegistryCheck => "argocd_create_registry_check",
            RecordField::VaultInitializedCheck => "vault_initialized_check",
            RecordField::VaultTerraformApplyCheck => "vault_terraform_apply_check",
            RecordField::UsersTerraformApplyCheck => "users_terraform_apply_check",
            RecordField::StateStoreDetails => "state_store_details",
        }
    }

    /// True for the boolean stage-completion markers
    pub fn is_marker(&self) -> bool {
        !matches!(
            self,
            RecordField::Status | RecordField::InProgress | RecordField::StateStoreDetails
        )
    }
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordField::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| StoreError::InvalidField(s.to_string()))
    }
}

/// Durable, mutable checkpoint of one provisioning run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: String,
    pub cluster_name: String,
    pub domain_name: String,
    pub cloud_provider: String,
    pub cloud_region: String,
    pub git_provider: String,
    pub git_owner: String,

    #[serde(default)]
    pub status: ClusterStatus,
    #[serde(default)]
    pub in_progress: bool,
    #[serde(default)]
    pub use_telemetry: bool,

    #[serde(default)]
    pub install_tools_check: bool,
    #[serde(default)]
    pub domain_liveness_check: bool,
    #[serde(default)]
    pub state_store_creds_check: bool,
    #[serde(default)]
    pub git_init_check: bool,
    #[serde(default)]
    pub kbot_setup_check: bool,
    #[serde(default)]
    pub gitops_ready_check: bool,
    #[serde(default)]
    pub git_terraform_apply_check: bool,
    #[serde(default)]
    pub gitops_pushed_check: bool,
    #[serde(default)]
    pub cloud_terraform_apply_check: bool,
    #[serde(default)]
    pub cluster_secrets_created_check: bool,
    #[serde(default)]
    pub argocd_install_check: bool,
    #[serde(default)]
    pub argocd_initialize_check: bool,
    #[serde(default)]
    pub argocd_create_registry_check: bool,
    #[serde(default)]
    pub vault_initialized_check: bool,
    #[serde(default)]
    pub vault_terraform_apply_check: bool,
    #[serde(default)]
    pub users_terraform_apply_check: bool,

    /// Non-secret location of the terraform state bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_store_details: Option<StateStoreDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,

    pub creation_timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Check an id has the shape of a record id (hex, fixed length)
pub fn is_valid_record_id(id: &str) -> bool {
    id.len() == RECORD_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit())
}

impl ClusterRecord {
    /// Fresh record with every marker cleared
    pub fn new(definition: &ClusterDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            cluster_name: definition.cluster_name.clone(),
            domain_name: definition.domain_name.clone(),
            cloud_provider: definition.provider_name().to_string(),
            cloud_region: definition.region.clone(),
            git_provider: definition.git_provider.as_str().to_string(),
            git_owner: definition.git_owner.clone(),
            status: ClusterStatus::Initial,
            in_progress: false,
            use_telemetry: definition.telemetry,
            install_tools_check: false,
            domain_liveness_check: false,
            state_store_creds_check: false,
            git_init_check: false,
            kbot_setup_check: false,
            gitops_ready_check: false,
            git_terraform_apply_check: false,
            gitops_pushed_check: false,
            cloud_terraform_apply_check: false,
            cluster_secrets_created_check: false,
            argocd_install_check: false,
            argocd_initialize_check: false,
            argocd_create_registry_check: false,
            vault_initialized_check: false,
            vault_terraform_apply_check: false,
            users_terraform_apply_check: false,
            state_store_details: None,
            lease: None,
            creation_timestamp: now,
            updated_at: now,
        }
    }

    fn flag_mut(&mut self, field: RecordField) -> Option<&mut bool> {
        let flag = match field {
            RecordField::InProgress => &mut self.in_progress,
            RecordField::InstallToolsCheck => &mut self.install_tools_check,
            RecordField::DomainLivenessCheck => &mut self.domain_liveness_check,
            RecordField::StateStoreCredsCheck => &mut self.state_store_creds_check,
            RecordField::GitInitCheck => &mut self.git_init_check,
            RecordField::KbotSetupCheck => &mut self.kbot_setup_check,
            RecordField::GitopsReadyCheck => &mut self.gitops_ready_check,
            RecordField::GitTerraformApplyCheck => &mut self.git_terraform_apply_check,
            RecordField::GitopsPushedCheck => &mut self.gitops_pushed_check,
            RecordField::CloudTerraformApplyCheck => &mut self.cloud_terraform_apply_check,
            RecordField::ClusterSecretsCreatedCheck => &mut self.cluster_secrets_created_check,
            RecordField::ArgocdInstallCheck => &mut self.argocd_install_check,
            RecordField::ArgocdInitializeCheck => &mut self.argocd_initialize_check,
            RecordField::ArgocdCreateRegistryCheck => &mut self.argocd_create_registry_check,
            RecordField::VaultInitializedCheck => &mut self.vault_initialized_check,
            RecordField::VaultTerraformApplyCheck => &mut self.vault_terraform_apply_check,
            RecordField::UsersTerraformApplyCheck => &mut self.users_terraform_apply_check,
            RecordField::Status | RecordField::StateStoreDetails => return None,
        };
        Some(flag)
    }

    /// Current value of a boolean field (markers and `in_progress`)
    pub fn flag(&self, field: RecordField) -> Option<bool> {
        let flag = match field {
            RecordField::InProgress => self.in_progress,
            RecordField::InstallToolsCheck => self.install_tools_check,
            RecordField::DomainLivenessCheck => self.domain_liveness_check,
            RecordField::StateStoreCredsCheck => self.state_store_creds_check,
            RecordField::GitInitCheck => self.git_init_check,
            RecordField::KbotSetupCheck => self.kbot_setup_check,
            RecordField::GitopsReadyCheck => self.gitops_ready_check,
            RecordField::GitTerraformApplyCheck => self.git_terraform_apply_check,
            RecordField::GitopsPushedCheck => self.gitops_pushed_check,
            RecordField::CloudTerraformApplyCheck => self.cloud_terraform_apply_check,
            RecordField::ClusterSecretsCreatedCheck => self.cluster_secrets_created_check,
            RecordField::ArgocdInstallCheck => self.argocd_install_check,
            RecordField::ArgocdInitializeCheck => self.argocd_initialize_check,
            RecordField::ArgocdCreateRegistryCheck => self.argocd_create_registry_check,
            RecordField::VaultInitializedCheck => self.vault_initialized_check,
            RecordField::VaultTerraformApplyCheck => self.vault_terraform_apply_check,
            RecordField::UsersTerraformApplyCheck => self.users_terraform_apply_check,
            RecordField::Status | RecordField::StateStoreDetails => return None,
        };
        Some(flag)
    }

    /// True when every stage marker is still false
    pub fn has_no_markers(&self) -> bool {
        RecordField::ALL
            .iter()
            .filter(|f| f.is_marker())
            .all(|f| self.flag(*f) == Some(false))
    }

    /// Apply a single named field update, type-checking the value
    pub fn apply_field(&mut self, field: &str, value: Value) -> Result<(), StoreError> {
        let key: RecordField = field.parse()?;
        let type_error = |expected: &str| {
            StoreError::InvalidField(format!("{} expects {}", key.as_str(), expected))
        };

        match key {
            RecordField::Status => {
                let status = value
                    .as_str()
                    .ok_or_else(|| type_error("a string"))?
                    .parse::<ClusterStatus>()
                    .map_err(|e| StoreError::InvalidField(format!("status: {}", e)))?;
                self.status = status;
            }
            RecordField::StateStoreDetails => {
                let details = if value.is_null() {
                    None
                } else {
                    Some(
                        serde_json::from_value::<StateStoreDetails>(value)
                            .map_err(|_| type_error("an object with id, name, hostname"))?,
                    )
                };
                self.state_store_details = details;
            }
            flag_field => {
                let b = value.as_bool().ok_or_else(|| type_error("a boolean"))?;
                if let Some(flag) = self.flag_mut(flag_field) {
                    *flag = b;
                }
            }
        }

        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterDefinition;
    use serde_json::json;

    fn test_definition() -> ClusterDefinition {
        ClusterDefinition::from_str(
            r#"
cluster_name: mgmt
domain_name: example.com
admin_email: ops@example.com
git_provider: github
git_owner: acme
git_token: token
region: ewr
node_type: vc2-4c-8gb
provider:
  type: vultr
  api_key: key
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_new_record_defaults() {
        let record = ClusterRecord::new(&test_definition());
        assert_eq!(record.status, ClusterStatus::Initial);
        assert!(!record.in_progress);
        assert!(record.has_no_markers());
        assert!(is_valid_record_id(&record.id));
        assert_eq!(record.cloud_provider, "vultr");
    }

    #[test]
    fn test_status_serializes_empty_string_initially() {
        let record = ClusterRecord::new(&test_definition());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], json!(""));
    }

    #[test]
    fn test_apply_marker() {
        let mut record = ClusterRecord::new(&test_definition());
        record
            .apply_field("install_tools_check", json!(true))
            .unwrap();
        assert!(record.install_tools_check);
        assert_eq!(record.flag(RecordField::InstallToolsCheck), Some(true));
    }

    #[test]
    fn test_apply_status() {
        let mut record = ClusterRecord::new(&test_definition());
        record.apply_field("status", json!("provisioned")).unwrap();
        assert_eq!(record.status, ClusterStatus::Provisioned);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut record = ClusterRecord::new(&test_definition());
        let before = record.clone();
        let result = record.apply_field("cluster_name", json!("other"));
        assert!(matches!(result, Err(StoreError::InvalidField(_))));
        assert_eq!(record, before);
    }

    #[test]
    fn test_wrong_value_type_rejected() {
        let mut record = ClusterRecord::new(&test_definition());
        let result = record.apply_field("in_progress", json!("yes"));
        assert!(matches!(result, Err(StoreError::InvalidField(_))));
        let result = record.apply_field("status", json!("half-done"));
        assert!(matches!(result, Err(StoreError::InvalidField(_))));
    }

    #[test]
    fn test_state_store_details_field() {
        let mut record = ClusterRecord::new(&test_definition());
        record
            .apply_field(
                "state_store_details",
                json!({"id": "os-1", "name": "mgmt-state-store", "hostname": "ewr1.vultrobjects.com"}),
            )
            .unwrap();
        assert_eq!(
            record.state_store_details.as_ref().map(|d| d.name.as_str()),
            Some("mgmt-state-store")
        );
    }

    #[test]
    fn test_record_field_round_trip_names() {
        for field in RecordField::ALL {
            assert_eq!(field.as_str().parse::<RecordField>().unwrap(), *field);
        }
    }

    #[test]
    fn test_record_id_shape() {
        assert!(is_valid_record_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_record_id("not-a-hex-id"));
        assert!(!is_valid_record_id("0123456789abcdef0123456789abcdeg"));
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = Lease {
            holder: "a".to_string(),
            expires_at: now,
        };
        assert!(lease.is_expired(now));
        assert!(!lease.is_expired(now - chrono::Duration::seconds(1)));
    }
}
