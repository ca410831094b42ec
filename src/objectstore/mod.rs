//! Object storage for terraform state and cluster record backups
//!
//! The state store is an S3-compatible bucket created per cluster. Besides
//! terraform state, it holds a JSON export of the cluster record so an
//! installation can be restored on another machine.

pub mod s3;

pub use s3::S3ObjectStore;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::store::ClusterRecord;

/// Access keys for the state store bucket. Never persisted.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStoreCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StateStoreCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStoreCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

/// Location of the state store bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateStoreDetails {
    /// Provider-side identifier of the object storage instance
    pub id: String,
    /// Bucket name
    pub name: String,
    /// S3 endpoint hostname, without scheme
    pub hostname: String,
}

/// A local file to upload
#[derive(Debug, Clone, PartialEq)]
pub struct PushBucketObject {
    pub local_path: PathBuf,
    pub remote_path: String,
    pub content_type: String,
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object storage request failed: {0}")]
    Request(String),

    #[error("Object storage returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cluster object: {0}")]
    Parse(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn create_bucket(
        &self,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
    ) -> Result<(), ObjectStoreError>;

    async fn put_object(
        &self,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
        object: &PushBucketObject,
    ) -> Result<(), ObjectStoreError>;

    async fn get_object(
        &self,
        credentials: &StateStoreCredentials,
        details: &StateStoreDetails,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<(), ObjectStoreError>;
}

/// Remote key of a cluster record export
pub fn cluster_object_key(cluster_name: &str) -> String {
    format!("clusters/{}.json", cluster_name)
}

/// Export a cluster record as JSON and upload it to the state store bucket
pub async fn export_cluster_record(
    store: &dyn ObjectStore,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
    record: &ClusterRecord,
    scratch_dir: &Path,
) -> Result<String, ObjectStoreError> {
    // Leases belong to a live run on this machine
    let mut exported = record.clone();
    exported.lease = None;

    tokio::fs::create_dir_all(scratch_dir).await?;
    let local_path = scratch_dir.join(format!("{}.json", record.cluster_name));
    let body = serde_json::to_vec_pretty(&exported)
        .map_err(|e| ObjectStoreError::Parse(e.to_string()))?;
    tokio::fs::write(&local_path, body).await?;

    let object = PushBucketObject {
        local_path,
        remote_path: cluster_object_key(&record.cluster_name),
        content_type: "application/json".to_string(),
    };
    store.put_object(credentials, details, &object).await?;

    info!(
        "uploaded cluster object {} to state store bucket {} successfully",
        object.remote_path, details.name
    );
    Ok(object.remote_path)
}

/// Download a cluster record export from the state store bucket
pub async fn import_cluster_record(
    store: &dyn ObjectStore,
    credentials: &StateStoreCredentials,
    details: &StateStoreDetails,
    cluster_name: &str,
    scratch_dir: &Path,
) -> Result<ClusterRecord, ObjectStoreError> {
    tokio::fs::create_dir_all(scratch_dir).await?;
    let local_path = scratch_dir.join(format!("{}.json", cluster_name));
    store
        .get_object(
            credentials,
            details,
            &cluster_object_key(cluster_name),
            &local_path,
        )
        .await?;

    let bytes = tokio::fs::read(&local_path).await?;
    serde_json::from_slice(&bytes).map_err(|e| ObjectStoreError::Parse(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::mock::MockObjectStore;
    use super::*;
    use crate::config::ClusterDefinition;
    use tempfile::TempDir;

    fn record() -> ClusterRecord {
        let def = ClusterDefinition::from_str(
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
        .unwrap();
        ClusterRecord::new(&def)
    }

    fn creds() -> (StateStoreCredentials, StateStoreDetails) {
        (
            StateStoreCredentials {
                access_key_id: "AK".to_string(),
                secret_access_key: "SK".to_string(),
            },
            StateStoreDetails {
                id: "os-1".to_string(),
                name: "mgmt-state-store".to_string(),
                hostname: "ewr1.vultrobjects.com".to_string(),
            },
        )
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let (cr, _) = creds();
        let printed = format!("{:?}", cr);
        assert!(printed.contains("AK"));
        assert!(!printed.contains("SK\""));
    }

    #[tokio::test]
    async fn test_export_then_import_cluster_record() {
        let scratch = TempDir::new().unwrap();
        let store = MockObjectStore::default();
        let (cr, d) = creds();
        let mut rec = record();
        rec.git_init_check = true;
        rec.lease = Some(crate::store::Lease {
            holder: "me".to_string(),
            expires_at: chrono::Utc::now(),
        });

        let key = export_cluster_record(&store, &cr, &d, &rec, scratch.path())
            .await
            .unwrap();
        assert_eq!(key, "clusters/mgmt.json");
        let (_, content_type) = store
            .objects
            .get("mgmt-state-store/clusters/mgmt.json")
            .map(|r| r.clone())
            .unwrap();
        assert_eq!(content_type, "application/json");

        let restore_dir = TempDir::new().unwrap();
        let restored = import_cluster_record(&store, &cr, &d, "mgmt", restore_dir.path())
            .await
            .unwrap();
        assert!(restored.git_init_check);
        assert!(restored.lease.is_none());
        assert_eq!(restored.id, rec.id);
    }

    #[tokio::test]
    async fn test_import_missing_object() {
        let scratch = TempDir::new().unwrap();
        let store = MockObjectStore::default();
        let (cr, d) = creds();
        let result = import_cluster_record(&store, &cr, &d, "ghost", scratch.path()).await;
        assert!(matches!(result, Err(ObjectStoreError::Http { status: 404, .. })));
    }
}
