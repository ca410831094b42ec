//! File-backed record store: one JSON document per cluster
//!
//! Writes go to a uniquely named temporary sibling and are renamed into
//! place, so a reader never observes a half-written document. Every
//! read-modify-write cycle holds an exclusive lock on `.lock` in the store
//! directory, which serializes writers across processes as well as tasks.
//! Environments live in the `environments/` subdirectory, one file each.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::{
    check_environment_name, check_record_id, check_replaceable, claim_lease, drop_lease, ClusterRecord, Environment,
    EnvironmentUpdate, Lease, RecordStore, StoreError,
};
use crate::config::ClusterDefinition;

pub const LOCK_FILE: &str = ".lock";
const ENVIRONMENTS_DIR: &str = "environments";

pub struct FileRecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

/// Held for the length of one read-modify-write cycle
struct StoreGuard<'a> {
    _local: MutexGuard<'a, ()>,
    // Closing the descriptor releases the advisory lock
    _file: std::fs::File,
}

impl FileRecordStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join(ENVIRONMENTS_DIR)).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn environment_path(&self, name: &str) -> PathBuf {
        self.dir.join(ENVIRONMENTS_DIR).join(format!("{}.json", name))
    }

    async fn lock(&self) -> Result<StoreGuard<'_>, StoreError> {
        let local = self.write_lock.lock().await;
        let path = self.dir.join(LOCK_FILE);
        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(file)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store lock task failed: {}", e)))??;
        Ok(StoreGuard {
            _local: local,
            _file: file,
        })
    }

    async fn read(&self, name: &str) -> Result<ClusterRecord, StoreError> {
        read_json(&self.path_for(name))
            .await?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn write(&self, record: &ClusterRecord) -> Result<(), StoreError> {
        let path = self.path_for(&record.cluster_name);
        write_json(&path, record).await?;
        debug!(cluster = %record.cluster_name, path = %path.display(), "Wrote cluster record");
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        read_dir_json(&self.dir).await
    }

    async fn find_environment(&self, id: &str) -> Result<Environment, StoreError> {
        let id = check_record_id(id)?;
        read_dir_json::<Environment>(&self.dir.join(ENVIRONMENTS_DIR))
            .await?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::EnvironmentNotFound(format!("id {}", id)))
    }
}

// ============================================================================
// SBIO: I/O implementation (JSON documents on disk)
// ============================================================================

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Backend(format!("no parent for {}", path.display())))?;
    let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Every `*.json` document directly under `dir`, skipping dotfiles
async fn read_dir_json<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
    let mut documents = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_document = path.extension().and_then(|e| e.to_str()) == Some("json")
            && !entry.file_name().to_string_lossy().starts_with('.');
        if !is_document {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        documents.push(serde_json::from_slice(&bytes)?);
    }
    Ok(documents)
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn create_record(
        &self,
        definition: &ClusterDefinition,
    ) -> Result<ClusterRecord, StoreError> {
        let _guard = self.lock().await?;
        match self.read(&definition.cluster_name).await {
            Ok(_) => Err(StoreError::AlreadyExists(definition.cluster_name.clone())),
            Err(StoreError::NotFound(_)) => {
                let record = ClusterRecord::new(definition);
                self.write(&record).await?;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_record(&self, name: &str) -> Result<ClusterRecord, StoreError> {
        self.read(name).await
    }

    async fn update_field(
        &self,
        name: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        let mut record = self.read(name).await?;
        record.apply_field(field, value)?;
        self.write(&record).await
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        let id = check_record_id(id)?;
        let _guard = self.lock().await?;

        let record = self
            .read_all()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("no cluster with id {}", id)))?;

        tokio::fs::remove_file(self.path_for(&record.cluster_name)).await?;
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        self.read_all().await
    }

    async fn put_record(&self, record: ClusterRecord) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        self.write(&record).await
    }

    async fn restore_record(&self, record: ClusterRecord) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        match self.read(&record.cluster_name).await {
            Ok(existing) => check_replaceable(&existing, Utc::now())?,
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.write(&record).await
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let _guard = self.lock().await?;
        let mut record = self.read(name).await?;
        let lease = claim_lease(&mut record, holder, ttl, Utc::now())?;
        self.write(&record).await?;
        Ok(lease)
    }

    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        self.acquire_lease(name, holder, ttl).await
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        let mut record = self.read(name).await?;
        if drop_lease(&mut record, holder) {
            self.write(&record).await?;
        }
        Ok(())
    }

    async fn list_environments(&self) -> Result<Vec<Environment>, StoreError> {
        read_dir_json(&self.dir.join(ENVIRONMENTS_DIR)).await
    }

    async fn get_environment(&self, name: &str) -> Result<Environment, StoreError> {
        check_environment_name(name)?;
        read_json(&self.environment_path(name))
            .await?
            .ok_or_else(|| StoreError::EnvironmentNotFound(name.to_string()))
    }

    async fn insert_environment(
        &self,
        environment: Environment,
    ) -> Result<Environment, StoreError> {
        check_environment_name(&environment.name)?;
        let _guard = self.lock().await?;
        let path = self.environment_path(&environment.name);
        if read_json::<Environment>(&path).await?.is_some() {
            return Err(StoreError::EnvironmentExists(environment.name));
        }
        write_json(&path, &environment).await?;
        debug!(environment = %environment.name, id = %environment.id, "Inserted environment");
        Ok(environment)
    }

    async fn update_environment(
        &self,
        id: &str,
        update: &EnvironmentUpdate,
    ) -> Result<Environment, StoreError> {
        let _guard = self.lock().await?;
        let mut environment = self.find_environment(id).await?;
        environment.apply(update);
        write_json(&self.environment_path(&environment.name), &environment).await?;
        Ok(environment)
    }

    async fn delete_environment(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.lock().await?;
        let environment = self.find_environment(id).await?;
        tokio::fs::remove_file(self.environment_path(&environment.name)).await?;
        debug!(environment = %environment.name, "Deleted environment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn definition() -> ClusterDefinition {
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

    #[tokio::test]
    async fn test_record_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileRecordStore::open(dir.path()).await.unwrap();
            store.create_record(&definition()).await.unwrap();
            store
                .update_field("mgmt", "install_tools_check", json!(true))
                .await
                .unwrap();
        }

        let store = FileRecordStore::open(dir.path()).await.unwrap();
        let record = store.get_record("mgmt").await.unwrap();
        assert!(record.install_tools_check);
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(dir.path()).await.unwrap();
        store.create_record(&definition()).await.unwrap();
        store
            .update_field("mgmt", "in_progress", json!(true))
            .await
            .unwrap();

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec![LOCK_FILE, "environments", "mgmt.json"]);
    }

    #[tokio::test]
    async fn test_rejected_update_keeps_document() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(dir.path()).await.unwrap();
        store.create_record(&definition()).await.unwrap();
        let before = store.get_record("mgmt").await.unwrap();

        let result = store.update_field("mgmt", "status", json!(42)).await;
        assert!(matches!(result, Err(StoreError::InvalidField(_))));
        assert_eq!(store.get_record("mgmt").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(dir.path()).await.unwrap();
        let record = store.create_record(&definition()).await.unwrap();
        assert_eq!(store.list_records().await.unwrap().len(), 1);

        let malformed = store.delete_record("xyz").await;
        assert!(matches!(malformed, Err(StoreError::InvalidInput(_))));
        assert_eq!(store.list_records().await.unwrap().len(), 1);

        store.delete_record(&record.id).await.unwrap();
        assert!(store.list_records().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lease_exclusive_across_store_handles() {
        let dir = TempDir::new().unwrap();
        let first = FileRecordStore::open(dir.path()).await.unwrap();
        first.create_record(&definition()).await.unwrap();
        let second = FileRecordStore::open(dir.path()).await.unwrap();
        let ttl = Duration::from_secs(60);

        for round in 0..20 {
            let (a, b) = tokio::join!(
                first.acquire_lease("mgmt", "run-a", ttl),
                second.acquire_lease("mgmt", "run-b", ttl),
            );
            assert!(
                a.is_ok() != b.is_ok(),
                "round {}: both or neither acquired",
                round
            );
            let loser = if a.is_ok() { b } else { a };
            assert!(matches!(loser, Err(StoreError::LeaseHeld { .. })));

            let winner = first.get_record("mgmt").await.unwrap().lease.unwrap().holder;
            first.release_lease("mgmt", &winner).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stale_temp_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::open(dir.path()).await.unwrap();
        store.create_record(&definition()).await.unwrap();
        std::fs::write(dir.path().join(".mgmt.json.tmp"), "{ truncated").unwrap();

        store
            .update_field("mgmt", "git_init_check", json!(true))
            .await
            .unwrap();
        let records = store.list_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].git_init_check);
    }

    #[tokio::test]
    async fn test_environments_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let env = Environment::new("development", "green", "dev work").unwrap();
        {
            let store = FileRecordStore::open(dir.path()).await.unwrap();
            store.create_record(&definition()).await.unwrap();
            store.insert_environment(env.clone()).await.unwrap();
            let again = store
                .insert_environment(Environment::new("development", "red", "").unwrap())
                .await;
            assert!(matches!(again, Err(StoreError::EnvironmentExists(_))));
        }

        let store = FileRecordStore::open(dir.path()).await.unwrap();
        assert_eq!(store.list_records().await.unwrap().len(), 1);
        assert_eq!(store.list_environments().await.unwrap(), vec![env.clone()]);

        let updated = store
            .update_environment(
                &env.id,
                &EnvironmentUpdate {
                    color: None,
                    description: Some("shared dev".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.color, "green");
        assert_eq!(
            store.get_environment("development").await.unwrap().description,
            "shared dev"
        );

        store.delete_environment(&env.id).await.unwrap();
        let gone = store.get_environment("development").await;
        assert!(matches!(gone, Err(StoreError::EnvironmentNotFound(_))));
        let missing = store.delete_environment(&env.id).await;
        assert!(matches!(missing, Err(StoreError::EnvironmentNotFound(_))));
    }
}
