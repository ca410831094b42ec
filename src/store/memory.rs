//! In-memory record store backed by DashMap

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::{
    check_record_id, check_replaceable, claim_lease, drop_lease, ClusterRecord, Environment, EnvironmentUpdate, Lease,
    RecordStore, StoreError,
};
use crate::config::ClusterDefinition;

/// Record store holding documents in a concurrent map keyed by cluster name
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
    records: Arc<DashMap<String, ClusterRecord>>,
    environments: Arc<DashMap<String, Environment>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn environment_key(&self, id: &str) -> Result<String, StoreError> {
        let id = check_record_id(id)?;
        self.environments
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.key().clone())
            .ok_or_else(|| StoreError::EnvironmentNotFound(format!("id {}", id)))
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_record(
        &self,
        definition: &ClusterDefinition,
    ) -> Result<ClusterRecord, StoreError> {
        match self.records.entry(definition.cluster_name.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(
                definition.cluster_name.clone(),
            )),
            Entry::Vacant(slot) => {
                let record = ClusterRecord::new(definition);
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get_record(&self, name: &str) -> Result<ClusterRecord, StoreError> {
        self.records
            .get(name)
            .map(|r| r.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn update_field(
        &self,
        name: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut record = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        // Apply to a copy so a rejected value leaves the document untouched
        let mut updated = record.clone();
        updated.apply_field(field, value)?;
        *record = updated;
        Ok(())
    }

    async fn delete_record(&self, id: &str) -> Result<(), StoreError> {
        let id = check_record_id(id)?;

        let name = self
            .records
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.key().clone())
            .ok_or_else(|| StoreError::NotFound(format!("no cluster with id {}", id)))?;

        self.records
            .remove_if(&name, |_, r| r.id == id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("no cluster with id {}", id)))
    }

    async fn list_records(&self) -> Result<Vec<ClusterRecord>, StoreError> {
        Ok(self.records.iter().map(|r| r.clone()).collect())
    }

    async fn put_record(&self, record: ClusterRecord) -> Result<(), StoreError> {
        self.records.insert(record.cluster_name.clone(), record);
        Ok(())
    }

    async fn restore_record(&self, record: ClusterRecord) -> Result<(), StoreError> {
        match self.records.entry(record.cluster_name.clone()) {
            Entry::Occupied(mut slot) => {
                check_replaceable(slot.get(), Utc::now())?;
                slot.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        Ok(())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut record = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        claim_lease(&mut record, holder, ttl, Utc::now())
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
        let mut record = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        drop_lease(&mut record, holder);
        Ok(())
    }

    async fn list_environments(&self) -> Result<Vec<Environment>, StoreError> {
        Ok(self.environments.iter().map(|e| e.clone()).collect())
    }

    async fn get_environment(&self, name: &str) -> Result<Environment, StoreError> {
        self.environments
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| StoreError::EnvironmentNotFound(name.to_string()))
    }

    async fn insert_environment(
        &self,
        environment: Environment,
    ) -> Result<Environment, StoreError> {
        match self.environments.entry(environment.name.clone()) {
            Entry::Occupied(_) => Err(StoreError::EnvironmentExists(environment.name)),
            Entry::Vacant(slot) => {
                slot.insert(environment.clone());
                Ok(environment)
            }
        }
    }

    async fn update_environment(
        &self,
        id: &str,
        update: &EnvironmentUpdate,
    ) -> Result<Environment, StoreError> {
        let key = self.environment_key(id)?;
        let mut environment = self
            .environments
            .get_mut(&key)
            .ok_or_else(|| StoreError::EnvironmentNotFound(format!("id {}", id)))?;
        environment.apply(update);
        Ok(environment.clone())
    }

    async fn delete_environment(&self, id: &str) -> Result<(), StoreError> {
        let key = self.environment_key(id)?;
        self.environments
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| StoreError::EnvironmentNotFound(format!("id {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ClusterStatus;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn definition(name: &str) -> ClusterDefinition {
        let yaml = format!(
            r#"
cluster_name: {}
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
            name
        );
        ClusterDefinition::from_str(&yaml).unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get_has_defaults() {
        let store = MemoryRecordStore::new();
        store.create_record(&definition("mgmt")).await.unwrap();

        let record = store.get_record("mgmt").await.unwrap();
        assert!(!record.in_progress);
        assert_eq!(record.status, ClusterStatus::Initial);
        assert!(record.has_no_markers());
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_record_unmodified() {
        let store = MemoryRecordStore::new();
        store.create_record(&definition("mgmt")).await.unwrap();
        store
            .update_field("mgmt", "git_init_check", json!(true))
            .await
            .unwrap();
        let before = store.get_record("mgmt").await.unwrap();

        let result = store.create_record(&definition("mgmt")).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.get_record("mgmt").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryRecordStore::new();
        let result = store.get_record("ghost").await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_field_errors() {
        let store = MemoryRecordStore::new();
        let missing = store.update_field("ghost", "in_progress", json!(true)).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        store.create_record(&definition("mgmt")).await.unwrap();
        let bad = store.update_field("mgmt", "not_a_field", json!(true)).await;
        assert!(matches!(bad, Err(StoreError::InvalidField(_))));
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let store = MemoryRecordStore::new();
        let record = store.create_record(&definition("mgmt")).await.unwrap();

        store.delete_record(&record.id).await.unwrap();
        assert!(store.is_empty());

        let again = store.delete_record(&record.id).await;
        assert!(matches!(again, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_malformed_id_does_not_mutate() {
        let store = MemoryRecordStore::new();
        store.create_record(&definition("mgmt")).await.unwrap();

        let result = store.delete_record("mgmt").await;
        assert!(matches!(result, Err(StoreError::InvalidInput(_))));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_list_records() {
        let store = MemoryRecordStore::new();
        store.create_record(&definition("one")).await.unwrap();
        store.create_record(&definition("two")).await.unwrap();

        let mut names: Vec<String> = store
            .list_records()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.cluster_name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_lease_contention() {
        let store = MemoryRecordStore::new();
        store.create_record(&definition("mgmt")).await.unwrap();
        let ttl = Duration::from_secs(60);

        let lease = assert_ok!(store.acquire_lease("mgmt", "run-a", ttl).await);
        assert_eq!(lease.holder, "run-a");
        let second = assert_err!(store.acquire_lease("mgmt", "run-b", ttl).await);
        assert!(matches!(second, StoreError::LeaseHeld { ref holder, .. } if holder == "run-a"));

        // Releasing someone else's lease is a no-op
        assert_ok!(store.release_lease("mgmt", "run-b").await);
        assert_err!(store.acquire_lease("mgmt", "run-b", ttl).await);

        assert_ok!(store.release_lease("mgmt", "run-a").await);
        assert_ok!(store.acquire_lease("mgmt", "run-b", ttl).await);
    }

    #[tokio::test]
    async fn test_environment_lifecycle() {
        let store = MemoryRecordStore::new();
        let env = Environment::new("staging", "yellow", "pre-release").unwrap();
        let inserted = assert_ok!(store.insert_environment(env.clone()).await);
        assert_eq!(inserted, env);

        let duplicate = Environment::new("staging", "red", "").unwrap();
        let err = assert_err!(store.insert_environment(duplicate).await);
        assert!(matches!(err, StoreError::EnvironmentExists(ref n) if n == "staging"));
        assert_eq!(store.get_environment("staging").await.unwrap().color, "yellow");

        let updated = assert_ok!(
            store
                .update_environment(
                    &env.id,
                    &EnvironmentUpdate {
                        color: Some("orange".to_string()),
                        description: None,
                    },
                )
                .await
        );
        assert_eq!(updated.color, "orange");
        assert_eq!(updated.description, "pre-release");

        assert_ok!(store.delete_environment(&env.id).await);
        assert!(store.list_environments().await.unwrap().is_empty());
        let gone = assert_err!(store.get_environment("staging").await);
        assert!(matches!(gone, StoreError::EnvironmentNotFound(_)));
    }

    #[tokio::test]
    async fn test_environment_bad_or_unknown_id() {
        let store = MemoryRecordStore::new();
        store
            .insert_environment(Environment::new("production", "red", "").unwrap())
            .await
            .unwrap();

        let malformed = store.delete_environment("production").await;
        assert!(matches!(malformed, Err(StoreError::InvalidInput(_))));

        let unknown = store
            .update_environment(&"0".repeat(32), &EnvironmentUpdate::default())
            .await;
        assert!(matches!(unknown, Err(StoreError::EnvironmentNotFound(_))));
        assert_eq!(store.list_environments().await.unwrap().len(), 1);
    }
}
