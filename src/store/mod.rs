//! Cluster record store
//!
//! The store owns physical storage of [`ClusterRecord`] documents and exposes
//! only document-level operations. Each operation is atomic for a single
//! document; callers compose them into checkpoints. [`Environment`] entries
//! are kept alongside the records.
//!
//! Two backends are provided:
//! - [`MemoryRecordStore`] - DashMap-backed, used by tests and dry runs
//! - [`FileRecordStore`] - one JSON document per cluster, written atomically
//!   under a directory lock shared by every process using the directory

pub mod environment;
pub mod file;
pub mod memory;
pub mod record;

pub use environment::{check_environment_name, Environment, EnvironmentUpdate};
pub use file::FileRecordStore;
pub use memory::MemoryRecordStore;
pub use record::{
    is_valid_record_id, ClusterRecord, ClusterStatus, Lease, RecordField, RECORD_ID_LEN,
};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::config::ClusterDefinition;

/// Errors returned by record store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cluster record '{0}' not found")]
    NotFound(String),

    #[error("Cluster record '{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid field: {0}")]
    InvalidField(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Cluster '{cluster}' is leased by '{holder}' until {expires_at}")]
    LeaseHeld {
        cluster: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Environment '{0}' not found")]
    EnvironmentNotFound(String),

    #[error("Environment '{0}' already exists")]
    EnvironmentExists(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a fresh record for the definition's cluster name
    async fn create_record(
        &self,
        definition: &ClusterDefinition,
    ) -> Result<ClusterRecord, StoreError>;

    async fn get_record(&self, name: &str) -> Result<ClusterRecord, StoreError>;

    /// Update one named checkpoint field
    async fn update_field(&self, name: &str, field: &str, value: Value)
        -> Result<(), StoreError>;

    /// Delete by record id (not by name)
    async fn delete_record(&self, id: &str) -> Result<(), StoreError>;

    async fn list_records(&self) -> Result<Vec<ClusterRecord>, StoreError>;

    /// Insert or replace a whole record unconditionally
    async fn put_record(&self, record: ClusterRecord) -> Result<(), StoreError>;

    /// Insert or replace a record from a backup. Refused while another run
    /// holds an unexpired lease on the local copy.
    async fn restore_record(&self, record: ClusterRecord) -> Result<(), StoreError>;

    /// Claim the record for `holder` if unleased, expired, or already ours
    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    /// Extend a lease we hold
    async fn renew_lease(&self, name: &str, holder: &str, ttl: Duration)
        -> Result<Lease, StoreError>;

    /// Drop the lease if `holder` owns it; no-op otherwise
    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StoreError>;

    async fn list_environments(&self) -> Result<Vec<Environment>, StoreError>;

    async fn get_environment(&self, name: &str) -> Result<Environment, StoreError>;

    /// Store a new environment; fails if the name is taken
    async fn insert_environment(
        &self,
        environment: Environment,
    ) -> Result<Environment, StoreError>;

    async fn update_environment(
        &self,
        id: &str,
        update: &EnvironmentUpdate,
    ) -> Result<Environment, StoreError>;

    async fn delete_environment(&self, id: &str) -> Result<(), StoreError>;
}

// ============================================================================
// SBIO: Pure lease logic shared by both backends
// ============================================================================

/// Decide whether `holder` may take (or extend) the lease on `record`
pub fn claim_lease(
    record: &mut ClusterRecord,
    holder: &str,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Lease, StoreError> {
    if let Some(existing) = &record.lease {
        if existing.holder != holder && !existing.is_expired(now) {
            return Err(StoreError::LeaseHeld {
                cluster: record.cluster_name.clone(),
                holder: existing.holder.clone(),
                expires_at: existing.expires_at,
            });
        }
    }

    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(2));
    let lease = Lease {
        holder: holder.to_string(),
        expires_at: now + ttl,
    };
    record.lease = Some(lease.clone());
    record.updated_at = now;
    Ok(lease)
}

/// Clear the lease if `holder` owns it; returns whether anything changed
pub fn drop_lease(record: &mut ClusterRecord, holder: &str) -> bool {
    match &record.lease {
        Some(lease) if lease.holder == holder => {
            record.lease = None;
            record.updated_at = Utc::now();
            true
        }
        _ => false,
    }
}

/// A restore may replace `existing` only while nobody holds its lease
pub fn check_replaceable(existing: &ClusterRecord, now: DateTime<Utc>) -> Result<(), StoreError> {
    match &existing.lease {
        Some(lease) if !lease.is_expired(now) => Err(StoreError::LeaseHeld {
            cluster: existing.cluster_name.clone(),
            holder: lease.holder.clone(),
            expires_at: lease.expires_at,
        }),
        _ => Ok(()),
    }
}

/// Validate a record id before touching the store
pub fn check_record_id(id: &str) -> Result<String, StoreError> {
    if !is_valid_record_id(id) {
        return Err(StoreError::InvalidInput(format!("invalid id {}", id)));
    }
    Ok(id.to_ascii_lowercase())
}
