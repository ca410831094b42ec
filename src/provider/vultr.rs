//! Vultr adapter over the v2 REST API

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{run_liveness, ApiClient, CloudProvider, DnsRecord, ProviderDeps, ProviderError};
use crate::objectstore::{StateStoreCredentials, StateStoreDetails};

pub const VULTR_API_URL: &str = "https://api.vultr.com/v2";

const PAGE_SIZE: &str = "500";
const STATE_STORE_POLL_ATTEMPTS: u32 = 30;
const STATE_STORE_POLL_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// SBIO: Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct DomainsResponse {
    domains: Vec<VultrDomain>,
}

#[derive(Debug, Deserialize)]
struct DomainResponse {
    domain: VultrDomain,
}

#[derive(Debug, Deserialize)]
struct VultrDomain {
    domain: String,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    records: Vec<VultrRecord>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    record: VultrRecord,
}

#[derive(Debug, Deserialize)]
struct VultrRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
    #[serde(default)]
    ttl: u32,
}

impl From<VultrRecord> for DnsRecord {
    fn from(r: VultrRecord) -> Self {
        DnsRecord {
            id: r.id,
            name: r.name,
            record_type: r.record_type,
            data: r.data,
            ttl: r.ttl,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    record_type: &'a str,
    data: &'a str,
    ttl: u32,
    priority: u32,
}

#[derive(Debug, Deserialize)]
struct RegionsResponse {
    regions: Vec<VultrRegion>,
}

#[derive(Debug, Deserialize)]
struct VultrRegion {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PlansResponse {
    plans: Vec<VultrPlan>,
}

#[derive(Debug, Deserialize)]
struct VultrPlan {
    id: String,
    #[serde(default)]
    locations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StorageClustersResponse {
    clusters: Vec<StorageCluster>,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageCluster {
    id: u64,
    region: String,
    hostname: String,
    #[serde(default)]
    deploy: String,
}

#[derive(Debug, Serialize)]
struct CreateObjectStorageRequest<'a> {
    cluster_id: u64,
    label: &'a str,
}

#[derive(Debug, Deserialize)]
struct ObjectStorageResponse {
    object_storage: VultrObjectStorage,
}

#[derive(Debug, Deserialize)]
struct VultrObjectStorage {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    s3_hostname: String,
    #[serde(default)]
    s3_access_key: String,
    #[serde(default)]
    s3_secret_key: String,
}

impl VultrObjectStorage {
    fn is_ready(&self) -> bool {
        self.status == "active" && !self.s3_hostname.is_empty() && !self.s3_access_key.is_empty()
    }

    fn credentials(&self) -> StateStoreCredentials {
        StateStoreCredentials {
            access_key_id: self.s3_access_key.clone(),
            secret_access_key: self.s3_secret_key.clone(),
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Plans offered in a region
fn plans_in_region(plans: Vec<VultrPlan>, region: &str) -> Vec<String> {
    plans
        .into_iter()
        .filter(|p| p.locations.iter().any(|l| l == region))
        .map(|p| p.id)
        .collect()
}

/// Pick the object storage cluster to host the state store, preferring the
/// cluster's own region
fn select_storage_cluster(clusters: &[StorageCluster], region: &str) -> Option<StorageCluster> {
    let deployable = |c: &&StorageCluster| c.deploy.is_empty() || c.deploy == "yes";
    clusters
        .iter()
        .filter(deployable)
        .find(|c| c.region == region)
        .or_else(|| clusters.iter().find(deployable))
        .cloned()
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

pub struct VultrProvider {
    api: ApiClient,
    region: String,
    deps: ProviderDeps,
}

impl VultrProvider {
    pub fn new(api_key: String, region: String, deps: ProviderDeps) -> Self {
        Self {
            api: ApiClient::new(VULTR_API_URL, api_key),
            region,
            deps,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = self.api.with_base_url(base_url);
        self
    }

    async fn object_storage(&self, id: &str) -> Result<VultrObjectStorage, ProviderError> {
        let resp: ObjectStorageResponse = self
            .api
            .get(&format!("object-storage/{}", id), &[])
            .await?;
        Ok(resp.object_storage)
    }
}

#[async_trait]
impl CloudProvider for VultrProvider {
    fn name(&self) -> &'static str {
        "vultr"
    }

    async fn test_domain_liveness(&self, domain: &str) -> Result<bool, ProviderError> {
        run_liveness(self, &self.deps, domain).await
    }

    async fn list_dns_records(&self, domain: &str) -> Result<Vec<DnsRecord>, ProviderError> {
        let resp: RecordsResponse = self
            .api
            .get(
                &format!("domains/{}/records", domain),
                &[("per_page", PAGE_SIZE)],
            )
            .await?;
        Ok(resp.records.into_iter().map(DnsRecord::from).collect())
    }

    async fn create_dns_record(
        &self,
        domain: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError> {
        let body = CreateRecordRequest {
            name: &record.name,
            record_type: &record.record_type,
            data: &record.data,
            ttl: record.ttl,
            priority: 100,
        };
        let resp: RecordResponse = self
            .api
            .post(&format!("domains/{}/records", domain), &body)
            .await?;
        Ok(resp.record.into())
    }

    async fn get_domain_info(&self, domain: &str) -> Result<String, ProviderError> {
        let resp: DomainResponse = self
            .api
            .get(&format!("domains/{}", domain), &[])
            .await
            .map_err(|e| match e {
                ProviderError::NotFound(_) => ProviderError::NotFound(domain.to_string()),
                other => other,
            })?;
        Ok(resp.domain.domain)
    }

    async fn list_domains(&self) -> Result<Vec<String>, ProviderError> {
        let resp: DomainsResponse = self.api.get("domains", &[("per_page", PAGE_SIZE)]).await?;
        Ok(resp.domains.into_iter().map(|d| d.domain).collect())
    }

    async fn list_regions(&self) -> Result<Vec<String>, ProviderError> {
        let resp: RegionsResponse = self.api.get("regions", &[("per_page", PAGE_SIZE)]).await?;
        Ok(resp.regions.into_iter().map(|r| r.id).collect())
    }

    async fn list_instance_types(&self, region: &str) -> Result<Vec<String>, ProviderError> {
        let resp: PlansResponse = self
            .api
            .get("plans", &[("region", region), ("per_page", PAGE_SIZE)])
            .await?;
        Ok(plans_in_region(resp.plans, region))
    }

    async fn create_state_store(
        &self,
        bucket: &str,
    ) -> Result<(StateStoreCredentials, StateStoreDetails), ProviderError> {
        let clusters: StorageClustersResponse =
            self.api.get("object-storage/clusters", &[]).await?;
        let cluster = select_storage_cluster(&clusters.clusters, &self.region).ok_or_else(|| {
            ProviderError::NotFound(format!("object storage cluster for region {}", self.region))
        })?;
        debug!(
            "using object storage cluster {} ({})",
            cluster.id, cluster.hostname
        );

        let created: ObjectStorageResponse = self
            .api
            .post(
                "object-storage",
                &CreateObjectStorageRequest {
                    cluster_id: cluster.id,
                    label: bucket,
                },
            )
            .await?;
        let id = created.object_storage.id.clone();

        let mut storage = created.object_storage;
        let mut attempts = 0;
        while !storage.is_ready() {
            attempts += 1;
            if attempts > STATE_STORE_POLL_ATTEMPTS {
                return Err(ProviderError::StateStoreNotReady(id));
            }
            info!("waiting for object storage {} to become active", id);
            tokio::time::sleep(STATE_STORE_POLL_INTERVAL).await;
            storage = self.object_storage(&id).await?;
        }

        let credentials = storage.credentials();
        let details = StateStoreDetails {
            id: storage.id,
            name: bucket.to_string(),
            hostname: storage.s3_hostname,
        };
        self.deps
            .object_store
            .create_bucket(&credentials, &details)
            .await?;
        info!("state store bucket {} ready on {}", bucket, details.hostname);
        Ok((credentials, details))
    }

    async fn state_store_credentials(
        &self,
        details: &StateStoreDetails,
    ) -> Result<StateStoreCredentials, ProviderError> {
        Ok(self.object_storage(&details.id).await?.credentials())
    }
}
