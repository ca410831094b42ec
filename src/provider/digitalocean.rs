//! DigitalOcean adapter
//!
//! DNS, regions and sizes go through the v2 REST API. The state store is a
//! Spaces bucket created through the S3 API with the configured Spaces keys.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{run_liveness, ApiClient, CloudProvider, DnsRecord, ProviderDeps, ProviderError};
use crate::objectstore::{StateStoreCredentials, StateStoreDetails};

pub const DIGITALOCEAN_API_URL: &str = "https://api.digitalocean.com/v2";

const PAGE_SIZE: &str = "200";

#[derive(Debug, Deserialize)]
struct DomainsResponse {
    domains: Vec<DoDomain>,
}

#[derive(Debug, Deserialize)]
struct DomainResponse {
    domain: DoDomain,
}

#[derive(Debug, Deserialize)]
struct DoDomain {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    domain_records: Vec<DoRecord>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    domain_record: DoRecord,
}

#[derive(Debug, Deserialize)]
struct DoRecord {
    id: u64,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    data: String,
    #[serde(default)]
    ttl: u32,
}

impl From<DoRecord> for DnsRecord {
    fn from(r: DoRecord) -> Self {
        DnsRecord {
            id: r.id.to_string(),
            name: r.name,
            record_type: r.record_type,
            data: r.data,
            ttl: r.ttl,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    data: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct RegionsResponse {
    regions: Vec<DoRegion>,
}

#[derive(Debug, Deserialize)]
struct DoRegion {
    slug: String,
    #[serde(default)]
    available: bool,
}

#[derive(Debug, Deserialize)]
struct SizesResponse {
    sizes: Vec<DoSize>,
}

#[derive(Debug, Deserialize)]
struct DoSize {
    slug: String,
    #[serde(default)]
    regions: Vec<String>,
    #[serde(default)]
    available: bool,
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

fn sizes_in_region(sizes: Vec<DoSize>, region: &str) -> Vec<String> {
    sizes
        .into_iter()
        .filter(|s| s.available && s.regions.iter().any(|r| r == region))
        .map(|s| s.slug)
        .collect()
}

/// S3 endpoint of Spaces in a region
pub fn spaces_hostname(region: &str) -> String {
    format!("{}.digitaloceanspaces.com", region)
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

pub struct DigitalOceanProvider {
    api: ApiClient,
    spaces: StateStoreCredentials,
    region: String,
    deps: ProviderDeps,
}

impl DigitalOceanProvider {
    pub fn new(
        token: String,
        spaces: StateStoreCredentials,
        region: String,
        deps: ProviderDeps,
    ) -> Self {
        Self {
            api: ApiClient::new(DIGITALOCEAN_API_URL, token),
            spaces,
            region,
            deps,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api = self.api.with_base_url(base_url);
        self
    }
}

#[async_trait]
impl CloudProvider for DigitalOceanProvider {
    fn name(&self) -> &'static str {
        "digitalocean"
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
        Ok(resp.domain_records.into_iter().map(DnsRecord::from).collect())
    }

    async fn create_dns_record(
        &self,
        domain: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError> {
        let body = CreateRecordRequest {
            record_type: &record.record_type,
            name: &record.name,
            data: &record.data,
            ttl: record.ttl,
        };
        let resp: RecordResponse = self
            .api
            .post(&format!("domains/{}/records", domain), &body)
            .await?;
        Ok(resp.domain_record.into())
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
        Ok(resp.domain.name)
    }

    async fn list_domains(&self) -> Result<Vec<String>, ProviderError> {
        let resp: DomainsResponse = self.api.get("domains", &[("per_page", PAGE_SIZE)]).await?;
        Ok(resp.domains.into_iter().map(|d| d.name).collect())
    }

    async fn list_regions(&self) -> Result<Vec<String>, ProviderError> {
        let resp: RegionsResponse = self.api.get("regions", &[("per_page", PAGE_SIZE)]).await?;
        Ok(resp
            .regions
            .into_iter()
            .filter(|r| r.available)
            .map(|r| r.slug)
            .collect())
    }

    async fn list_instance_types(&self, region: &str) -> Result<Vec<String>, ProviderError> {
        let resp: SizesResponse = self.api.get("sizes", &[("per_page", PAGE_SIZE)]).await?;
        Ok(sizes_in_region(resp.sizes, region))
    }

    async fn create_state_store(
        &self,
        bucket: &str,
    ) -> Result<(StateStoreCredentials, StateStoreDetails), ProviderError> {
        let details = StateStoreDetails {
            id: bucket.to_string(),
            name: bucket.to_string(),
            hostname: spaces_hostname(&self.region),
        };
        self.deps
            .object_store
            .create_bucket(&self.spaces, &details)
            .await?;
        info!("state store bucket {} ready on {}", bucket, details.hostname);
        Ok((self.spaces.clone(), details))
    }

    async fn state_store_credentials(
        &self,
        _details: &StateStoreDetails,
    ) -> Result<StateStoreCredentials, ProviderError> {
        Ok(self.spaces.clone())
    }
}
