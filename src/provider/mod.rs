//! Cloud provider capability adapters
//!
//! Each provider exposes the same capability set behind [`CloudProvider`]:
//! DNS record enumeration and creation, domain / region / instance-type
//! listing, domain liveness and the terraform state store bucket.

pub mod apex;
pub mod digitalocean;
pub mod vultr;

pub use apex::probe_apex_content;
pub use digitalocean::DigitalOceanProvider;
pub use vultr::VultrProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderConfig;
use crate::dns::liveness::{LivenessError, LivenessPolicy, LivenessProber};
use crate::dns::TxtResolver;
use crate::objectstore::{ObjectStore, ObjectStoreError, StateStoreCredentials, StateStoreDetails};

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// A DNS record as returned by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// Provider-side record id; empty for records not yet created
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub data: String,
    pub ttl: u32,
}

impl DnsRecord {
    pub fn txt(name: &str, data: &str, ttl: u32) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            record_type: "TXT".to_string(),
            data: data.to_string(),
            ttl,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("State store error: {0}")]
    StateStore(#[from] ObjectStoreError),

    #[error("State store not ready: {0}")]
    StateStoreNotReady(String),

    #[error("Liveness probe failed: {0}")]
    Liveness(String),
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider identity, matching the definition's `type`
    fn name(&self) -> &'static str;

    /// Create the liveness marker if needed and wait for it to resolve.
    /// `Ok(false)` when the probe budget is exhausted.
    async fn test_domain_liveness(&self, domain: &str) -> Result<bool, ProviderError>;

    async fn list_dns_records(&self, domain: &str) -> Result<Vec<DnsRecord>, ProviderError>;

    async fn create_dns_record(
        &self,
        domain: &str,
        record: &DnsRecord,
    ) -> Result<DnsRecord, ProviderError>;

    /// Domain name as the provider knows it, or `NotFound`
    async fn get_domain_info(&self, domain: &str) -> Result<String, ProviderError>;

    async fn list_domains(&self) -> Result<Vec<String>, ProviderError>;

    async fn list_regions(&self) -> Result<Vec<String>, ProviderError>;

    async fn list_instance_types(&self, region: &str) -> Result<Vec<String>, ProviderError>;

    /// Create the bucket holding terraform state
    async fn create_state_store(
        &self,
        bucket: &str,
    ) -> Result<(StateStoreCredentials, StateStoreDetails), ProviderError>;

    /// Look up access keys for an existing state store
    async fn state_store_credentials(
        &self,
        details: &StateStoreDetails,
    ) -> Result<StateStoreCredentials, ProviderError>;
}

/// Collaborators shared by the provider adapters
#[derive(Clone)]
pub struct ProviderDeps {
    pub resolver: Arc<dyn TxtResolver>,
    pub object_store: Arc<dyn ObjectStore>,
    pub liveness: LivenessPolicy,
}

/// Build the adapter for a definition's provider section
pub fn build_provider(
    config: &ProviderConfig,
    region: &str,
    deps: ProviderDeps,
) -> Arc<dyn CloudProvider> {
    match config {
        ProviderConfig::Vultr { api_key } => {
            Arc::new(VultrProvider::new(api_key.clone(), region.to_string(), deps))
        }
        ProviderConfig::Digitalocean {
            token,
            spaces_key,
            spaces_secret,
        } => Arc::new(DigitalOceanProvider::new(
            token.clone(),
            StateStoreCredentials {
                access_key_id: spaces_key.clone(),
                secret_access_key: spaces_secret.clone(),
            },
            region.to_string(),
            deps,
        )),
    }
}

/// Shared body of `test_domain_liveness` for the adapters
pub(crate) async fn run_liveness(
    provider: &dyn CloudProvider,
    deps: &ProviderDeps,
    domain: &str,
) -> Result<bool, ProviderError> {
    let prober = LivenessProber::new(provider, deps.resolver.as_ref(), deps.liveness.clone());
    match prober.probe(domain, &CancellationToken::new()).await {
        Ok(()) => Ok(true),
        Err(LivenessError::DomainNotLive { .. }) => Ok(false),
        Err(e) => Err(ProviderError::Liveness(e.to_string())),
    }
}

// ============================================================================
// SBIO: I/O helper shared by the REST adapters
// ============================================================================

/// Bearer-authenticated JSON client for a provider REST API
#[derive(Clone)]
pub(crate) struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let req = self
            .client
            .get(self.url(path))
            .query(query)
            .bearer_auth(&self.token);
        Self::send(req, path).await
    }

    pub async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ProviderError> {
        let req = self
            .client
            .post(self.url(path))
            .json(body)
            .bearer_auth(&self.token);
        Self::send(req, path).await
    }

    async fn send<T: DeserializeOwned>(
        req: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, ProviderError> {
        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Http(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: text,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory provider with call counters and failure switches
    #[derive(Default)]
    pub struct MockProvider {
        pub records: Mutex<Vec<DnsRecord>>,
        pub fail_list_records: AtomicBool,
        pub fail_create_record: AtomicBool,
        pub fail_state_store: AtomicBool,
        pub list_calls: AtomicUsize,
        pub create_record_calls: AtomicUsize,
        pub state_store_calls: AtomicUsize,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_record(self, record: DnsRecord) -> Self {
            self.records.lock().unwrap().push(record);
            self
        }

        pub fn create_record_calls(&self) -> usize {
            self.create_record_calls.load(Ordering::SeqCst)
        }

        pub fn state_store_calls(&self) -> usize {
            self.state_store_calls.load(Ordering::SeqCst)
        }

        pub fn credentials() -> StateStoreCredentials {
            StateStoreCredentials {
                access_key_id: "mock-access".to_string(),
                secret_access_key: "mock-secret".to_string(),
            }
        }
    }

    #[async_trait]
    impl CloudProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn test_domain_liveness(&self, _domain: &str) -> Result<bool, ProviderError> {
            Ok(true)
        }

        async fn list_dns_records(&self, domain: &str) -> Result<Vec<DnsRecord>, ProviderError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list_records.load(Ordering::SeqCst) {
                return Err(ProviderError::Api {
                    status: 500,
                    message: format!("cannot list records for {}", domain),
                });
            }
            Ok(self.records.lock().unwrap().clone())
        }

        async fn create_dns_record(
            &self,
            _domain: &str,
            record: &DnsRecord,
        ) -> Result<DnsRecord, ProviderError> {
            let n = self.create_record_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create_record.load(Ordering::SeqCst) {
                return Err(ProviderError::Api {
                    status: 400,
                    message: "record rejected".to_string(),
                });
            }
            let mut created = record.clone();
            created.id = format!("rec-{}", n);
            self.records.lock().unwrap().push(created.clone());
            Ok(created)
        }

        async fn get_domain_info(&self, domain: &str) -> Result<String, ProviderError> {
            Ok(domain.to_string())
        }

        async fn list_domains(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec!["example.com".to_string()])
        }

        async fn list_regions(&self) -> Result<Vec<String>, ProviderError> {
            Ok(vec!["ewr".to_string()])
        }

        async fn list_instance_types(&self, _region: &str) -> Result<Vec<String>, ProviderError> {
            Ok(vec!["vc2-4c-8gb".to_string()])
        }

        async fn create_state_store(
            &self,
            bucket: &str,
        ) -> Result<(StateStoreCredentials, StateStoreDetails), ProviderError> {
            self.state_store_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_state_store.load(Ordering::SeqCst) {
                return Err(ProviderError::StateStoreNotReady(bucket.to_string()));
            }
            Ok((
                Self::credentials(),
                StateStoreDetails {
                    id: "os-mock".to_string(),
                    name: bucket.to_string(),
                    hostname: "mock.objects.local".to_string(),
                },
            ))
        }

        async fn state_store_credentials(
            &self,
            _details: &StateStoreDetails,
        ) -> Result<StateStoreCredentials, ProviderError> {
            Ok(Self::credentials())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_record_uses_type_key() {
        let record = DnsRecord::txt("clusterforge-liveness", "domain record propagated", 600);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "TXT");
        assert_eq!(value["ttl"], 600);
    }

    #[test]
    fn test_api_client_url_joining() {
        let client = ApiClient::new("https://api.vultr.com/v2/", "t");
        assert_eq!(client.url("/domains"), "https://api.vultr.com/v2/domains");
        let client = client.with_base_url("http://localhost:9000");
        assert_eq!(
            client.url("domains/example.com/records"),
            "http://localhost:9000/domains/example.com/records"
        );
    }
}
