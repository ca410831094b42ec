//! DNS resolution used to confirm record propagation

pub mod liveness;

pub use liveness::{LivenessError, LivenessPolicy, LivenessProber};

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("TXT lookup for {name} failed: {message}")]
    Lookup { name: String, message: String },
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// Resolve the TXT values published at `fqdn`
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, DnsError>;
}

// ============================================================================
// SBIO: I/O implementation (hickory resolver)
// ============================================================================

/// System resolver with a fixed backup nameserver
pub struct SystemResolver {
    system: Option<TokioAsyncResolver>,
    backup: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new(backup_nameserver: IpAddr) -> Self {
        let system = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                warn!("system resolver unavailable, using backup only: {}", e);
                None
            }
        };

        let backup_config = ResolverConfig::from_parts(
            None,
            vec![],
            NameServerConfigGroup::from_ips_clear(&[backup_nameserver], 53, true),
        );
        let backup = TokioAsyncResolver::tokio(backup_config, ResolverOpts::default());

        Self { system, backup }
    }

    async fn lookup_with(
        resolver: &TokioAsyncResolver,
        fqdn: &str,
    ) -> Result<Vec<String>, DnsError> {
        let lookup = resolver.txt_lookup(fqdn).await.map_err(|e| DnsError::Lookup {
            name: fqdn.to_string(),
            message: e.to_string(),
        })?;
        Ok(lookup.iter().map(|txt| txt.to_string()).collect())
    }
}

#[async_trait]
impl TxtResolver for SystemResolver {
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, DnsError> {
        if let Some(system) = &self.system {
            match Self::lookup_with(system, fqdn).await {
                Ok(values) if !values.is_empty() => return Ok(values),
                Ok(_) => debug!("system resolver returned no TXT values for {}", fqdn),
                Err(e) => debug!("{}; retrying with backup resolver", e),
            }
        }
        Self::lookup_with(&self.backup, fqdn).await
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================
