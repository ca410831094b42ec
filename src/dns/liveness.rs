//! Domain liveness probe
//!
//! Confirms that records created through the provider API are visible to
//! public resolvers. A throwaway TXT record is created under the domain and
//! resolved until it appears or the attempt budget runs out. An existing
//! marker short-circuits the probe so retries are cheap.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::TxtResolver;
use crate::config::Settings;
use crate::provider::{CloudProvider, DnsRecord, ProviderError};

pub const LIVENESS_RECORD_NAME: &str = "clusterforge-liveness";
pub const LIVENESS_RECORD_VALUE: &str = "domain record propagated";
pub const LIVENESS_RECORD_TTL: u32 = 600;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("Failed to list DNS records for {domain}: {source}")]
    ExternalCallFailed {
        domain: String,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to create liveness record for {domain}: {source}")]
    DnsRecordCreateFailed {
        domain: String,
        #[source]
        source: ProviderError,
    },

    #[error("Domain {domain} did not resolve after {attempts} attempts")]
    DomainNotLive { domain: String, attempts: u32 },

    #[error("Liveness probe cancelled")]
    Cancelled,
}

/// Attempt budget of the probe
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::config::settings::DEFAULT_LIVENESS_ATTEMPTS,
            interval: Duration::from_secs(crate::config::settings::DEFAULT_LIVENESS_INTERVAL_SECS),
        }
    }
}

impl LivenessPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            attempts: settings.liveness_attempts,
            interval: settings.liveness_interval(),
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Name the marker resolves under
pub fn liveness_fqdn(domain: &str) -> String {
    format!("{}.{}", LIVENESS_RECORD_NAME, domain)
}

/// True when the provider already holds our TXT marker
pub fn has_liveness_record(records: &[DnsRecord], domain: &str) -> bool {
    let fqdn = liveness_fqdn(domain);
    records.iter().any(|r| {
        r.record_type.eq_ignore_ascii_case("TXT")
            && (r.name == LIVENESS_RECORD_NAME || r.name.trim_end_matches('.') == fqdn)
    })
}

// ============================================================================
// Probe
// ============================================================================

pub struct LivenessProber<'a> {
    provider: &'a dyn CloudProvider,
    resolver: &'a dyn TxtResolver,
    policy: LivenessPolicy,
}

impl<'a> LivenessProber<'a> {
    pub fn new(
        provider: &'a dyn CloudProvider,
        resolver: &'a dyn TxtResolver,
        policy: LivenessPolicy,
    ) -> Self {
        Self {
            provider,
            resolver,
            policy,
        }
    }

    /// Create the marker if needed and wait for it to resolve
    pub async fn probe(&self, domain: &str, cancel: &CancellationToken) -> Result<(), LivenessError> {
        info!(domain = %domain, "checking for existing liveness record");

        let records = self
            .provider
            .list_dns_records(domain)
            .await
            .map_err(|source| LivenessError::ExternalCallFailed {
                domain: domain.to_string(),
                source,
            })?;

        if has_liveness_record(&records, domain) {
            info!(domain = %domain, "liveness record already present");
            return Ok(());
        }

        let marker = DnsRecord::txt(LIVENESS_RECORD_NAME, LIVENESS_RECORD_VALUE, LIVENESS_RECORD_TTL);
        self.provider
            .create_dns_record(domain, &marker)
            .await
            .map_err(|source| {
                warn!(domain = %domain, "liveness record rejected: {}", source);
                LivenessError::DnsRecordCreateFailed {
                    domain: domain.to_string(),
                    source,
                }
            })?;
        info!(domain = %domain, "domain record created");

        let fqdn = liveness_fqdn(domain);
        for attempt in 1..=self.policy.attempts {
            if cancel.is_cancelled() {
                return Err(LivenessError::Cancelled);
            }

            match self.resolver.lookup_txt(&fqdn).await {
                Ok(values) if !values.is_empty() => {
                    for value in &values {
                        info!("{} TXT record value: {}", fqdn, value);
                    }
                    return Ok(());
                }
                Ok(_) => warn!(
                    attempt,
                    "no TXT values at {} yet, waiting {}s",
                    fqdn,
                    self.policy.interval.as_secs()
                ),
                Err(e) => warn!(
                    attempt,
                    "could not resolve {}, waiting {}s: {}",
                    fqdn,
                    self.policy.interval.as_secs(),
                    e
                ),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(LivenessError::Cancelled),
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
        }

        error!(
            domain = %domain,
            "unable to resolve domain dns record. please check your domain registrar and nameserver configuration"
        );
        Err(LivenessError::DomainNotLive {
            domain: domain.to_string(),
            attempts: self.policy.attempts,
        })
    }
}
