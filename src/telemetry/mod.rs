//! Best-effort usage telemetry
//!
//! Events are sent fire-and-forget: `transmit` never blocks the caller and
//! delivery failures are only logged. `close` waits for in-flight sends.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::store::ClusterRecord;

pub const METRIC_MGMT_CLUSTER_INSTALL_COMPLETED: &str = "mgmt_cluster_install_completed";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Telemetry setup failed: {0}")]
    Setup(String),

    #[error("Telemetry send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEvent {
    pub event: String,
    pub properties: BTreeMap<String, String>,
}

impl TelemetryEvent {
    /// Event describing a cluster, without credentials or personal data
    pub fn for_record(event: &str, record: &ClusterRecord) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("cluster_id".to_string(), record.id.clone());
        properties.insert("cloud_provider".to_string(), record.cloud_provider.clone());
        properties.insert("cloud_region".to_string(), record.cloud_region.clone());
        properties.insert("git_provider".to_string(), record.git_provider.clone());
        properties.insert("domain_name".to_string(), record.domain_name.clone());
        properties.insert(
            "cli_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        Self {
            event: event.to_string(),
            properties,
        }
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Queue an event; must not block
    fn transmit(&self, event: TelemetryEvent);

    /// Wait for queued events to finish sending
    async fn close(&self);
}

/// Send `event` only when the cluster opted in
pub fn transmit(enabled: bool, sink: &dyn TelemetrySink, event: TelemetryEvent) {
    if !enabled {
        debug!("telemetry disabled, not sending {}", event.event);
        return;
    }
    sink.transmit(event);
}

/// Sink that drops everything
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    fn transmit(&self, event: TelemetryEvent) {
        debug!("telemetry not configured, dropping {}", event.event);
    }

    async fn close(&self) {}
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Stable anonymous id for this machine
pub fn anonymous_id(machine: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(machine.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackPayload<'a> {
    anonymous_id: &'a str,
    event: &'a str,
    properties: &'a BTreeMap<String, String>,
    timestamp: String,
}

// ============================================================================
// SBIO: I/O implementation (HTTP track endpoint)
// ============================================================================

pub struct HttpTelemetrySink {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    write_key: String,
    anonymous_id: String,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpTelemetrySink {
    pub fn new(endpoint: &str, write_key: String) -> Result<Self, TelemetryError> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| TelemetryError::Setup(format!("invalid endpoint {}: {}", endpoint, e)))?;
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| TelemetryError::Setup(e.to_string()))?;
        let machine = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            client,
            endpoint,
            write_key,
            anonymous_id: anonymous_id(&machine),
            pending: Mutex::new(Vec::new()),
        })
    }

    async fn send(
        client: reqwest::Client,
        endpoint: reqwest::Url,
        write_key: String,
        anonymous_id: String,
        event: TelemetryEvent,
    ) -> Result<(), TelemetryError> {
        let payload = TrackPayload {
            anonymous_id: &anonymous_id,
            event: &event.event,
            properties: &event.properties,
            timestamp: Utc::now().to_rfc3339(),
        };
        let response = client
            .post(endpoint)
            .basic_auth(write_key, Some(""))
            .json(&payload)
            .send()
            .await
            .map_err(|e| TelemetryError::Send(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TelemetryError::Send(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for HttpTelemetrySink {
    fn transmit(&self, event: TelemetryEvent) {
        let name = event.event.clone();
        let handle = tokio::spawn(Self::send_logged(
            self.client.clone(),
            self.endpoint.clone(),
            self.write_key.clone(),
            self.anonymous_id.clone(),
            event,
            name,
        ));
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(handle);
        }
    }

    async fn close(&self) {
        let handles: Vec<JoinHandle<()>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        futures::future::join_all(handles).await;
    }
}

impl HttpTelemetrySink {
    async fn send_logged(
        client: reqwest::Client,
        endpoint: reqwest::Url,
        write_key: String,
        anonymous_id: String,
        event: TelemetryEvent,
        name: String,
    ) {
        match Self::send(client, endpoint, write_key, anonymous_id, event).await {
            Ok(()) => debug!("telemetry event {} sent", name),
            Err(e) => warn!("telemetry event {} not sent: {}", name, e),
        }
    }
}

/// Build the sink described by the settings; telemetry without a write key
/// or with a broken setup degrades to [`NoopSink`]
pub fn build_sink(settings: &Settings) -> Arc<dyn TelemetrySink> {
    let Some(write_key) = settings.telemetry_write_key.clone() else {
        debug!("no telemetry write key configured");
        return Arc::new(NoopSink);
    };
    match HttpTelemetrySink::new(&settings.telemetry_endpoint, write_key) {
        Ok(sink) => {
            info!("telemetry enabled");
            Arc::new(sink)
        }
        Err(e) => {
            warn!("{}", e);
            Arc::new(NoopSink)
        }
    }
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<TelemetryEvent>>,
        pub closed: AtomicBool,
    }

    impl RecordingSink {
        pub fn event_names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.event.clone())
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        fn transmit(&self, event: TelemetryEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
