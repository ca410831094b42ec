//! Apex content probe
//!
//! Informational only: a domain already serving content at its apex is
//! worth a warning before we start creating records under it.

use std::time::Duration;

use tracing::{info, warn};

pub const APEX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns true when either `http://<domain>` or `https://<domain>` answers
pub async fn probe_apex_content(domain: &str) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(APEX_PROBE_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!("could not build HTTP client for apex probe: {}", e);
            return false;
        }
    };

    let mut exists = false;
    for scheme in ["http", "https"] {
        let url = format!("{}://{}", scheme, domain);
        match client.get(&url).send().await {
            Ok(_) => {
                info!("domain {} has apex content", url);
                exists = true;
            }
            Err(_) => warn!("domain {} has no apex content", url),
        }
    }
    exists
}
