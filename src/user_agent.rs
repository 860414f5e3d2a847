//! Shared User-Agent strings for transfer and mirror probe traffic.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/assetfetch";

/// Default User-Agent for file transfers.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("assetfetch/{version} (+{PROJECT_UA_URL})")
}

/// Default User-Agent for mirror latency probes and metadata fetches.
#[must_use]
pub(crate) fn default_probe_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("assetfetch/{version} (source-probe; +{PROJECT_UA_URL})")
}
