//! Configuration types for the partytracks client

use crate::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ICE server entry handed to the peer connection
///
/// Mirrors the JSON shape returned by the SFU's ICE-server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServerConfig {
    /// STUN/TURN URLs
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Main configuration for the partytracks client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyTracksConfig {
    /// Origin of the SFU API (e.g. "https://media.example.com")
    pub base_url: String,

    /// Path prefix prepended to every SFU call (default: "/partytracks")
    pub prefix: String,

    /// URL-encoded query string appended to every SFU call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_extra_params: Option<String>,

    /// Headers appended to every SFU call
    #[serde(default)]
    pub headers: Vec<(String, String)>,

    /// ICE servers to use instead of fetching them from the SFU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServerConfig>>,

    /// Capacity of the request/response history ring (default: 100)
    pub max_api_history: usize,

    /// Session lifecycle tuning
    #[serde(default)]
    pub session: SessionPolicy,
}

impl Default for PartyTracksConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            prefix: "/partytracks".to_string(),
            api_extra_params: None,
            headers: Vec::new(),
            ice_servers: None,
            max_api_history: 100,
            session: SessionPolicy::default(),
        }
    }
}

impl PartyTracksConfig {
    /// Create a configuration for the given SFU origin, with defaults for
    /// everything else
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration, returning a descriptive error for the
    /// first problem found
    pub fn validate(&self) -> crate::Result<()> {
        if self.base_url.is_empty() {
            return Err(crate::Error::InvalidConfig(
                "base_url cannot be empty".to_string(),
            ));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(crate::Error::InvalidConfig(format!(
                "base_url must start with http:// or https://, got: {}",
                self.base_url
            )));
        }
        if !self.prefix.starts_with('/') {
            return Err(crate::Error::InvalidConfig(format!(
                "prefix must start with '/', got: {}",
                self.prefix
            )));
        }
        if let Some(params) = &self.api_extra_params {
            if params.starts_with('?') || params.starts_with('&') {
                return Err(crate::Error::InvalidConfig(
                    "api_extra_params must not include a leading '?' or '&'".to_string(),
                ));
            }
        }
        if self.session.batch_capacity == 0 {
            return Err(crate::Error::InvalidConfig(
                "session.batch_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tuning knobs for session creation, monitoring and per-track wiring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPolicy {
    /// Backoff applied when a session build fails or a live session dies
    pub rebuild_backoff: BackoffPolicy,

    /// Backoff applied when re-wiring an individual track fails
    pub track_backoff: BackoffPolicy,

    /// Grace period after ICE reports `disconnected` before the session is
    /// declared dead (default: 7000ms)
    pub ice_probation_ms: u64,

    /// Bound on waiting for the signaling state to settle back to stable
    /// after an offer/answer exchange (default: 5000ms)
    pub signaling_timeout_ms: u64,

    /// Bound on waiting for a pulled track's transceiver to surface by MID
    /// (default: 5000ms)
    pub track_resolve_timeout_ms: u64,

    /// Bound on waiting for first outbound RTP bytes on a pushed track
    /// (default: 10000ms)
    pub rtp_probe_timeout_ms: u64,

    /// Maximum number of track operations coalesced into one signaling
    /// exchange (default: 32)
    pub batch_capacity: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            rebuild_backoff: BackoffPolicy::default(),
            track_backoff: BackoffPolicy::default(),
            ice_probation_ms: 7_000,
            signaling_timeout_ms: 5_000,
            track_resolve_timeout_ms: 5_000,
            rtp_probe_timeout_ms: 10_000,
            batch_capacity: 32,
        }
    }
}

impl SessionPolicy {
    pub fn ice_probation(&self) -> Duration {
        Duration::from_millis(self.ice_probation_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn track_resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.track_resolve_timeout_ms)
    }

    pub fn rtp_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.rtp_probe_timeout_ms)
    }
}
