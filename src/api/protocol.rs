//! Wire types for the SFU HTTP API
//!
//! All bodies are JSON with camelCase keys. A non-empty `errorCode` at any
//! level indicates failure and propagates as [`crate::Error::Sfu`].

use serde::{Deserialize, Serialize};

/// SDP payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP description as exchanged with the SFU
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// "offer" or "answer"
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// Raw SDP text, treated opaquely by this crate
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Which side of the peer connection a track lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackLocation {
    Local,
    Remote,
}

/// Simulcast layer preference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulcastConfig {
    /// RID of the preferred layer
    pub preferred_rid: String,
}

/// Descriptor identifying a track to the SFU
///
/// The same shape is used to announce local tracks, to request remote ones
/// and as the public handle callers exchange out of band. A `mid` is only
/// meaningful within a single peer connection and is stripped before any
/// metadata leaves this crate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<TrackLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulcast: Option<SimulcastConfig>,
}

impl TrackMetadata {
    /// Descriptor for a remote track published under `track_name` in the
    /// session `session_id`
    pub fn remote(track_name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            location: Some(TrackLocation::Remote),
            track_name: Some(track_name.into()),
            session_id: Some(session_id.into()),
            mid: None,
            simulcast: None,
        }
    }

    /// Copy with the session-local `mid` removed
    pub fn without_mid(mut self) -> Self {
        self.mid = None;
        self
    }
}

/// Response to `POST /sessions/new`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    pub session_id: String,
}

/// Response to `GET /generate-ice-servers`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServersResponse {
    pub ice_servers: Vec<crate::config::IceServerConfig>,
}

/// Request body for `POST /sessions/{id}/tracks/new`
///
/// Push requests carry the local offer; pull requests carry descriptors
/// only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_description: Option<SessionDescription>,
    pub tracks: Vec<TrackMetadata>,
}

/// Per-track entry in a tracks/new response
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEntry {
    #[serde(default)]
    pub track_name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TrackEntry {
    /// Promote a per-track SFU error into a crate error
    pub fn check(&self) -> crate::Result<()> {
        match &self.error_code {
            Some(code) if !code.is_empty() => Err(crate::Error::Sfu {
                code: code.clone(),
                description: self
                    .error_description
                    .clone()
                    .unwrap_or_else(|| "unspecified track error".to_string()),
            }),
            _ => Ok(()),
        }
    }
}

/// Response to `POST /sessions/{id}/tracks/new`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TracksResponse {
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub tracks: Option<Vec<TrackEntry>>,
    #[serde(default)]
    pub requires_immediate_renegotiation: Option<bool>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Request body for `PUT /sessions/{id}/renegotiate`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiateRequest {
    pub session_description: SessionDescription,
}

/// Response to `PUT /sessions/{id}/renegotiate`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiateResponse {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Request body for `PUT /sessions/{id}/tracks/update`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTracksRequest {
    pub tracks: Vec<TrackMetadata>,
}

/// Track reference in a close request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTrackItem {
    pub mid: String,
}

/// Request body for `PUT /sessions/{id}/tracks/close`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTracksRequest {
    pub session_description: SessionDescription,
    pub tracks: Vec<CloseTrackItem>,
    pub force: bool,
}

/// Response to `PUT /sessions/{id}/tracks/close`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseTracksResponse {
    #[serde(default)]
    pub session_description: Option<SessionDescription>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Top-level error extraction shared by every SFU response shape
pub(crate) trait SfuResponseBody {
    fn error(&self) -> Option<(&str, Option<&str>)>;

    fn check(&self) -> crate::Result<()> {
        match self.error() {
            Some((code, description)) if !code.is_empty() => Err(crate::Error::Sfu {
                code: code.to_string(),
                description: description
                    .unwrap_or("unspecified SFU error")
                    .to_string(),
            }),
            _ => Ok(()),
        }
    }
}

macro_rules! impl_sfu_body {
    ($($ty:ty),+) => {
        $(impl SfuResponseBody for $ty {
            fn error(&self) -> Option<(&str, Option<&str>)> {
                self.error_code
                    .as_deref()
                    .map(|code| (code, self.error_description.as_deref()))
            }
        })+
    };
}

impl_sfu_body!(TracksResponse, RenegotiateResponse, CloseTracksResponse);
