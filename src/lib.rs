//! Reactive track multiplexing over one SFU-backed peer connection
//!
//! partytracks maintains a single WebRTC peer connection to a Selective
//! Forwarding Unit and multiplexes any number of push and pull track
//! subscriptions onto it. Concurrent subscriptions created in the same
//! scheduler turn coalesce into one signaling round-trip; all SDP exchanges
//! serialize through a per-session FIFO scheduler; connection loss rebuilds
//! the session transparently and re-executes every subscription against the
//! replacement.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  PartyTracks                                             │
//! │  ├─ SessionCoordinator (peer connection + session id)    │
//! │  │   └─ rebuild on ICE/connection failure                │
//! │  ├─ PushTrackEngine ─┐                                   │
//! │  ├─ PullTrackEngine ─┼─ BulkDispatcher (per operation)   │
//! │  └─ close batching  ─┘        ↓                          │
//! │                        FifoScheduler (per session)       │
//! │                               ↓                          │
//! │                 SfuApi (caller-supplied fetch)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The WebRTC platform and the HTTP fetch are collaborator seams
//! ([`rtc::RtcApi`], [`api::http::HttpClient`]); native defaults over
//! webrtc-rs and reqwest are provided.
//!
//! # Example
//!
//! ```no_run
//! use partytracks::{PartyTracks, PartyTracksConfig};
//! use tokio::sync::watch;
//!
//! # async fn example() -> partytracks::Result<()> {
//! let client = PartyTracks::with_native_defaults(
//!     PartyTracksConfig::new("https://media.example.com"),
//! )?;
//!
//! // push: the watch channel is the live source of outgoing media
//! let (_track_tx, track_rx) = watch::channel(None);
//! let pushed = client.push(track_rx, Default::default());
//!
//! // await the published metadata and hand it to another participant
//! let mut metadata = pushed.metadata();
//! metadata.changed().await.ok();
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod rtc;
pub mod scheduler;
pub mod session;
pub mod socket;
pub mod track;

use api::http::HttpClient;
use api::SfuApi;
use rtc::RtcApi;
use std::sync::Arc;
use tokio::sync::watch;
use track::{EngineShared, PullTrackEngine, PushTrackEngine};

pub use api::protocol::{SimulcastConfig, TrackLocation, TrackMetadata};
pub use config::{IceServerConfig, PartyTracksConfig, SessionPolicy};
pub use error::{Error, Result};
pub use history::HistoryEntry;
pub use rtc::RtpEncoding;
pub use session::{SessionCoordinator, SessionStream};
pub use socket::{ReconnectingSocket, SocketBinding, SocketOptions};
pub use track::{PullOptions, PulledTrack, PushOptions, PushedTrack};

/// Top-level client: one coordinator plus the push/pull engines
pub struct PartyTracks {
    coordinator: SessionCoordinator,
    push_engine: PushTrackEngine,
    pull_engine: PullTrackEngine,
    api: Arc<SfuApi>,
}

impl PartyTracks {
    /// Build a client around caller-supplied collaborators
    pub fn new(
        config: PartyTracksConfig,
        http: Arc<dyn HttpClient>,
        rtc: Arc<dyn RtcApi>,
    ) -> Result<Self> {
        config.validate()?;

        let api = Arc::new(SfuApi::new(http, &config));
        let coordinator = SessionCoordinator::new(
            api.clone(),
            rtc,
            config.ice_servers.clone(),
            config.session.clone(),
        );
        let shared = Arc::new(EngineShared {
            api: api.clone(),
            coordinator: coordinator.clone(),
            policy: config.session.clone(),
        });

        Ok(Self {
            coordinator,
            push_engine: PushTrackEngine::new(shared.clone()),
            pull_engine: PullTrackEngine::new(shared),
            api,
        })
    }

    /// Build a client on the native defaults: reqwest for fetch, webrtc-rs
    /// for the peer connection
    pub fn with_native_defaults(config: PartyTracksConfig) -> Result<Self> {
        let http = Arc::new(api::http::ReqwestClient::new()?);
        let rtc = rtc::webrtc::WebRtcApi::new();
        Self::new(config, http, rtc)
    }

    /// Subscribe to the shared current-session stream
    ///
    /// The first live subscription (including any push or pull) creates the
    /// session; when the last one is dropped the peer connection closes.
    pub fn sessions(&self) -> SessionStream {
        self.coordinator.sessions()
    }

    /// Publish a local track; see [`track::PushTrackEngine::push`]
    pub fn push(
        &self,
        source: watch::Receiver<Option<Arc<dyn rtc::LocalTrack>>>,
        options: PushOptions,
    ) -> PushedTrack {
        self.push_engine.push(source, options)
    }

    /// Subscribe to a remote track; see [`track::PullTrackEngine::pull`]
    pub fn pull(
        &self,
        descriptor: watch::Receiver<Option<TrackMetadata>>,
        options: PullOptions,
    ) -> PulledTrack {
        self.pull_engine.pull(descriptor, options)
    }

    /// Snapshot of the request/response history ring
    pub fn api_history(&self) -> Vec<HistoryEntry> {
        self.api.history()
    }
}

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = PartyTracks::with_native_defaults(PartyTracksConfig::default());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
