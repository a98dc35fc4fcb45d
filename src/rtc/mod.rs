//! Platform WebRTC seam
//!
//! The embedder supplies the peer-connection implementation; this module
//! defines the slice of the W3C surface the engines need, plus helpers for
//! the bounded waits that sit between signaling steps. The default native
//! implementation over webrtc-rs lives in [`webrtc`](self::webrtc).

pub mod webrtc;

use crate::api::protocol::SessionDescription;
use crate::config::IceServerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Signaling state of the offer/answer machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Event surfaced by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connection(ConnectionState),
    Ice(IceConnectionState),
    Signaling(SignalingState),
    /// A remote transceiver surfaced with the given MID
    TrackAdded { mid: String },
}

/// Per-layer send encoding for a pushed track
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    /// Simulcast restriction identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    /// Bitrate ceiling in bits per second
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate_bps: Option<u64>,
    /// Downscale factor relative to the source resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
}

/// Local media source attached to a sendonly transceiver
///
/// Opaque to the engines; the platform adapter downcasts to its concrete
/// track type.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> String;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Remote media delivered by a pulled transceiver
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// One media pipe on the peer connection, owned by exactly one push or pull
/// subscription
#[async_trait]
pub trait TransceiverHandle: Send + Sync {
    /// SDP media-line identifier; `None` until local negotiation assigns one
    fn mid(&self) -> Option<String>;

    /// Swap the outgoing track without renegotiating
    async fn replace_track(&self, track: Arc<dyn LocalTrack>) -> Result<()>;

    /// Apply updated send encodings to the live sender
    async fn set_encodings(&self, encodings: &[RtpEncoding]) -> Result<()>;

    /// Cumulative outbound RTP bytes attributable to this sender
    async fn outbound_bytes_sent(&self) -> Result<u64>;

    /// The received track, once media has arrived
    async fn remote_track(&self) -> Option<Arc<dyn RemoteTrack>>;

    async fn stop(&self) -> Result<()>;
}

/// The peer connection surface the engines drive
#[async_trait]
pub trait PeerHandle: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;
    fn connection_state(&self) -> ConnectionState;
    fn is_closed(&self) -> bool;

    /// Subscribe to state-change and track events
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    /// Add a sendonly transceiver carrying `track` with the given initial
    /// encodings
    async fn add_send_transceiver(
        &self,
        track: Arc<dyn LocalTrack>,
        encodings: &[RtpEncoding],
    ) -> Result<Arc<dyn TransceiverHandle>>;

    /// Look up a transceiver by its negotiated MID
    async fn transceiver_by_mid(&self, mid: &str) -> Option<Arc<dyn TransceiverHandle>>;

    async fn close(&self);
}

/// Factory for peer connections, supplied by the embedder
#[async_trait]
pub trait RtcApi: Send + Sync {
    /// Create a peer connection using the given ICE servers; implementations
    /// bundle all media onto a single transport
    async fn create_peer(&self, ice_servers: &[IceServerConfig]) -> Result<Arc<dyn PeerHandle>>;
}

/// Wait until the peer's signaling state settles back to stable
///
/// Subscribes before sampling so a transition between the two cannot be
/// missed.
pub async fn wait_for_stable(peer: &dyn PeerHandle, timeout: Duration) -> Result<()> {
    let mut events = peer.subscribe();
    if peer.signaling_state() == SignalingState::Stable {
        return Ok(());
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "signaling state not stable within {}ms",
                    timeout.as_millis()
                ))
            })?;
        match event {
            Ok(PeerEvent::Signaling(SignalingState::Stable)) => return Ok(()),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                // events were dropped; re-sample the live state
                if peer.signaling_state() == SignalingState::Stable {
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Rtc("peer event channel closed".to_string()));
            }
        }
    }
}

/// Wait for a transceiver with the given MID to surface, bounded by
/// `timeout`
pub async fn resolve_transceiver_by_mid(
    peer: &dyn PeerHandle,
    mid: &str,
    timeout: Duration,
) -> Result<Arc<dyn TransceiverHandle>> {
    let mut events = peer.subscribe();
    if let Some(transceiver) = peer.transceiver_by_mid(mid).await {
        return Ok(transceiver);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "transceiver for mid {mid} did not surface within {}ms",
                    timeout.as_millis()
                ))
            })?;
        match event {
            Ok(PeerEvent::TrackAdded { mid: added }) if added == mid => {
                if let Some(transceiver) = peer.transceiver_by_mid(mid).await {
                    return Ok(transceiver);
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if let Some(transceiver) = peer.transceiver_by_mid(mid).await {
                    return Ok(transceiver);
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                return Err(Error::Rtc("peer event channel closed".to_string()));
            }
        }
    }
}

/// Poll the sender until outbound RTP bytes have been observed
///
/// Polling starts at 1ms and backs off exponentially to a 100ms cap,
/// bounded overall by `timeout`. This is what guarantees that metadata
/// emitted for a pushed track names media a subscriber will actually
/// receive.
pub async fn wait_for_outbound_rtp(
    transceiver: &dyn TransceiverHandle,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = Duration::from_millis(1);
    let cap = Duration::from_millis(100);

    loop {
        if transceiver.outbound_bytes_sent().await? > 0 {
            return Ok(());
        }
        if tokio::time::Instant::now() + delay > deadline {
            return Err(Error::Timeout(format!(
                "no outbound RTP within {}ms",
                timeout.as_millis()
            )));
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(cap);
    }
}
