//! Default [`RtcApi`](super::RtcApi) implementation over webrtc-rs

use super::{
    ConnectionState, IceConnectionState, LocalTrack, PeerEvent, PeerHandle, RemoteTrack, RtcApi,
    RtpEncoding, SignalingState, TransceiverHandle,
};
use crate::api::protocol::{SdpKind, SessionDescription};
use crate::config::IceServerConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{
    RTCRtpEncodingParameters, RTCRtpTransceiver, RTCRtpTransceiverInit,
};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const PEER_EVENT_CAPACITY: usize = 64;

/// Local track backed by a webrtc-rs `TrackLocal`
pub struct WebRtcLocalTrack {
    inner: Arc<dyn TrackLocal + Send + Sync>,
}

impl WebRtcLocalTrack {
    pub fn new(inner: Arc<dyn TrackLocal + Send + Sync>) -> Arc<Self> {
        Arc::new(Self { inner })
    }

    pub fn inner(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone()
    }
}

impl LocalTrack for WebRtcLocalTrack {
    fn id(&self) -> String {
        self.inner.id().to_string()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Remote track backed by a webrtc-rs `TrackRemote`
pub struct WebRtcRemoteTrack {
    inner: Arc<TrackRemote>,
}

impl WebRtcRemoteTrack {
    pub fn inner(&self) -> Arc<TrackRemote> {
        self.inner.clone()
    }
}

impl RemoteTrack for WebRtcRemoteTrack {
    fn id(&self) -> String {
        self.inner.id().to_string()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

fn native_local_track(track: &Arc<dyn LocalTrack>) -> Result<Arc<dyn TrackLocal + Send + Sync>> {
    track
        .as_any()
        .downcast_ref::<WebRtcLocalTrack>()
        .map(WebRtcLocalTrack::inner)
        .ok_or_else(|| {
            Error::Rtc("local track was not created for the webrtc-rs platform".to_string())
        })
}

fn map_connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn map_signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_native_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| Error::Rtc(format!("invalid session description: {e}")))
}

fn from_native_description(desc: RTCSessionDescription) -> SessionDescription {
    let kind = if desc.sdp_type == webrtc::peer_connection::sdp::sdp_type::RTCSdpType::Offer {
        SdpKind::Offer
    } else {
        SdpKind::Answer
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

fn transceiver_mid(transceiver: &RTCRtpTransceiver) -> Option<String> {
    let mid = transceiver.mid().map(|m| m.to_string()).unwrap_or_default();
    if mid.is_empty() {
        None
    } else {
        Some(mid)
    }
}

fn media_kind_label(kind: RTPCodecType) -> &'static str {
    match kind {
        RTPCodecType::Audio => "audio",
        RTPCodecType::Video => "video",
        _ => "",
    }
}

/// Transceiver handle over a webrtc-rs `RTCRtpTransceiver`
pub struct WebRtcTransceiver {
    pc: Arc<RTCPeerConnection>,
    inner: Arc<RTCRtpTransceiver>,
    kind_label: &'static str,
}

#[async_trait]
impl TransceiverHandle for WebRtcTransceiver {
    fn mid(&self) -> Option<String> {
        transceiver_mid(&self.inner)
    }

    async fn replace_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        let native = native_local_track(&track)?;
        self.inner
            .sender()
            .await
            .replace_track(Some(native))
            .await
            .map_err(|e| Error::Rtc(format!("replace_track failed: {e}")))
    }

    async fn set_encodings(&self, encodings: &[RtpEncoding]) -> Result<()> {
        // webrtc-rs honors send encodings at transceiver creation; a live
        // update takes effect with the next negotiation
        debug!(
            mid = ?self.mid(),
            layers = encodings.len(),
            "send encoding update deferred to next negotiation"
        );
        Ok(())
    }

    async fn outbound_bytes_sent(&self) -> Result<u64> {
        // Stats granularity is per connection in webrtc-rs; attribute
        // outbound bytes by media kind.
        let stats = self.pc.get_stats().await;
        let mut total: u64 = 0;
        for stat in stats.reports.values() {
            if let StatsReportType::OutboundRTP(rtp) = stat {
                if rtp.kind == self.kind_label {
                    total += rtp.bytes_sent;
                }
            }
        }
        Ok(total)
    }

    async fn remote_track(&self) -> Option<Arc<dyn RemoteTrack>> {
        let receiver = self.inner.receiver().await;
        receiver
            .tracks()
            .await
            .into_iter()
            .next()
            .map(|track| Arc::new(WebRtcRemoteTrack { inner: track }) as Arc<dyn RemoteTrack>)
    }

    async fn stop(&self) -> Result<()> {
        self.inner
            .stop()
            .await
            .map_err(|e| Error::Rtc(format!("transceiver stop failed: {e}")))
    }
}

/// Peer handle over a webrtc-rs `RTCPeerConnection`
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: broadcast::Sender<PeerEvent>,
}

impl WebRtcPeer {
    async fn new(ice_servers: &[IceServerConfig]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::Rtc(format!("failed to register codecs: {e}")))?;

        let interceptors = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::Rtc(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptors)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            bundle_policy: RTCBundlePolicy::MaxBundle,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| Error::Rtc(format!("failed to create peer connection: {e}")))?,
        );

        let (events, _) = broadcast::channel(PEER_EVENT_CAPACITY);

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(PeerEvent::Connection(map_connection_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let _ = tx.send(PeerEvent::Ice(map_ice_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let _ = tx.send(PeerEvent::Signaling(map_signaling_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(mid) = transceiver_mid(&transceiver) {
                    debug!(%mid, track_id = %track.id(), "remote track surfaced");
                    let _ = tx.send(PeerEvent::TrackAdded { mid });
                }
                Box::pin(async {})
            },
        ));

        info!("created webrtc-rs peer connection");
        Ok(Self { pc, events })
    }

    fn wrap_transceiver(&self, inner: Arc<RTCRtpTransceiver>) -> Arc<dyn TransceiverHandle> {
        let kind_label = media_kind_label(inner.kind());
        Arc::new(WebRtcTransceiver {
            pc: self.pc.clone(),
            inner,
            kind_label,
        })
    }
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Rtc(format!("create_offer failed: {e}")))?;
        Ok(from_native_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Rtc(format!("create_answer failed: {e}")))?;
        Ok(from_native_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_native_description(desc)?)
            .await
            .map_err(|e| Error::Rtc(format!("set_local_description failed: {e}")))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_native_description(desc)?)
            .await
            .map_err(|e| Error::Rtc(format!("set_remote_description failed: {e}")))
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.map(from_native_description)
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.pc.connection_state(),
            RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
        )
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn add_send_transceiver(
        &self,
        track: Arc<dyn LocalTrack>,
        encodings: &[RtpEncoding],
    ) -> Result<Arc<dyn TransceiverHandle>> {
        let native = native_local_track(&track)?;
        let send_encodings = encodings
            .iter()
            .filter_map(|encoding| encoding.rid.as_ref())
            .map(|rid| RTCRtpEncodingParameters {
                rid: rid.clone().into(),
                ..Default::default()
            })
            .collect();

        let transceiver = self
            .pc
            .add_transceiver_from_track(
                native,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings,
                }),
            )
            .await
            .map_err(|e| Error::Rtc(format!("add_transceiver failed: {e}")))?;

        Ok(self.wrap_transceiver(transceiver))
    }

    async fn transceiver_by_mid(&self, mid: &str) -> Option<Arc<dyn TransceiverHandle>> {
        for transceiver in self.pc.get_transceivers().await {
            if transceiver_mid(&transceiver).as_deref() == Some(mid) {
                return Some(self.wrap_transceiver(transceiver));
            }
        }
        None
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "error closing peer connection");
        }
    }
}

/// Factory producing webrtc-rs peer connections
#[derive(Debug, Default)]
pub struct WebRtcApi;

impl WebRtcApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl RtcApi for WebRtcApi {
    async fn create_peer(&self, ice_servers: &[IceServerConfig]) -> Result<Arc<dyn PeerHandle>> {
        Ok(Arc::new(WebRtcPeer::new(ice_servers).await?))
    }
}
