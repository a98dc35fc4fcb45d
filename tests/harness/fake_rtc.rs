//! In-memory WebRTC platform with controllable state

use async_trait::async_trait;
use parking_lot::Mutex;
use partytracks::api::protocol::{SdpKind, SessionDescription};
use partytracks::config::IceServerConfig;
use partytracks::rtc::{
    ConnectionState, IceConnectionState, LocalTrack, PeerEvent, PeerHandle, RemoteTrack, RtcApi,
    RtpEncoding, SignalingState, TransceiverHandle,
};
use partytracks::Result;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Simple local track carrying only an id
pub struct FakeLocalTrack {
    id: String,
}

impl LocalTrack for FakeLocalTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Make a fake local track
pub fn fake_track(id: &str) -> Arc<dyn LocalTrack> {
    Arc::new(FakeLocalTrack { id: id.to_string() })
}

/// Simple remote track carrying only an id
pub struct FakeRemoteTrack {
    id: String,
}

impl RemoteTrack for FakeRemoteTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Controllable transceiver
pub struct FakeTransceiver {
    mid: Mutex<Option<String>>,
    sending: bool,
    track_id: Mutex<Option<String>>,
    encodings: Mutex<Vec<RtpEncoding>>,
    remote: Mutex<Option<Arc<dyn RemoteTrack>>>,
    stopped: AtomicBool,
    /// Number of stats polls served; the first two report zero bytes so
    /// the outbound-RTP gate is actually exercised
    stat_polls: AtomicU32,
    replace_count: AtomicU32,
}

impl FakeTransceiver {
    fn new_sending(track_id: String, encodings: Vec<RtpEncoding>) -> Arc<Self> {
        Arc::new(Self {
            mid: Mutex::new(None),
            sending: true,
            track_id: Mutex::new(Some(track_id)),
            encodings: Mutex::new(encodings),
            remote: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stat_polls: AtomicU32::new(0),
            replace_count: AtomicU32::new(0),
        })
    }

    fn new_receiving(mid: String) -> Arc<Self> {
        Arc::new(Self {
            mid: Mutex::new(Some(mid.clone())),
            sending: false,
            track_id: Mutex::new(None),
            encodings: Mutex::new(Vec::new()),
            remote: Mutex::new(Some(Arc::new(FakeRemoteTrack {
                id: format!("remote-{mid}"),
            }) as Arc<dyn RemoteTrack>)),
            stopped: AtomicBool::new(false),
            stat_polls: AtomicU32::new(0),
            replace_count: AtomicU32::new(0),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stat_polls(&self) -> u32 {
        self.stat_polls.load(Ordering::SeqCst)
    }

    pub fn replace_count(&self) -> u32 {
        self.replace_count.load(Ordering::SeqCst)
    }

    pub fn current_track_id(&self) -> Option<String> {
        self.track_id.lock().clone()
    }

    pub fn current_encodings(&self) -> Vec<RtpEncoding> {
        self.encodings.lock().clone()
    }
}

#[async_trait]
impl TransceiverHandle for FakeTransceiver {
    fn mid(&self) -> Option<String> {
        self.mid.lock().clone()
    }

    async fn replace_track(&self, track: Arc<dyn LocalTrack>) -> Result<()> {
        *self.track_id.lock() = Some(track.id());
        self.replace_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_encodings(&self, encodings: &[RtpEncoding]) -> Result<()> {
        *self.encodings.lock() = encodings.to_vec();
        Ok(())
    }

    async fn outbound_bytes_sent(&self) -> Result<u64> {
        let polls = self.stat_polls.fetch_add(1, Ordering::SeqCst);
        if polls < 2 {
            Ok(0)
        } else {
            Ok(1_200)
        }
    }

    async fn remote_track(&self) -> Option<Arc<dyn RemoteTrack>> {
        self.remote.lock().clone()
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct PeerState {
    signaling: SignalingState,
    connection: ConnectionState,
    closed: bool,
    transceivers: Vec<Arc<FakeTransceiver>>,
    next_mid: u32,
    offer_counter: u32,
    local_description: Option<SessionDescription>,
}

/// Controllable peer connection
pub struct FakePeer {
    events: broadcast::Sender<PeerEvent>,
    state: Mutex<PeerState>,
}

impl FakePeer {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            state: Mutex::new(PeerState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                closed: false,
                transceivers: Vec::new(),
                next_mid: 0,
                offer_counter: 0,
                local_description: None,
            }),
        })
    }

    /// Drive the connection state from a test
    pub fn force_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
        let _ = self.events.send(PeerEvent::Connection(state));
    }

    /// Drive the ICE state from a test
    pub fn force_ice_state(&self, state: IceConnectionState) {
        let _ = self.events.send(PeerEvent::Ice(state));
    }

    /// Surface a remote transceiver, as the platform does on a track event
    pub fn add_remote_transceiver(&self, mid: &str) {
        let transceiver = FakeTransceiver::new_receiving(mid.to_string());
        self.state.lock().transceivers.push(transceiver);
        let _ = self.events.send(PeerEvent::TrackAdded {
            mid: mid.to_string(),
        });
    }

    pub fn transceivers(&self) -> Vec<Arc<FakeTransceiver>> {
        self.state.lock().transceivers.clone()
    }

    pub fn is_peer_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn set_signaling(&self, state: SignalingState) {
        self.state.lock().signaling = state;
        let _ = self.events.send(PeerEvent::Signaling(state));
    }

    fn mids_named_in(sdp: &str) -> Vec<String> {
        sdp.split("mids=")
            .nth(1)
            .map(|list| {
                list.split_whitespace()
                    .next()
                    .unwrap_or(list)
                    .split(',')
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerHandle for FakePeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let n = {
            let mut state = self.state.lock();
            state.offer_counter += 1;
            state.offer_counter
        };
        Ok(SessionDescription::offer(format!("v=0 local-offer-{n}")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0 local-answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if desc.kind == SdpKind::Offer {
                // negotiation assigns MIDs to transceivers that lack one
                for transceiver in &state.transceivers {
                    if transceiver.sending && transceiver.mid.lock().is_none() {
                        let mid = state.next_mid.to_string();
                        state.next_mid += 1;
                        *transceiver.mid.lock() = Some(mid);
                    }
                }
            }
            state.local_description = Some(desc.clone());
        }
        match desc.kind {
            SdpKind::Offer => self.set_signaling(SignalingState::HaveLocalOffer),
            SdpKind::Answer => self.set_signaling(SignalingState::Stable),
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        match desc.kind {
            SdpKind::Answer => self.set_signaling(SignalingState::Stable),
            SdpKind::Offer => {
                self.set_signaling(SignalingState::HaveRemoteOffer);
                for mid in Self::mids_named_in(&desc.sdp) {
                    self.add_remote_transceiver(&mid);
                }
            }
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    fn is_closed(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.connection == ConnectionState::Closed
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn add_send_transceiver(
        &self,
        track: Arc<dyn LocalTrack>,
        encodings: &[RtpEncoding],
    ) -> Result<Arc<dyn TransceiverHandle>> {
        let transceiver = FakeTransceiver::new_sending(track.id(), encodings.to_vec());
        self.state.lock().transceivers.push(transceiver.clone());
        Ok(transceiver)
    }

    async fn transceiver_by_mid(&self, mid: &str) -> Option<Arc<dyn TransceiverHandle>> {
        self.state
            .lock()
            .transceivers
            .iter()
            .find(|transceiver| transceiver.mid.lock().as_deref() == Some(mid))
            .cloned()
            .map(|transceiver| transceiver as Arc<dyn TransceiverHandle>)
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.connection = ConnectionState::Closed;
    }
}

/// Factory recording every peer it creates
pub struct FakeRtc {
    peers: Mutex<Vec<Arc<FakePeer>>>,
    pub ice_servers_seen: Mutex<Vec<Vec<IceServerConfig>>>,
}

impl FakeRtc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(Vec::new()),
            ice_servers_seen: Mutex::new(Vec::new()),
        })
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().clone()
    }

    pub fn latest(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

#[async_trait]
impl RtcApi for FakeRtc {
    async fn create_peer(&self, ice_servers: &[IceServerConfig]) -> Result<Arc<dyn PeerHandle>> {
        self.ice_servers_seen.lock().push(ice_servers.to_vec());
        let peer = FakePeer::new();
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}
