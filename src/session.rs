//! Session lifecycle coordination
//!
//! A session is one peer connection bound to one SFU session id. The
//! coordinator owns at most one current session, rebuilds both together on
//! fatal ICE or connection events, and exposes the current session as a
//! shared, latest-value, ref-counted stream: the first subscriber triggers
//! creation, the last one tears the peer connection down, and late
//! subscribers see the latest session immediately.

use crate::api::protocol::{TrackMetadata, TracksResponse};
use crate::api::SfuApi;
use crate::config::{IceServerConfig, SessionPolicy};
use crate::dispatcher::BulkDispatcher;
use crate::rtc::{ConnectionState, IceConnectionState, PeerEvent, PeerHandle, RtcApi};
use crate::scheduler::FifoScheduler;
use crate::track::push::PushItem;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Per-session signaling machinery
///
/// Pushes, pulls and closes batch separately, but every batch callback runs
/// its signaling through the one scheduler, so SDP exchanges never
/// interleave on the shared peer connection.
pub struct SessionOps {
    pub scheduler: FifoScheduler,
    pub push: BulkDispatcher<PushItem, TracksResponse>,
    pub pull: BulkDispatcher<TrackMetadata, TracksResponse>,
    pub close: BulkDispatcher<String, ()>,
}

impl SessionOps {
    fn new(batch_capacity: usize) -> Self {
        Self {
            scheduler: FifoScheduler::new(),
            push: BulkDispatcher::new(batch_capacity),
            pull: BulkDispatcher::new(batch_capacity),
            close: BulkDispatcher::new(batch_capacity),
        }
    }
}

/// One `(peer connection, SFU session id)` pairing
pub struct Session {
    pub id: String,
    /// Monotonic tag; a larger generation supersedes all prior sessions
    pub generation: u64,
    pub peer: Arc<dyn PeerHandle>,
    pub ops: SessionOps,
    fatal_tx: mpsc::UnboundedSender<String>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Session {
    /// Flag this session as unrecoverable (expired credentials, 5xx on a
    /// session-bound call); the coordinator rebuilds in response
    pub fn report_fatal(&self, reason: impl Into<String>) {
        let _ = self.fatal_tx.send(reason.into());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish()
    }
}

struct CoordinatorCtl {
    subscribers: usize,
    supervisor: Option<JoinHandle<()>>,
}

struct CoordinatorShared {
    api: Arc<SfuApi>,
    rtc: Arc<dyn RtcApi>,
    ice_override: Option<Vec<IceServerConfig>>,
    policy: SessionPolicy,
    tx: watch::Sender<Option<Arc<Session>>>,
    ctl: Mutex<CoordinatorCtl>,
}

/// Owns the current session and rebuilds it on failure
#[derive(Clone)]
pub struct SessionCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl SessionCoordinator {
    pub fn new(
        api: Arc<SfuApi>,
        rtc: Arc<dyn RtcApi>,
        ice_override: Option<Vec<IceServerConfig>>,
        policy: SessionPolicy,
    ) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(CoordinatorShared {
                api,
                rtc,
                ice_override,
                policy,
                tx,
                ctl: Mutex::new(CoordinatorCtl {
                    subscribers: 0,
                    supervisor: None,
                }),
            }),
        }
    }

    /// Subscribe to the current-session stream
    pub fn sessions(&self) -> SessionStream {
        let mut ctl = self.shared.ctl.lock();
        ctl.subscribers += 1;
        if ctl.subscribers == 1 {
            let shared = self.shared.clone();
            ctl.supervisor = Some(tokio::spawn(run_supervisor(shared)));
        }
        SessionStream {
            rx: self.shared.tx.subscribe(),
            _guard: SubscriberGuard {
                shared: self.shared.clone(),
            },
        }
    }
}

/// Shared latest-value view of the current session
///
/// Holding a stream keeps the session alive; dropping the last one closes
/// the peer connection.
pub struct SessionStream {
    rx: watch::Receiver<Option<Arc<Session>>>,
    _guard: SubscriberGuard,
}

impl SessionStream {
    /// Latest session, if one has been established
    pub fn current(&self) -> Option<Arc<Session>> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change to the current session
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| Error::Dispatch("session stream ended".to_string()))
    }

    /// Wait until a session with a generation different from
    /// `last_generation` is current; `None` when the stream has ended
    ///
    /// Marks the observed value as seen, so a later `changed()` only fires
    /// for genuinely newer sessions.
    pub async fn next_session(&mut self, last_generation: Option<u64>) -> Option<Arc<Session>> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(session) = current {
                if Some(session.generation) != last_generation {
                    return Some(session);
                }
            }
            if self.changed().await.is_err() {
                return None;
            }
        }
    }
}

struct SubscriberGuard {
    shared: Arc<CoordinatorShared>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let mut ctl = self.shared.ctl.lock();
        ctl.subscribers -= 1;
        if ctl.subscribers > 0 {
            return;
        }

        if let Some(supervisor) = ctl.supervisor.take() {
            supervisor.abort();
        }
        let last = self.shared.tx.send_replace(None);
        if let Some(session) = last {
            info!(session_id = %session.id, "last subscriber left, closing session");
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { session.peer.close().await });
            }
        }
    }
}

async fn run_supervisor(shared: Arc<CoordinatorShared>) {
    let backoff = shared.policy.rebuild_backoff.clone();
    let probation = shared.policy.ice_probation();
    let mut attempt: u32 = 0;

    loop {
        match build_session(&shared).await {
            Ok(session) => {
                attempt = 0;
                info!(
                    session_id = %session.id,
                    generation = session.generation,
                    "session established"
                );
                shared.tx.send_replace(Some(session.clone()));

                let reason = monitor_session(&session, probation).await;
                warn!(session_id = %session.id, %reason, "session lost, rebuilding");
                session.peer.close().await;
                tokio::time::sleep(backoff.delay_for(0)).await;
            }
            Err(err) => {
                if !backoff.should_retry(attempt + 1) {
                    error!(error = %err, attempts = attempt + 1, "giving up on session creation");
                    shared.tx.send_replace(None);
                    return;
                }
                let delay = backoff.delay_for(attempt);
                warn!(
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "session creation failed, backing off"
                );
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn build_session(shared: &Arc<CoordinatorShared>) -> Result<Arc<Session>> {
    // The session id and ICE servers come from independent endpoints and
    // are fetched concurrently.
    let ice_servers = async {
        match &shared.ice_override {
            Some(servers) => Ok(servers.clone()),
            None => shared.api.ice_servers().await,
        }
    };
    let (session_id, ice_servers) = tokio::try_join!(shared.api.new_session(), ice_servers)?;

    let peer = shared.rtc.create_peer(&ice_servers).await?;
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

    Ok(Arc::new(Session {
        id: session_id,
        generation: GENERATION.fetch_add(1, Ordering::Relaxed),
        peer,
        ops: SessionOps::new(shared.policy.batch_capacity),
        fatal_tx,
        fatal_rx: Mutex::new(Some(fatal_rx)),
    }))
}

/// Watch a live session until it becomes unrecoverable; returns the reason
async fn monitor_session(session: &Arc<Session>, probation: Duration) -> String {
    let mut events = session.peer.subscribe();
    let Some(mut fatal_rx) = session.fatal_rx.lock().take() else {
        return "session monitor already consumed".to_string();
    };

    // ICE `disconnected` starts a probation timer; any later state change
    // cancels it, and expiry means the session is gone.
    let mut probation_timer: Option<Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        tokio::select! {
            reason = fatal_rx.recv() => {
                return reason.unwrap_or_else(|| "fatal channel closed".to_string());
            }
            event = events.recv() => match event {
                Ok(PeerEvent::Connection(ConnectionState::Failed)) => {
                    return "connection state failed".to_string();
                }
                Ok(PeerEvent::Connection(ConnectionState::Closed)) => {
                    return "connection state closed".to_string();
                }
                Ok(PeerEvent::Ice(IceConnectionState::Failed)) => {
                    return "ice connection failed".to_string();
                }
                Ok(PeerEvent::Ice(IceConnectionState::Closed)) => {
                    return "ice connection closed".to_string();
                }
                Ok(PeerEvent::Ice(IceConnectionState::Disconnected)) => {
                    probation_timer = Some(Box::pin(tokio::time::sleep(probation)));
                }
                Ok(PeerEvent::Ice(_)) | Ok(PeerEvent::Connection(_)) => {
                    probation_timer = None;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return "peer event stream ended".to_string();
                }
            },
            () = async { probation_timer.as_mut().expect("timer set").await },
                if probation_timer.is_some() =>
            {
                return "ice disconnected probation expired".to_string();
            }
        }
    }
}
