//! Pulling remote tracks from the SFU
//!
//! A pull turns a track descriptor (name + owning session) into received
//! media on the local peer connection. Pulls batch like pushes; the SFU
//! may demand an immediate renegotiation to fit the new media lines in.

use super::{close, first_value, EngineShared, WireGuard};
use crate::api::protocol::{
    SimulcastConfig, TrackLocation, TrackMetadata, TracksRequest, TracksResponse,
    UpdateTracksRequest,
};
use crate::api::SfuApi;
use crate::backoff::retry_with_backoff;
use crate::rtc::{resolve_transceiver_by_mid, wait_for_stable, RemoteTrack};
use crate::session::{Session, SessionStream};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Options for [`PullTrackEngine::pull`]
#[derive(Default)]
pub struct PullOptions {
    /// Live simulcast layer preference; each non-initial value is forwarded
    /// to the SFU as a fire-and-forget update
    pub preferred_rid: Option<watch::Receiver<Option<String>>>,
}

/// Handle to an active pull subscription
///
/// Dropping the handle enqueues a batched close for the pulled MID.
pub struct PulledTrack {
    track: watch::Receiver<Option<Arc<dyn RemoteTrack>>>,
    error: Arc<Mutex<Option<Error>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl PulledTrack {
    /// Latest received track; `None` while (re)connecting
    pub fn track(&self) -> watch::Receiver<Option<Arc<dyn RemoteTrack>>> {
        self.track.clone()
    }

    /// Terminal error, if the subscription has died
    pub fn last_error(&self) -> Option<Error> {
        self.error.lock().clone()
    }
}

impl Drop for PulledTrack {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Resolves remote track descriptors into received media
pub struct PullTrackEngine {
    shared: Arc<EngineShared>,
}

impl PullTrackEngine {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Subscribe to a remote track
    ///
    /// `descriptor` is a latest-value stream of the track to pull.
    /// Consecutive identical descriptors are deduped by value, so a pushed
    /// track re-announcing itself does not cause a re-pull.
    pub fn pull(
        &self,
        descriptor: watch::Receiver<Option<TrackMetadata>>,
        options: PullOptions,
    ) -> PulledTrack {
        let (track_tx, track_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let error = Arc::new(Mutex::new(None));

        let sessions = self.shared.coordinator.sessions();
        tokio::spawn(drive_pull(
            self.shared.clone(),
            sessions,
            descriptor,
            options,
            track_tx,
            shutdown_rx,
            error.clone(),
        ));

        PulledTrack {
            track: track_rx,
            error,
            shutdown: Some(shutdown_tx),
        }
    }
}

enum Next {
    Shutdown,
    SessionChanged,
    DescriptorChanged(TrackMetadata),
}

#[allow(clippy::too_many_lines)]
async fn drive_pull(
    shared: Arc<EngineShared>,
    mut sessions: SessionStream,
    mut descriptor_rx: watch::Receiver<Option<TrackMetadata>>,
    mut options: PullOptions,
    track_tx: watch::Sender<Option<Arc<dyn RemoteTrack>>>,
    mut shutdown: oneshot::Receiver<()>,
    error_slot: Arc<Mutex<Option<Error>>>,
) {
    let mut descriptor = tokio::select! {
        _ = &mut shutdown => return,
        value = first_value(&mut descriptor_rx) => match value {
            Some(value) => value.without_mid(),
            None => return,
        },
    };
    debug!(track_name = ?descriptor.track_name, "pull subscription started");

    let backoff = shared.policy.track_backoff.clone();
    let mut descriptor_live = true;
    let mut rid_live = options.preferred_rid.is_some();
    let mut last_generation = None;
    let mut active: Option<(Arc<Session>, String)> = None;

    'sessions: loop {
        let session = tokio::select! {
            _ = &mut shutdown => break 'sessions,
            session = sessions.next_session(last_generation) => match session {
                Some(session) => session,
                None => break 'sessions,
            },
        };
        last_generation = Some(session.generation);

        'wire: loop {
            track_tx.send_replace(None);

            let mut request = descriptor.clone();
            request.location = Some(TrackLocation::Remote);
            if let Some(rid) = options
                .preferred_rid
                .as_ref()
                .and_then(|rx| rx.borrow().clone())
            {
                request.simulcast = Some(SimulcastConfig { preferred_rid: rid });
            }

            let wire = retry_with_backoff(&backoff, "pull-wire", || {
                wire_pull(shared.clone(), session.clone(), request.clone())
            });
            tokio::pin!(wire);

            let wired = tokio::select! {
                _ = &mut shutdown => break 'sessions,
                _ = sessions.changed() => continue 'sessions,
                result = &mut wire => result,
            };

            let (mid, remote) = match wired {
                Ok(ok) => ok,
                Err(err) if err.is_session_fatal() => {
                    session.report_fatal(err.to_string());
                    continue 'sessions;
                }
                Err(err) => {
                    warn!(track_name = ?descriptor.track_name, error = %err, "pull subscription failed");
                    *error_slot.lock() = Some(err);
                    track_tx.send_replace(None);
                    break 'sessions;
                }
            };

            info!(track_name = ?descriptor.track_name, %mid, session_id = %session.id, "pulled track live");
            active = Some((session.clone(), mid.clone()));
            track_tx.send_replace(Some(remote));

            let next = loop {
                tokio::select! {
                    _ = &mut shutdown => break Next::Shutdown,
                    _ = sessions.changed() => {
                        let moved = sessions.current()
                            .map(|s| s.generation != session.generation)
                            .unwrap_or(true);
                        if moved {
                            break Next::SessionChanged;
                        }
                    }
                    changed = descriptor_rx.changed(), if descriptor_live => match changed {
                        Ok(()) => {
                            let incoming = descriptor_rx.borrow().clone();
                            if let Some(incoming) = incoming {
                                let incoming = incoming.without_mid();
                                // deep-equality dedupe: re-announcements of
                                // the same track are not re-pulled
                                if incoming != descriptor {
                                    break Next::DescriptorChanged(incoming);
                                }
                            }
                        }
                        Err(_) => descriptor_live = false,
                    },
                    changed = async {
                        options.preferred_rid.as_mut().expect("rid stream present").changed().await
                    }, if rid_live => match changed {
                        Ok(()) => {
                            let rid = options
                                .preferred_rid
                                .as_ref()
                                .and_then(|rx| rx.borrow().clone());
                            if let Some(rid) = rid {
                                push_rid_update(&shared.api, &session, &descriptor, &mid, rid).await;
                            }
                        }
                        Err(_) => rid_live = false,
                    },
                }
            };

            match next {
                Next::Shutdown => break 'sessions,
                Next::SessionChanged => {
                    if let Some((old_session, old_mid)) = active.take() {
                        release(&shared.api, old_session, old_mid).await;
                    }
                    continue 'sessions;
                }
                Next::DescriptorChanged(incoming) => {
                    descriptor = incoming;
                    if let Some((old_session, old_mid)) = active.take() {
                        release(&shared.api, old_session, old_mid).await;
                    }
                    continue 'wire;
                }
            }
        }
    }

    if let Some((session, mid)) = active.take() {
        release(&shared.api, session, mid).await;
    }
    debug!(track_name = ?descriptor.track_name, "pull subscription ended");
}

async fn wire_pull(
    shared: Arc<EngineShared>,
    session: Arc<Session>,
    descriptor: TrackMetadata,
) -> Result<(String, Arc<dyn RemoteTrack>)> {
    let response = {
        let api = shared.api.clone();
        let batch_session = session.clone();
        let timeout = shared.policy.signaling_timeout();
        session
            .ops
            .pull
            .submit(descriptor.clone(), move |descriptors| {
                let run = pull_batch(api, batch_session.clone(), descriptors, timeout);
                let scheduled = batch_session.ops.scheduler.schedule(run);
                Box::pin(async move { scheduled.await })
            })
            .await?
    };

    let entries = response
        .tracks
        .as_ref()
        .ok_or_else(|| Error::Protocol("pull response missing tracks".to_string()))?;
    let entry = entries
        .iter()
        .find(|entry| {
            entry.track_name == descriptor.track_name
                && (descriptor.session_id.is_none() || entry.session_id == descriptor.session_id)
        })
        .ok_or_else(|| {
            Error::Protocol(format!(
                "no pull response entry for track {:?}",
                descriptor.track_name
            ))
        })?;
    entry.check()?;
    let mid = entry
        .mid
        .clone()
        .ok_or_else(|| Error::Protocol("pulled entry missing mid".to_string()))?;

    // the SFU has allocated a slot for this MID; if resolution is cancelled
    // or never completes, the slot must still be released
    let mut guard = WireGuard::for_pull(shared.api.clone(), session.clone(), mid.clone());

    // the remote transceiver surfaces via the peer's track event, bounded
    let resolve_timeout = shared.policy.track_resolve_timeout();
    let deadline = tokio::time::Instant::now() + resolve_timeout;
    let transceiver =
        resolve_transceiver_by_mid(session.peer.as_ref(), &mid, resolve_timeout).await?;
    let remote = loop {
        if let Some(track) = transceiver.remote_track().await {
            break track;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "no media arrived on mid {mid} within {}ms",
                resolve_timeout.as_millis()
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    guard.disarm();
    Ok((mid, remote))
}

/// One pull exchange covering every descriptor coalesced into this batch
///
/// Pulls carry no SDP; when the SFU flags `requiresImmediateRenegotiation`,
/// its offer is applied and answered before any caller resolves.
async fn pull_batch(
    api: Arc<SfuApi>,
    session: Arc<Session>,
    descriptors: Vec<TrackMetadata>,
    timeout: Duration,
) -> Result<TracksResponse> {
    let response = api
        .tracks_new(
            &session.id,
            &TracksRequest {
                session_description: None,
                tracks: descriptors,
            },
        )
        .await?;

    if response.requires_immediate_renegotiation.unwrap_or(false) {
        let offer = response.session_description.clone().ok_or_else(|| {
            Error::Protocol("renegotiation required but no offer supplied".to_string())
        })?;
        session.peer.set_remote_description(offer).await?;
        let answer = session.peer.create_answer().await?;
        session.peer.set_local_description(answer).await?;
        let local = session
            .peer
            .local_description()
            .await
            .ok_or_else(|| Error::Rtc("no local description after answer".to_string()))?;
        api.renegotiate(&session.id, local).await?;
        wait_for_stable(session.peer.as_ref(), timeout).await?;
    }

    Ok(response)
}

/// Forward a simulcast layer preference; failures are logged, not surfaced
async fn push_rid_update(
    api: &Arc<SfuApi>,
    session: &Arc<Session>,
    descriptor: &TrackMetadata,
    mid: &str,
    rid: String,
) {
    let mut update = descriptor.clone();
    update.mid = Some(mid.to_string());
    update.simulcast = Some(SimulcastConfig { preferred_rid: rid });

    if let Err(e) = api
        .update_tracks(
            &session.id,
            &UpdateTracksRequest {
                tracks: vec![update],
            },
        )
        .await
    {
        warn!(%mid, error = %e, "simulcast preference update failed");
    }
}

async fn release(api: &Arc<SfuApi>, session: Arc<Session>, mid: String) {
    if let Err(e) = close::enqueue_close(api.clone(), session, mid.clone()).await {
        debug!(%mid, error = %e, "close batch failed during teardown");
    }
}
