//! Pushing local tracks to the SFU
//!
//! A push binds a stable, caller-visible track name to whatever transceiver
//! currently carries the media. The name is minted once, on the first
//! emission of the source; transceivers come and go with sessions.

use super::{close, first_value, EngineShared, WireGuard};
use crate::api::protocol::{TrackLocation, TrackMetadata, TracksRequest, TracksResponse};
use crate::api::SfuApi;
use crate::backoff::retry_with_backoff;
use crate::rtc::{
    wait_for_outbound_rtp, wait_for_stable, LocalTrack, RtpEncoding, TransceiverHandle,
};
use crate::session::{Session, SessionStream};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// One pushed track's slot in a batched signaling exchange
pub struct PushItem {
    pub track_name: String,
    pub transceiver: Arc<dyn TransceiverHandle>,
}

/// Options for [`PushTrackEngine::push`]
#[derive(Default)]
pub struct PushOptions {
    /// Live simulcast/bitrate layers for the sender; the latest value is
    /// applied whenever it changes
    pub encodings: Option<watch::Receiver<Vec<RtpEncoding>>>,
}

/// Handle to an active push subscription
///
/// Dropping the handle cancels the outbound-RTP probe, stops the
/// transceiver and enqueues a batched close.
pub struct PushedTrack {
    metadata: watch::Receiver<Option<TrackMetadata>>,
    error: Arc<Mutex<Option<Error>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl PushedTrack {
    /// Latest published metadata; `None` while (re)connecting
    ///
    /// The metadata never carries a `mid`: MIDs are valid only inside one
    /// peer connection and must not travel.
    pub fn metadata(&self) -> watch::Receiver<Option<TrackMetadata>> {
        self.metadata.clone()
    }

    /// Terminal error, if the subscription has died
    pub fn last_error(&self) -> Option<Error> {
        self.error.lock().clone()
    }
}

impl Drop for PushedTrack {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Adds sendonly transceivers for local tracks and keeps them wired across
/// session rebuilds
pub struct PushTrackEngine {
    shared: Arc<EngineShared>,
}

impl PushTrackEngine {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }

    /// Publish a local track to the SFU
    ///
    /// `source` is a latest-value stream of the outgoing media; emitting a
    /// new track swaps it into the live sender without renegotiation.
    pub fn push(
        &self,
        source: watch::Receiver<Option<Arc<dyn LocalTrack>>>,
        options: PushOptions,
    ) -> PushedTrack {
        let (meta_tx, meta_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let error = Arc::new(Mutex::new(None));

        let sessions = self.shared.coordinator.sessions();
        tokio::spawn(drive_push(
            self.shared.clone(),
            sessions,
            source,
            options,
            meta_tx,
            shutdown_rx,
            error.clone(),
        ));

        PushedTrack {
            metadata: meta_rx,
            error,
            shutdown: Some(shutdown_tx),
        }
    }
}

enum Next {
    Shutdown,
    SessionChanged,
}

#[allow(clippy::too_many_lines)]
async fn drive_push(
    shared: Arc<EngineShared>,
    mut sessions: SessionStream,
    mut source: watch::Receiver<Option<Arc<dyn LocalTrack>>>,
    mut options: PushOptions,
    meta_tx: watch::Sender<Option<TrackMetadata>>,
    mut shutdown: oneshot::Receiver<()>,
    error_slot: Arc<Mutex<Option<Error>>>,
) {
    // The stable id is minted on the first source emission and is the
    // persistent name of this track across session rebuilds.
    let first_track = tokio::select! {
        _ = &mut shutdown => return,
        track = first_value(&mut source) => match track {
            Some(track) => track,
            None => return,
        },
    };
    let stable_id = uuid::Uuid::new_v4().to_string();
    debug!(%stable_id, "push subscription started");

    let backoff = shared.policy.track_backoff.clone();
    let mut source_live = true;
    let mut encodings_live = options.encodings.is_some();
    let mut last_generation = None;
    let mut active: Option<(Arc<Session>, Arc<dyn TransceiverHandle>)> = None;

    'outer: loop {
        let session = tokio::select! {
            _ = &mut shutdown => break 'outer,
            session = sessions.next_session(last_generation) => match session {
                Some(session) => session,
                None => break 'outer,
            },
        };
        last_generation = Some(session.generation);
        meta_tx.send_replace(None);

        let track = source
            .borrow_and_update()
            .clone()
            .unwrap_or_else(|| first_track.clone());
        let encodings = options
            .encodings
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default();

        let wire = retry_with_backoff(&backoff, "push-wire", || {
            wire_push(
                shared.clone(),
                session.clone(),
                stable_id.clone(),
                track.clone(),
                encodings.clone(),
            )
        });
        tokio::pin!(wire);

        let wired = tokio::select! {
            _ = &mut shutdown => break 'outer,
            // the session died while wiring; any in-flight batch slot is
            // abandoned and its result discarded
            _ = sessions.changed() => continue 'outer,
            result = &mut wire => result,
        };

        match wired {
            Ok((transceiver, metadata)) => {
                info!(%stable_id, session_id = %session.id, "pushed track live");
                active = Some((session.clone(), transceiver.clone()));
                meta_tx.send_replace(Some(metadata));

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
                        changed = source.changed(), if source_live => match changed {
                            Ok(()) => {
                                let replacement = source.borrow().clone();
                                if let Some(replacement) = replacement {
                                    // same transceiver, same SDP, no renegotiation
                                    if let Err(e) = transceiver.replace_track(replacement).await {
                                        warn!(%stable_id, error = %e, "replace_track failed");
                                    }
                                }
                            }
                            Err(_) => source_live = false,
                        },
                        changed = async {
                            options.encodings.as_mut().expect("encodings present").changed().await
                        }, if encodings_live => match changed {
                            Ok(()) => {
                                let layers = options
                                    .encodings
                                    .as_ref()
                                    .map(|rx| rx.borrow().clone())
                                    .unwrap_or_default();
                                if let Err(e) = transceiver.set_encodings(&layers).await {
                                    warn!(%stable_id, error = %e, "encoding update failed");
                                }
                            }
                            Err(_) => encodings_live = false,
                        },
                    }
                };

                match next {
                    Next::Shutdown => break 'outer,
                    Next::SessionChanged => {
                        if let Some((old_session, old_transceiver)) = active.take() {
                            teardown(&shared.api, old_session, old_transceiver).await;
                        }
                        continue 'outer;
                    }
                }
            }
            Err(err) if err.is_session_fatal() => {
                session.report_fatal(err.to_string());
                continue 'outer;
            }
            Err(err) => {
                warn!(%stable_id, error = %err, "push subscription failed");
                *error_slot.lock() = Some(err);
                meta_tx.send_replace(None);
                break 'outer;
            }
        }
    }

    if let Some((session, transceiver)) = active.take() {
        teardown(&shared.api, session, transceiver).await;
    }
    debug!(%stable_id, "push subscription ended");
}

async fn wire_push(
    shared: Arc<EngineShared>,
    session: Arc<Session>,
    stable_id: String,
    track: Arc<dyn LocalTrack>,
    encodings: Vec<RtpEncoding>,
) -> Result<(Arc<dyn TransceiverHandle>, TrackMetadata)> {
    let transceiver = session
        .peer
        .add_send_transceiver(track, &encodings)
        .await?;

    // wiring can be cancelled at any await from here on; the guard makes
    // sure the transceiver never stays attached without an owner
    let mut guard = WireGuard::for_push(shared.api.clone(), session.clone(), transceiver.clone());
    let metadata = negotiate_push(&shared, &session, &stable_id, transceiver.clone()).await?;
    guard.disarm();
    Ok((transceiver, metadata))
}

async fn negotiate_push(
    shared: &Arc<EngineShared>,
    session: &Arc<Session>,
    stable_id: &str,
    transceiver: Arc<dyn TransceiverHandle>,
) -> Result<TrackMetadata> {
    let response = {
        let api = shared.api.clone();
        let batch_session = session.clone();
        let timeout = shared.policy.signaling_timeout();
        session
            .ops
            .push
            .submit(
                PushItem {
                    track_name: stable_id.to_string(),
                    transceiver: transceiver.clone(),
                },
                move |items| {
                    let run = push_batch(api, batch_session.clone(), items, timeout);
                    let scheduled = batch_session.ops.scheduler.schedule(run);
                    Box::pin(async move { scheduled.await })
                },
            )
            .await?
    };

    let mid = transceiver.mid().ok_or_else(|| {
        Error::Protocol("transceiver has no mid after negotiation".to_string())
    })?;
    let entries = response
        .tracks
        .as_ref()
        .ok_or_else(|| Error::Protocol("push response missing tracks".to_string()))?;
    let entry = entries
        .iter()
        .find(|entry| entry.mid.as_deref() == Some(mid.as_str()))
        .ok_or_else(|| Error::Protocol(format!("no push response entry for mid {mid}")))?;
    entry.check()?;

    // Hold the metadata back until media is actually leaving: subscribers
    // that pull this name must receive frames, not a dead sender.
    wait_for_outbound_rtp(transceiver.as_ref(), shared.policy.rtp_probe_timeout()).await?;

    Ok(TrackMetadata {
        location: Some(TrackLocation::Local),
        track_name: Some(stable_id.to_string()),
        session_id: entry.session_id.clone().or_else(|| Some(session.id.clone())),
        // mid is session-local and must not leave the library
        mid: None,
        simulcast: None,
    })
}

/// One offer/answer exchange covering every push coalesced into this batch
async fn push_batch(
    api: Arc<SfuApi>,
    session: Arc<Session>,
    items: Vec<PushItem>,
    timeout: Duration,
) -> Result<TracksResponse> {
    let offer = session.peer.create_offer().await?;
    session.peer.set_local_description(offer).await?;
    let local = session
        .peer
        .local_description()
        .await
        .ok_or_else(|| Error::Rtc("no local description after push offer".to_string()))?;

    let tracks = items
        .iter()
        .map(|item| TrackMetadata {
            location: Some(TrackLocation::Local),
            track_name: Some(item.track_name.clone()),
            session_id: None,
            mid: item.transceiver.mid(),
            simulcast: None,
        })
        .collect();

    let response = api
        .tracks_new(
            &session.id,
            &TracksRequest {
                session_description: Some(local),
                tracks,
            },
        )
        .await?;

    if let Some(answer) = response.session_description.clone() {
        session.peer.set_remote_description(answer).await?;
    }
    wait_for_stable(session.peer.as_ref(), timeout).await?;
    Ok(response)
}

async fn teardown(
    api: &Arc<SfuApi>,
    session: Arc<Session>,
    transceiver: Arc<dyn TransceiverHandle>,
) {
    if let Some(mid) = transceiver.mid() {
        let _ = transceiver.stop().await;
        if let Err(e) = close::enqueue_close(api.clone(), session, mid.clone()).await {
            debug!(%mid, error = %e, "close batch failed during teardown");
        }
    }
}
