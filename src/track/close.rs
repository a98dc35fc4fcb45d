//! Batched release of transceivers back to the SFU

use crate::api::protocol::{CloseTrackItem, CloseTracksRequest};
use crate::api::SfuApi;
use crate::session::Session;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Queue `mid` for the next close batch of its session and wait for the
/// batch to complete
///
/// Closes coalesce like pushes and pulls: all MIDs released in the same
/// scheduler turn ride one offer/answer round-trip. When the peer
/// connection is already closed the SFU will reap the session on its own,
/// so the round-trip is skipped entirely.
pub(crate) async fn enqueue_close(
    api: Arc<SfuApi>,
    session: Arc<Session>,
    mid: String,
) -> Result<()> {
    if session.peer.is_closed() {
        debug!(mid, "peer already closed, skipping close batch");
        return Ok(());
    }

    let batch_session = session.clone();
    session
        .ops
        .close
        .submit(mid, move |mids| {
            let run = close_batch(api, batch_session.clone(), mids);
            let scheduled = batch_session.ops.scheduler.schedule(run);
            Box::pin(async move { scheduled.await })
        })
        .await
}

async fn close_batch(api: Arc<SfuApi>, session: Arc<Session>, mids: Vec<String>) -> Result<()> {
    if session.peer.is_closed() {
        return Ok(());
    }

    debug!(session_id = %session.id, count = mids.len(), "closing tracks");

    for mid in &mids {
        if let Some(transceiver) = session.peer.transceiver_by_mid(mid).await {
            let _ = transceiver.stop().await;
        }
    }

    // The offer reflects the stopped transceivers; the SFU answers with the
    // pruned media lines.
    let offer = session.peer.create_offer().await?;
    session.peer.set_local_description(offer).await?;
    let local = session
        .peer
        .local_description()
        .await
        .ok_or_else(|| Error::Rtc("no local description after close offer".to_string()))?;

    let response = api
        .close_tracks(
            &session.id,
            &CloseTracksRequest {
                session_description: local,
                tracks: mids.into_iter().map(|mid| CloseTrackItem { mid }).collect(),
                force: false,
            },
        )
        .await?;

    if let Some(answer) = response.session_description {
        session.peer.set_remote_description(answer).await?;
    }
    Ok(())
}
