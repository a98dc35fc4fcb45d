//! Per-track wiring engines
//!
//! Each push or pull subscription owns one driver task that follows the
//! current session: it creates a transceiver, runs the batched signaling
//! exchange, publishes its output through a latest-value channel, and
//! re-executes from scratch whenever the session is rebuilt. Dropping the
//! returned handle is the cancellation primitive; teardown stops the
//! transceiver and enqueues a batched close.

pub mod close;
pub mod pull;
pub mod push;

use crate::api::SfuApi;
use crate::config::SessionPolicy;
use crate::rtc::TransceiverHandle;
use crate::session::{Session, SessionCoordinator};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

pub use pull::{PullOptions, PullTrackEngine, PulledTrack};
pub use push::{PushItem, PushOptions, PushTrackEngine, PushedTrack};

/// Context shared by the engines of one client instance
pub(crate) struct EngineShared {
    pub api: Arc<SfuApi>,
    pub coordinator: SessionCoordinator,
    pub policy: SessionPolicy,
}

/// Cleans up a partially wired track when wiring never completes
///
/// Wiring runs inline and is raced against shutdown and session changes, so
/// the future can be dropped at any suspension point. Whatever has already
/// been allocated by then, a local transceiver or an SFU-assigned MID, must
/// still be detached: the guard stops the transceiver and enqueues a bulk
/// close for the MID unless the wiring disarmed it by finishing.
pub(crate) struct WireGuard {
    api: Arc<SfuApi>,
    session: Arc<Session>,
    transceiver: Option<Arc<dyn TransceiverHandle>>,
    mid: Option<String>,
    armed: bool,
}

impl WireGuard {
    /// Guard a freshly added sendonly transceiver; its MID is read at drop
    /// time, after negotiation may have assigned one
    pub(crate) fn for_push(
        api: Arc<SfuApi>,
        session: Arc<Session>,
        transceiver: Arc<dyn TransceiverHandle>,
    ) -> Self {
        Self {
            api,
            session,
            transceiver: Some(transceiver),
            mid: None,
            armed: true,
        }
    }

    /// Guard a MID the SFU has assigned to a pull before its transceiver
    /// has surfaced
    pub(crate) fn for_pull(api: Arc<SfuApi>, session: Arc<Session>, mid: String) -> Self {
        Self {
            api,
            session,
            transceiver: None,
            mid: Some(mid),
            armed: true,
        }
    }

    /// Wiring completed; ownership passes to the steady-state teardown
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WireGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let api = self.api.clone();
        let session = self.session.clone();
        let transceiver = self.transceiver.take();
        let mid = self.mid.take();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            let mid = mid.or_else(|| transceiver.as_ref().and_then(|t| t.mid()));
            if let Some(transceiver) = &transceiver {
                let _ = transceiver.stop().await;
            }
            if let Some(mid) = mid {
                debug!(%mid, "releasing track left by cancelled wiring");
                if let Err(e) = close::enqueue_close(api, session, mid.clone()).await {
                    debug!(%mid, error = %e, "close batch failed after cancelled wiring");
                }
            }
        });
    }
}

/// Wait until a latest-value input has produced its first value
///
/// Returns `None` when the sender went away without ever emitting.
pub(crate) async fn first_value<T: Clone>(rx: &mut watch::Receiver<Option<T>>) -> Option<T> {
    loop {
        if let Some(value) = rx.borrow_and_update().clone() {
            return Some(value);
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}
