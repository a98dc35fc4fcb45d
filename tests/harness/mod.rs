//! End-to-end test harness
//!
//! Provides a scripted SFU ([`MockSfu`]) standing in for the caller's
//! `fetch`, and an in-memory WebRTC platform ([`FakeRtc`]) with
//! controllable peers, transceivers, MIDs and stats. Tests drive the public
//! client API against the two and assert on the recorded exchanges.

// not every test binary exercises every helper
#![allow(dead_code)]

pub mod fake_rtc;
pub mod mock_sfu;

pub use fake_rtc::{fake_track, FakePeer, FakeRtc, FakeTransceiver};
pub use mock_sfu::MockSfu;

use partytracks::backoff::BackoffPolicy;
use partytracks::{PartyTracks, PartyTracksConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Configuration with near-zero backoff delays suited to tests
pub fn test_config() -> PartyTracksConfig {
    let mut config = PartyTracksConfig::new("https://sfu.test");
    config.session.rebuild_backoff = BackoffPolicy::fast();
    config.session.track_backoff = BackoffPolicy::fast();
    config.session.signaling_timeout_ms = 1_000;
    config.session.track_resolve_timeout_ms = 1_000;
    config.session.rtp_probe_timeout_ms = 1_000;
    config
}

/// Client wired to a fresh mock SFU and fake platform
pub fn setup() -> (Arc<MockSfu>, Arc<FakeRtc>, PartyTracks) {
    let sfu = MockSfu::new();
    let rtc = FakeRtc::new();
    let client = PartyTracks::new(test_config(), sfu.clone(), rtc.clone())
        .expect("test config is valid");
    (sfu, rtc, client)
}

/// Wait until a latest-value channel carries a value matching `accept`
pub async fn wait_for_value<T, F>(
    rx: &mut watch::Receiver<Option<T>>,
    accept: F,
    timeout: Duration,
) -> T
where
    T: Clone,
    F: Fn(&T) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            if let Some(value) = rx.borrow().clone() {
                if accept(&value) {
                    return value;
                }
            }
            rx.changed().await.expect("value channel ended");
        }
    })
    .await
    .expect("timed out waiting for value")
}

/// Wait until a latest-value channel carries any value
pub async fn wait_for_some<T: Clone>(
    rx: &mut watch::Receiver<Option<T>>,
    timeout: Duration,
) -> T {
    wait_for_value(rx, |_| true, timeout).await
}

/// Poll `probe` until it returns true, bounded by `timeout`
pub async fn wait_until<F>(probe: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}
