//! End-to-end push/pull behavior against the mock SFU and fake platform

mod harness;

use harness::{fake_track, setup, wait_for_some, wait_for_value, wait_until};
use partytracks::rtc::{
    ConnectionState, IceConnectionState, RemoteTrack, RtpEncoding, TransceiverHandle,
};
use partytracks::{PartyTracks, PullOptions, PushOptions, TrackMetadata};
use std::time::Duration;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn push_one_track_one_session() {
    let (sfu, _rtc, client) = setup();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());

    let mut metadata_rx = pushed.metadata();
    let metadata = wait_for_some(&mut metadata_rx, WAIT).await;

    // one session, one batched push exchange
    assert_eq!(sfu.count_matching("/sessions/new"), 1);
    assert_eq!(sfu.count_matching("/tracks/new"), 1);

    let push_request = &sfu.requests_matching("/tracks/new")[0];
    assert_eq!(push_request.method, "POST");
    let tracks = push_request.body["tracks"].as_array().unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0]["location"], "local");
    assert_eq!(tracks[0]["mid"], "0");
    assert!(push_request.body["sessionDescription"]["sdp"]
        .as_str()
        .unwrap()
        .contains("local-offer"));

    // emitted metadata names the stable id, never the mid
    assert_eq!(metadata.track_name.as_deref(), tracks[0]["trackName"].as_str());
    assert_eq!(metadata.session_id.as_deref(), Some("S1"));
    assert!(metadata.mid.is_none());
}

#[tokio::test]
async fn push_three_tracks_same_tick_coalesce() {
    let (sfu, _rtc, client) = setup();

    let sources: Vec<_> = (0..3)
        .map(|n| watch::channel(Some(fake_track(&format!("cam-{n}")))))
        .collect();
    let pushed: Vec<_> = sources
        .iter()
        .map(|(_, rx)| client.push(rx.clone(), PushOptions::default()))
        .collect();

    let mut names = Vec::new();
    for handle in &pushed {
        let mut rx = handle.metadata();
        let metadata = wait_for_some(&mut rx, WAIT).await;
        assert_eq!(metadata.session_id.as_deref(), Some("S1"));
        assert!(metadata.mid.is_none());
        names.push(metadata.track_name.unwrap());
    }
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 3, "stable ids must be distinct");

    // all three rode a single signaling exchange
    assert_eq!(sfu.count_matching("/sessions/new"), 1);
    let pushes = sfu.requests_matching("/tracks/new");
    assert_eq!(pushes.len(), 1);
    let tracks = pushes[0].body["tracks"].as_array().unwrap();
    assert_eq!(tracks.len(), 3);

    let mut mids: Vec<_> = tracks
        .iter()
        .map(|t| t["mid"].as_str().unwrap().to_string())
        .collect();
    mids.sort();
    assert_eq!(mids, vec!["0", "1", "2"]);
}

#[tokio::test]
async fn session_reset_rebuilds_and_repushes() {
    let (sfu, rtc, client) = setup();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());

    let mut metadata_rx = pushed.metadata();
    let first = wait_for_some(&mut metadata_rx, WAIT).await;
    assert_eq!(first.session_id.as_deref(), Some("S1"));

    // kill the live connection
    let first_peer = rtc.latest().unwrap();
    first_peer.force_connection_state(ConnectionState::Failed);

    let second = wait_for_value(
        &mut metadata_rx,
        |m| m.session_id.as_deref() == Some("S2"),
        WAIT,
    )
    .await;

    // same stable id, fresh session, fresh signaling exchange
    assert_eq!(second.track_name, first.track_name);
    assert_eq!(sfu.count_matching("/sessions/new"), 2);
    assert_eq!(sfu.count_matching("/tracks/new"), 2);

    // the coordinator never owns two live peers
    let peers = rtc.peers();
    assert_eq!(peers.len(), 2);
    assert!(peers[0].is_peer_closed());
    assert!(!peers[1].is_peer_closed());
}

#[tokio::test]
async fn pull_with_immediate_renegotiation() {
    let (sfu, rtc, client) = setup();

    let (_desc_tx, desc_rx) = watch::channel(Some(TrackMetadata::remote("x", "S9")));
    let pulled = client.pull(desc_rx, PullOptions::default());

    let mut track_rx = pulled.track();
    let track = wait_for_some(&mut track_rx, WAIT).await;
    assert_eq!(track.id(), "remote-p0");

    // pull carries no SDP; the renegotiation answer follows it
    let pulls = sfu.requests_matching("/tracks/new");
    assert_eq!(pulls.len(), 1);
    assert!(pulls[0].body.get("sessionDescription").is_none());
    assert_eq!(pulls[0].body["tracks"][0]["trackName"], "x");
    assert_eq!(pulls[0].body["tracks"][0]["sessionId"], "S9");

    let renegotiations = sfu.requests_matching("/renegotiate");
    assert_eq!(renegotiations.len(), 1);
    assert_eq!(
        renegotiations[0].body["sessionDescription"]["type"],
        "answer"
    );

    // request order: pull first, then the renegotiation
    let paths = sfu.request_paths();
    let pull_at = paths.iter().position(|p| p.ends_with("/tracks/new")).unwrap();
    let reneg_at = paths.iter().position(|p| p.ends_with("/renegotiate")).unwrap();
    assert!(pull_at < reneg_at);

    // the transceiver surfaced from the SFU's offer
    let peer = rtc.latest().unwrap();
    assert!(peer
        .transceivers()
        .iter()
        .any(|t| t.mid().as_deref() == Some("p0")));
}

#[tokio::test]
async fn concurrent_pulls_same_tick_coalesce() {
    let (sfu, _rtc, client) = setup();

    let (_tx_a, rx_a) = watch::channel(Some(TrackMetadata::remote("a", "S7")));
    let (_tx_b, rx_b) = watch::channel(Some(TrackMetadata::remote("b", "S7")));
    let pulled_a = client.pull(rx_a, PullOptions::default());
    let pulled_b = client.pull(rx_b, PullOptions::default());

    let track_a = wait_for_some(&mut pulled_a.track(), WAIT).await;
    let track_b = wait_for_some(&mut pulled_b.track(), WAIT).await;
    assert_ne!(track_a.id(), track_b.id());

    let pulls = sfu.requests_matching("/tracks/new");
    assert_eq!(pulls.len(), 1, "both pulls must ride one request");
    assert_eq!(pulls[0].body["tracks"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn simulcast_preference_updates_are_fire_and_forget() {
    let (sfu, _rtc, client) = setup();

    let (rid_tx, rid_rx) = watch::channel(None::<String>);
    let (_desc_tx, desc_rx) = watch::channel(Some(TrackMetadata::remote("x", "S9")));
    let pulled = client.pull(
        desc_rx,
        PullOptions {
            preferred_rid: Some(rid_rx),
        },
    );

    wait_for_some(&mut pulled.track(), WAIT).await;
    assert_eq!(sfu.count_matching("/tracks/update"), 0);

    rid_tx.send(Some("h".to_string())).unwrap();
    wait_until(|| sfu.count_matching("/tracks/update") == 1, WAIT).await;

    rid_tx.send(Some("l".to_string())).unwrap();
    wait_until(|| sfu.count_matching("/tracks/update") == 2, WAIT).await;

    // no re-pull happened, and each update names the live mid
    assert_eq!(sfu.count_matching("/tracks/new"), 1);
    let updates = sfu.requests_matching("/tracks/update");
    assert_eq!(updates[0].body["tracks"][0]["mid"], "p0");
    assert_eq!(updates[0].body["tracks"][0]["simulcast"]["preferredRid"], "h");
    assert_eq!(updates[1].body["tracks"][0]["simulcast"]["preferredRid"], "l");
}

#[tokio::test]
async fn metadata_waits_for_outbound_rtp() {
    let (_sfu, rtc, client) = setup();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    // the fake reports zero bytes for the first two polls; metadata can
    // only have been published after the gate saw bytes flowing
    let transceiver = &rtc.latest().unwrap().transceivers()[0];
    assert!(transceiver.stat_polls() >= 3);
}

#[tokio::test]
async fn replace_track_swaps_without_renegotiation() {
    let (sfu, rtc, client) = setup();

    let (track_tx, track_rx) = watch::channel(Some(fake_track("cam-front")));
    let pushed = client.push(track_rx, PushOptions::default());
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    track_tx.send(Some(fake_track("cam-back"))).unwrap();

    let transceiver = rtc.latest().unwrap().transceivers()[0].clone();
    wait_until(
        || transceiver.current_track_id().as_deref() == Some("cam-back"),
        WAIT,
    )
    .await;

    // still exactly one signaling exchange
    assert_eq!(sfu.count_matching("/tracks/new"), 1);
    assert_eq!(sfu.count_matching("/renegotiate"), 0);
}

#[tokio::test]
async fn encoding_updates_reach_the_sender() {
    let (_sfu, rtc, client) = setup();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let (enc_tx, enc_rx) = watch::channel(vec![RtpEncoding {
        rid: Some("f".to_string()),
        ..Default::default()
    }]);
    let pushed = client.push(
        track_rx,
        PushOptions {
            encodings: Some(enc_rx),
        },
    );
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    let transceiver = rtc.latest().unwrap().transceivers()[0].clone();
    assert_eq!(
        transceiver.current_encodings()[0].rid.as_deref(),
        Some("f")
    );

    enc_tx
        .send(vec![
            RtpEncoding {
                rid: Some("h".to_string()),
                max_bitrate_bps: Some(2_500_000),
                ..Default::default()
            },
            RtpEncoding {
                rid: Some("l".to_string()),
                max_bitrate_bps: Some(300_000),
                ..Default::default()
            },
        ])
        .unwrap();

    wait_until(|| transceiver.current_encodings().len() == 2, WAIT).await;
}

#[tokio::test]
async fn dropping_push_enqueues_close() {
    let (sfu, rtc, client) = setup();

    // keep a second subscription so the session outlives the push
    let _sessions = client.sessions();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    drop(pushed);
    wait_until(|| sfu.count_matching("/tracks/close") == 1, WAIT).await;

    let close = &sfu.requests_matching("/tracks/close")[0];
    assert_eq!(close.body["tracks"][0]["mid"], "0");
    assert_eq!(close.body["force"], false);

    let transceiver = &rtc.latest().unwrap().transceivers()[0];
    assert!(transceiver.is_stopped());
}

#[tokio::test]
async fn dropping_push_mid_wire_detaches_the_transceiver() {
    let (sfu, rtc, client) = setup();

    // establish the session first so only the signaling exchange is slowed
    let _sessions = client.sessions();
    wait_until(|| rtc.latest().is_some(), WAIT).await;
    sfu.set_response_delay(Duration::from_millis(200));

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());

    // cancel while the batched offer is still in flight
    wait_until(|| sfu.count_matching("/tracks/new") == 1, WAIT).await;
    drop(pushed);
    sfu.set_response_delay(Duration::ZERO);

    // the cancelled wiring must not leave the transceiver attached
    let transceiver = rtc.latest().unwrap().transceivers()[0].clone();
    wait_until(|| transceiver.is_stopped(), WAIT).await;
    wait_until(|| sfu.count_matching("/tracks/close") == 1, WAIT).await;

    let close = &sfu.requests_matching("/tracks/close")[0];
    assert_eq!(close.body["tracks"][0]["mid"], "0");
}

#[tokio::test]
async fn dropping_pull_mid_wire_releases_the_allocated_mid() {
    let (sfu, rtc, client) = setup();
    // no renegotiation: the SFU assigns a MID but no transceiver ever
    // surfaces, so the pull parks in the resolve window
    sfu.pull_renegotiates
        .store(false, std::sync::atomic::Ordering::SeqCst);

    let _sessions = client.sessions();
    wait_until(|| rtc.latest().is_some(), WAIT).await;

    let (_desc_tx, desc_rx) = watch::channel(Some(TrackMetadata::remote("x", "S9")));
    let pulled = client.pull(desc_rx, PullOptions::default());

    wait_until(|| sfu.count_matching("/tracks/new") == 1, WAIT).await;
    // give the driver a moment to take the assigned MID from the response
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(pulled);

    // the SFU-side slot for the assigned MID must still be released
    wait_until(|| sfu.count_matching("/tracks/close") >= 1, WAIT).await;
    let close = &sfu.requests_matching("/tracks/close")[0];
    assert_eq!(close.body["tracks"][0]["mid"], "p0");
}

#[tokio::test]
async fn last_subscriber_closes_the_peer_connection() {
    let (_sfu, rtc, client) = setup();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    drop(pushed);
    wait_until(
        || rtc.latest().map(|p| p.is_peer_closed()).unwrap_or(false),
        WAIT,
    )
    .await;
}

#[tokio::test]
async fn descriptor_reannouncement_does_not_repull() {
    let (sfu, _rtc, client) = setup();

    let (desc_tx, desc_rx) = watch::channel(Some(TrackMetadata::remote("x", "S9")));
    let pulled = client.pull(desc_rx, PullOptions::default());
    wait_for_some(&mut pulled.track(), WAIT).await;

    // identical descriptor re-emitted: deduped by value
    desc_tx.send(Some(TrackMetadata::remote("x", "S9"))).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sfu.count_matching("/tracks/new"), 1);

    // a genuinely different descriptor re-pulls
    desc_tx.send(Some(TrackMetadata::remote("y", "S9"))).unwrap();
    wait_until(|| sfu.count_matching("/tracks/new") == 2, WAIT).await;
}

#[tokio::test]
async fn ice_disconnected_probation_expiry_rebuilds() {
    let sfu = harness::MockSfu::new();
    let rtc = harness::FakeRtc::new();
    let mut config = harness::test_config();
    config.session.ice_probation_ms = 50;
    let client = PartyTracks::new(config, sfu.clone(), rtc.clone()).unwrap();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());
    let mut metadata_rx = pushed.metadata();
    wait_for_some(&mut metadata_rx, WAIT).await;

    rtc.latest()
        .unwrap()
        .force_ice_state(IceConnectionState::Disconnected);

    // probation expires unanswered and the session is rebuilt
    wait_for_value(
        &mut metadata_rx,
        |m| m.session_id.as_deref() == Some("S2"),
        WAIT,
    )
    .await;
}

#[tokio::test]
async fn ice_recovery_cancels_probation() {
    let sfu = harness::MockSfu::new();
    let rtc = harness::FakeRtc::new();
    let mut config = harness::test_config();
    config.session.ice_probation_ms = 80;
    let client = PartyTracks::new(config, sfu.clone(), rtc.clone()).unwrap();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    let peer = rtc.latest().unwrap();
    peer.force_ice_state(IceConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    // recovery before the probation deadline cancels the rebuild
    peer.force_ice_state(IceConnectionState::Connected);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(sfu.count_matching("/sessions/new"), 1);
    assert!(!peer.is_peer_closed());
}

#[tokio::test]
async fn api_history_records_exchanges() {
    let (_sfu, _rtc, client) = setup();

    let (_track_tx, track_rx) = watch::channel(Some(fake_track("cam")));
    let pushed = client.push(track_rx, PushOptions::default());
    wait_for_some(&mut pushed.metadata(), WAIT).await;

    let history = client.api_history();
    assert!(history.len() >= 4, "request+response per endpoint");
    assert!(history
        .iter()
        .any(|entry| entry.endpoint == "/sessions/new"));
}
