//! End-to-end signaling scenarios against the in-process engine

use serde_json::{json, Value};
use stagecast_api::protocol::ServerMessage;
use stagecast_api::{Coordinator, SignalingSession};
use stagecast_core::config::{AnnouncePolicy, Config};
use stagecast_sfu::{LocalEngine, PeerEvent, PeerId, TransportId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> Config {
    let mut config = Config::default();
    config.transcode.enabled = false;
    config
}

fn setup(config: &Config) -> (LocalEngine, Arc<Coordinator>) {
    let engine = LocalEngine::new(&config.media);
    let coordinator = Coordinator::new(config, Arc::new(engine.clone()));
    (engine, coordinator)
}

struct Client {
    session: SignalingSession,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    next_id: AtomicU64,
}

impl Client {
    async fn connect(coordinator: &Arc<Coordinator>) -> Self {
        let (session, mut events) = SignalingSession::open(Arc::clone(coordinator));
        match events.recv().await.unwrap() {
            PeerEvent::ConnectionSuccess { peer_id } => assert_eq!(&peer_id, session.peer_id()),
            other => panic!("expected connectionSuccess, got {other:?}"),
        }
        Self {
            session,
            events,
            next_id: AtomicU64::new(1),
        }
    }

    fn peer_id(&self) -> PeerId {
        self.session.peer_id().clone()
    }

    async fn call(&self, method: &str, data: Value) -> Value {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({"id": id, "method": method, "data": data}).to_string();
        let reply = self.session.handle_text(&frame).await.expect("response");
        let ServerMessage::Response(response) = reply else {
            panic!("expected response frame");
        };
        assert_eq!(response.id, id);
        serde_json::to_value(&response).unwrap()
    }

    async fn request(&self, method: &str, data: Value) -> Value {
        let response = self.call(method, data).await;
        assert_eq!(response["ok"], true, "{method} failed: {response}");
        response["data"].clone()
    }

    async fn request_err(&self, method: &str, data: Value) -> String {
        let response = self.call(method, data).await;
        assert_eq!(response["ok"], false, "{method} unexpectedly succeeded");
        response["error"]["code"].as_str().unwrap().to_string()
    }

    async fn next_event(&mut self) -> PeerEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("event timeout")
            .expect("event queue closed")
    }

    fn assert_no_event(&mut self) {
        if let Ok(event) = self.events.try_recv() {
            panic!("unexpected event {event:?}");
        }
    }

    /// Create and connect both transports
    async fn setup_transports(&self) -> (String, String) {
        let send = self
            .request("createWebRtcTransport", json!({"sender": true}))
            .await;
        self.request("transportConnect", json!({"dtlsParameters": dtls()}))
            .await;
        let recv = self
            .request("createWebRtcTransport", json!({"sender": false}))
            .await;
        self.request("transportRecvConnect", json!({"dtlsParameters": dtls()}))
            .await;
        (
            send["id"].as_str().unwrap().to_string(),
            recv["id"].as_str().unwrap().to_string(),
        )
    }

    async fn produce(&self, kind: &str) -> String {
        let data = self
            .request(
                "transportProduce",
                json!({"kind": kind, "rtpParameters": rtp_parameters(kind)}),
            )
            .await;
        data["id"].as_str().unwrap().to_string()
    }

    async fn capabilities(&self) -> Value {
        self.request("getRtpCapabilities", Value::Null).await["rtpCapabilities"].clone()
    }
}

fn dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{"algorithm": "sha-256", "value": "AA:BB:CC"}]
    })
}

fn rtp_parameters(kind: &str) -> Value {
    match kind {
        "audio" => json!({
            "mid": "0",
            "codecs": [{"mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2}],
            "encodings": [{"ssrc": 1111}]
        }),
        _ => json!({
            "mid": "1",
            "codecs": [{"mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000}],
            "encodings": [{"ssrc": 2222}]
        }),
    }
}

#[tokio::test]
async fn test_capabilities_and_transport_params() {
    let (_engine, coordinator) = setup(&config());
    let client = Client::connect(&coordinator).await;

    let caps = client.capabilities().await;
    assert_eq!(caps["codecs"][0]["mimeType"], "audio/opus");
    assert_eq!(caps["codecs"][1]["mimeType"], "video/VP8");
    assert_eq!(caps["codecs"][1]["parameters"]["x-google-start-bitrate"], 1000);

    let transport = client
        .request("createWebRtcTransport", json!({"sender": true}))
        .await;
    assert!(transport["id"].is_string());
    assert_eq!(transport["iceCandidates"][0]["ip"], "127.0.0.1");
    assert!(transport["dtlsParameters"]["fingerprints"].is_array());
    assert!(transport["iceParameters"]["usernameFragment"].is_string());
}

#[tokio::test]
async fn test_new_producer_announced_once_with_both_kinds() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    let mut b = Client::connect(&coordinator).await;
    a.setup_transports().await;
    b.setup_transports().await;
    // b's snapshot: nobody is producing yet
    assert_eq!(b.next_event().await, PeerEvent::RoomJoined(vec![]));

    let video = a.produce("video").await;
    b.assert_no_event();

    let audio = a.produce("audio").await;
    match b.next_event().await {
        PeerEvent::NewProducer { producers, peer_id } => {
            assert_eq!(peer_id, a.peer_id());
            let ids: Vec<&str> = producers.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, vec![video.as_str(), audio.as_str()]);
        }
        other => panic!("expected newProducer, got {other:?}"),
    }
    b.assert_no_event();
}

#[tokio::test]
async fn test_every_producer_policy_announces_single_kind() {
    let mut config = config();
    config.signaling.announce_policy = AnnouncePolicy::EveryProducer;
    let (_engine, coordinator) = setup(&config);
    let a = Client::connect(&coordinator).await;
    let mut b = Client::connect(&coordinator).await;
    a.setup_transports().await;

    a.produce("video").await;
    assert!(matches!(
        b.next_event().await,
        PeerEvent::NewProducer { producers, .. } if producers.len() == 1
    ));
}

#[tokio::test]
async fn test_consume_and_resume() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    let b = Client::connect(&coordinator).await;
    a.setup_transports().await;
    b.setup_transports().await;
    let video = a.produce("video").await;

    let caps = b.capabilities().await;
    let consumer = b
        .request("consume", json!({"producerId": video, "rtpCapabilities": caps}))
        .await;
    assert_eq!(consumer["producerId"], video.as_str());
    assert_eq!(consumer["kind"], "video");
    assert_eq!(consumer["rtpParameters"]["codecs"][0]["payloadType"], 101);

    let ack = b
        .request("consumerResume", json!({"consumerId": consumer["id"]}))
        .await;
    assert_eq!(ack, json!({}));

    // a cannot resume b's consumer
    assert_eq!(
        a.request_err("consumerResume", json!({"consumerId": consumer["id"]}))
            .await,
        "CONSUMER_NOT_FOUND"
    );
}

#[tokio::test]
async fn test_consume_errors() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    let b = Client::connect(&coordinator).await;
    a.setup_transports().await;
    let video = a.produce("video").await;
    let caps = b.capabilities().await;

    assert_eq!(
        b.request_err("consume", json!({"producerId": "missing", "rtpCapabilities": caps}))
            .await,
        "PRODUCER_NOT_FOUND"
    );

    let audio_only = json!({"codecs": [caps["codecs"][0].clone()]});
    assert_eq!(
        b.request_err(
            "consume",
            json!({"producerId": video, "rtpCapabilities": audio_only})
        )
        .await,
        "INCOMPATIBLE_CAPABILITIES"
    );

    // b never created a receiving transport
    assert_eq!(
        b.request_err("consume", json!({"producerId": video, "rtpCapabilities": caps}))
            .await,
        "TRANSPORT_NOT_FOUND"
    );
}

#[tokio::test]
async fn test_produce_without_transport() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;

    assert_eq!(
        a.request_err(
            "transportProduce",
            json!({"kind": "video", "rtpParameters": rtp_parameters("video")})
        )
        .await,
        "TRANSPORT_NOT_FOUND"
    );
    // connect without a transport is a logged no-op
    assert_eq!(
        a.request("transportConnect", json!({"dtlsParameters": dtls()}))
            .await,
        json!({})
    );
}

#[tokio::test]
async fn test_disconnect_cleans_up_and_notifies() {
    let (engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    let mut b = Client::connect(&coordinator).await;
    a.setup_transports().await;
    b.setup_transports().await;
    let _ = b.next_event().await; // roomJoined

    let video = a.produce("video").await;
    a.produce("audio").await;
    let _ = b.next_event().await; // newProducer

    let caps = b.capabilities().await;
    b.request("consume", json!({"producerId": video, "rtpCapabilities": caps}))
        .await;

    let a_id = a.peer_id();
    a.session.close();

    assert_eq!(
        b.next_event().await,
        PeerEvent::ProducerClosed {
            peer_id: a_id.clone()
        }
    );
    // everything was closed before the notification went out
    let registry = coordinator.registry();
    assert!(!registry.contains_peer(&a_id));
    assert_eq!(registry.producer_count(), 0);
    assert_eq!(registry.consumer_count(), 0);
    assert_eq!(engine.stats().producers, 0);
    assert_eq!(engine.stats().consumers, 0);
    assert_eq!(engine.stats().webrtc_transports, 2);

    assert_eq!(
        b.request_err("consume", json!({"producerId": video, "rtpCapabilities": caps}))
            .await,
        "PRODUCER_NOT_FOUND"
    );
}

#[tokio::test]
async fn test_room_snapshot_sent_once() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    a.setup_transports().await;
    let video = a.produce("video").await;
    let audio = a.produce("audio").await;

    let mut c = Client::connect(&coordinator).await;
    c.request("createWebRtcTransport", json!({"sender": true}))
        .await;
    c.request("transportConnect", json!({"dtlsParameters": dtls()}))
        .await;

    match c.next_event().await {
        PeerEvent::RoomJoined(peers) => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, a.peer_id());
            assert_eq!(peers[0].producers[0].id.as_str(), video);
            assert_eq!(peers[0].producers[1].id.as_str(), audio);
        }
        other => panic!("expected roomJoined, got {other:?}"),
    }

    // retried connect with the same parameters
    c.request("transportConnect", json!({"dtlsParameters": dtls()}))
        .await;
    c.assert_no_event();
}

#[tokio::test]
async fn test_requests_without_id_get_no_response() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;

    let frame = json!({"method": "createWebRtcTransport", "data": {"sender": true}}).to_string();
    assert!(a.session.handle_text(&frame).await.is_none());
    // the transport was still created
    assert!(coordinator
        .registry()
        .transport(&a.peer_id(), stagecast_sfu::TransportRole::Producing)
        .is_ok());

    assert!(a.session.handle_text("not json").await.is_none());
}

#[tokio::test]
async fn test_invalid_requests() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;

    assert_eq!(a.request_err("joinRoom", json!({})).await, "INVALID_REQUEST");
    assert_eq!(
        a.request_err("transportProduce", json!({"kind": "screen"}))
            .await,
        "INVALID_REQUEST"
    );

    let reply = a
        .session
        .handle_text(r#"{"id": 9, "data": {}}"#)
        .await
        .expect("response");
    let value = serde_json::to_value(&reply).unwrap();
    assert_eq!(value["id"], 9);
    assert_eq!(value["error"]["code"], "INVALID_REQUEST");
}

#[tokio::test]
async fn test_engine_transport_close_notifies_peers() {
    let (engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    let mut b = Client::connect(&coordinator).await;
    let (send, _) = a.setup_transports().await;
    a.produce("video").await;

    assert!(engine.close_transport_remotely(&TransportId::from(send.as_str())));
    assert_eq!(
        b.next_event().await,
        PeerEvent::ProducerClosed {
            peer_id: a.peer_id()
        }
    );
    assert_eq!(coordinator.registry().producer_count(), 0);
    // the peer itself stays connected
    assert!(coordinator.registry().contains_peer(&a.peer_id()));
}

#[tokio::test]
async fn test_worker_death_raises_fatal_signal() {
    let (engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    let mut fatal = coordinator.fatal_signal();

    engine.kill_worker();
    tokio::time::timeout(WAIT, fatal.wait_for(|dead| *dead))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        a.request_err("createWebRtcTransport", json!({"sender": true}))
            .await,
        "ENGINE_FATAL"
    );
}

#[tokio::test]
async fn test_replacing_producing_transport_closes_producers() {
    let (_engine, coordinator) = setup(&config());
    let a = Client::connect(&coordinator).await;
    a.setup_transports().await;
    a.produce("video").await;

    a.request("createWebRtcTransport", json!({"sender": true}))
        .await;
    assert_eq!(coordinator.registry().producer_count(), 0);
    assert!(coordinator.registry().contains_peer(&a.peer_id()));
}

#[cfg(unix)]
mod transcode {
    use super::*;
    use stagecast_transcode::BridgeState;

    #[tokio::test]
    async fn test_disconnect_stops_bridge_and_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.transcode.program = "sh".to_string();
        config.transcode.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        config.transcode.output_dir = dir.path().to_string_lossy().into_owned();
        config.transcode.stop_grace_period_ms = 500;

        let (engine, coordinator) = setup(&config);
        let bridge = coordinator.bridge().expect("bridge enabled").clone();
        let mut status = bridge.subscribe();

        let a = Client::connect(&coordinator).await;
        a.setup_transports().await;
        a.produce("audio").await;
        let video = a.produce("video").await;

        let active = tokio::time::timeout(WAIT, status.wait_for(|s| s.state == BridgeState::Active))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(active.producer_id.map(|p| p.to_string()), Some(video));
        assert!(dir.path().join("video.sdp").exists());
        assert_eq!(engine.stats().plain_transports, 1);

        a.session.close();
        tokio::time::timeout(WAIT, status.wait_for(|s| s.state == BridgeState::Idle))
            .await
            .unwrap()
            .unwrap();
        assert!(!dir.path().join("video.sdp").exists());
        assert_eq!(engine.stats().plain_transports, 0);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_video_producers_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.transcode.program = "sh".to_string();
        config.transcode.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        config.transcode.output_dir = dir.path().to_string_lossy().into_owned();

        let (engine, coordinator) = setup(&config);
        let bridge = coordinator.bridge().expect("bridge enabled").clone();

        let a = Client::connect(&coordinator).await;
        let b = Client::connect(&coordinator).await;
        a.setup_transports().await;
        b.setup_transports().await;

        let first = a.produce("video").await;
        b.produce("video").await;
        let mut status = bridge.subscribe();
        let active = tokio::time::timeout(WAIT, status.wait_for(|s| s.state == BridgeState::Active))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(active.producer_id.map(|p| p.to_string()), Some(first));
        assert_eq!(engine.stats().plain_transports, 1);

        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_video_produces_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.transcode.program = "sh".to_string();
        config.transcode.args = vec!["-c".to_string(), "exec sleep 30".to_string()];
        config.transcode.output_dir = dir.path().to_string_lossy().into_owned();

        let (engine, coordinator) = setup(&config);
        let bridge = coordinator.bridge().expect("bridge enabled").clone();

        let a = Client::connect(&coordinator).await;
        let b = Client::connect(&coordinator).await;
        a.setup_transports().await;
        b.setup_transports().await;

        let (first, second) = tokio::join!(a.produce("video"), b.produce("video"));
        assert_ne!(first, second);

        let mut status = bridge.subscribe();
        let active = tokio::time::timeout(WAIT, status.wait_for(|s| s.state == BridgeState::Active))
            .await
            .unwrap()
            .unwrap()
            .clone();
        // a joined first, so its producer leads the registry order
        assert_eq!(active.producer_id.map(|p| p.to_string()), Some(first));
        assert_eq!(active.generation, 1);

        // the second registration must not open another session
        tokio::time::sleep(Duration::from_millis(200)).await;
        let settled = bridge.status();
        assert_eq!(settled.state, BridgeState::Active);
        assert_eq!(settled.generation, 1);
        assert_eq!(engine.stats().plain_transports, 1);

        coordinator.shutdown().await;
    }
}
