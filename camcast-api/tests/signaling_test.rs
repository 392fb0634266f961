// Signaling scenarios driven through the gateway against the loopback engine

use async_trait::async_trait;
use camcast_api::gateway::{Gateway, SignalStream, SignalingSession};
use camcast_api::protocol::{Response, ServerMessage};
use camcast_core::RecordingConfig;
use camcast_sfu::engine::loopback::{LoopbackEngine, LoopbackStats};
use camcast_sfu::recording::Uploader;
use camcast_sfu::{
    MediaKind, Recorder, RecordingState, RoomId, RoomNotification, RoomRegistry, SfuConfig,
    WorkerPool,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct RecordingUploader {
    attempts: parking_lot::Mutex<Vec<String>>,
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(&self, _local_path: &Path, remote_name: &str) -> camcast_sfu::Result<()> {
        self.attempts.lock().push(remote_name.to_string());
        Ok(())
    }
}

struct Harness {
    engine: LoopbackEngine,
    gateway: Arc<Gateway>,
    uploader: Arc<RecordingUploader>,
    _output: tempfile::TempDir,
}

impl Harness {
    fn registry(&self) -> &Arc<RoomRegistry> {
        self.gateway.registry()
    }
}

async fn harness(min_port: u16) -> Harness {
    let engine = LoopbackEngine::new();
    let config = SfuConfig {
        num_workers: 2,
        request_timeout: Duration::from_secs(5),
        ..SfuConfig::default()
    };
    let pool = WorkerPool::initialize(Arc::new(engine.clone()), &config).await.unwrap();
    let registry = Arc::new(RoomRegistry::new(pool, 0));

    let output = tempfile::tempdir().unwrap();
    let mut recording = RecordingConfig {
        output_dir: output.path().to_string_lossy().into_owned(),
        min_port,
        max_port: min_port + 99,
        stop_grace_secs: 2,
        ..RecordingConfig::default()
    };
    recording.decoder.program = "sh".to_string();
    recording.decoder.args = vec![
        "-c".to_string(),
        "test -f \"$0\" && touch \"$1\" && exec sleep 30".to_string(),
        "{sdp}".to_string(),
        "{output}".to_string(),
    ];
    let uploader = Arc::new(RecordingUploader::default());
    let recorder = Arc::new(
        Recorder::new(recording, uploader.clone(), config.request_timeout).unwrap(),
    );

    Harness {
        engine,
        gateway: Arc::new(Gateway::new(registry, recorder, config)),
        uploader,
        _output: output,
    }
}

struct Peer {
    session: SignalingSession,
    notifications: mpsc::Receiver<RoomNotification>,
    next_id: u64,
}

impl Peer {
    fn new(h: &Harness) -> Self {
        let (session, notifications) = h.gateway.connect();
        Self {
            session,
            notifications,
            next_id: 0,
        }
    }

    async fn call(&mut self, method: &str, data: Value) -> Response {
        self.next_id += 1;
        let frame = json!({ "id": self.next_id, "method": method, "data": data });
        let response = self.session.handle_frame(&frame.to_string()).await;
        assert_eq!(response.id, self.next_id);
        response
    }

    async fn ok(&mut self, method: &str, data: Value) -> Value {
        let response = self.call(method, data).await;
        assert!(response.ok, "{method} failed: {:?}", response.error);
        response.data.unwrap_or(Value::Null)
    }

    async fn err(&mut self, method: &str, data: Value) -> String {
        let response = self.call(method, data).await;
        assert!(!response.ok, "{method} unexpectedly succeeded");
        response.error.unwrap_or_default()
    }

    async fn join(&mut self, room: &str, role: &str) -> Value {
        self.ok("join-room", json!({ "roomId": room, "role": role })).await
    }

    /// Create and connect a transport, returning its id
    async fn transport(&mut self, room: &str, direction: &str) -> String {
        let created = self
            .ok("create-transport", json!({ "roomId": room, "direction": direction }))
            .await;
        let id = created["id"].as_str().unwrap().to_string();
        assert!(created.get("iceParameters").is_some());
        self.ok(
            "connect-transport",
            json!({
                "roomId": room,
                "transportId": id,
                "dtlsParameters": { "role": "client", "fingerprints": [] }
            }),
        )
        .await;
        id
    }
}

fn vp8() -> Value {
    json!({
        "mid": "0",
        "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
        "encodings": [{ "ssrc": 1111 }]
    })
}

fn opus() -> Value {
    json!({
        "mid": "1",
        "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2 }],
        "encodings": [{ "ssrc": 2222 }]
    })
}

async fn publish(peer: &mut Peer, room: &str, transport: &str, kind: &str, rtp: Value) -> String {
    let reply = peer
        .ok(
            "produce",
            json!({ "roomId": room, "transportId": transport, "kind": kind, "rtpParameters": rtp }),
        )
        .await;
    reply["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_new_producer_reaches_everyone_but_the_publisher() {
    let h = harness(33000).await;
    let mut camera = Peer::new(&h);
    let mut viewers = vec![Peer::new(&h), Peer::new(&h)];

    camera.join("cam-1", "producer").await;
    for viewer in &mut viewers {
        viewer.join("cam-1", "viewer").await;
    }

    let send = camera.transport("cam-1", "send").await;
    let producer_id = publish(&mut camera, "cam-1", &send, "video", vp8()).await;

    for viewer in &mut viewers {
        match viewer.notifications.try_recv().unwrap() {
            RoomNotification::NewProducer { producer_id: id, kind } => {
                assert_eq!(id.as_str(), producer_id);
                assert_eq!(kind, camcast_sfu::MediaKind::Video);
            }
        }
    }
    assert!(camera.notifications.try_recv().is_err());
}

#[tokio::test]
async fn test_incompatible_viewer_cannot_consume() {
    let h = harness(33100).await;
    let mut camera = Peer::new(&h);
    let mut viewer = Peer::new(&h);

    camera.join("cam-1", "producer").await;
    let send = camera.transport("cam-1", "send").await;
    let producer_id = publish(&mut camera, "cam-1", &send, "video", vp8()).await;

    viewer.join("cam-1", "viewer").await;
    let recv = viewer.transport("cam-1", "recv").await;
    let error = viewer
        .err(
            "consume",
            json!({
                "roomId": "cam-1",
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": {
                    "codecs": [{ "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }]
                }
            }),
        )
        .await;

    assert_eq!(error, "Cannot consume");
    assert_eq!(h.engine.stats().consumers, 0);
    assert_eq!(h.registry().stats().await.rooms[0].consumer_count, 0);
}

#[tokio::test]
async fn test_session_rules() {
    let h = harness(33200).await;
    let mut peer = Peer::new(&h);

    let error = peer
        .err("create-transport", json!({ "roomId": "cam-1", "direction": "send" }))
        .await;
    assert_eq!(error, "Not joined to room");

    peer.join("cam-1", "producer").await;
    assert_eq!(peer.err("join-room", json!({ "roomId": "cam-2", "role": "viewer" })).await, "Already joined");
    assert_eq!(
        peer.err("create-transport", json!({ "roomId": "cam-2", "direction": "send" }))
            .await,
        "Not joined to room"
    );

    // Media goes the wrong way on a recv transport
    let recv = peer.transport("cam-1", "recv").await;
    let error = peer
        .err(
            "produce",
            json!({ "roomId": "cam-1", "transportId": recv, "kind": "video", "rtpParameters": vp8() }),
        )
        .await;
    assert_eq!(error, "Transport is not a send transport");

    let error = peer
        .err(
            "connect-transport",
            json!({ "roomId": "cam-1", "transportId": "nope", "dtlsParameters": {} }),
        )
        .await;
    assert_eq!(error, "Transport not found");

    let send = peer.transport("cam-1", "send").await;
    publish(&mut peer, "cam-1", &send, "video", vp8()).await;
    let error = peer
        .err(
            "produce",
            json!({ "roomId": "cam-1", "transportId": send, "kind": "video", "rtpParameters": vp8() }),
        )
        .await;
    assert_eq!(error, "Producer already exists");
    assert_eq!(h.engine.stats().producers, 1);
}

#[tokio::test]
async fn test_peers_cannot_use_each_others_transports() {
    let h = harness(33800).await;
    let mut camera = Peer::new(&h);
    let mut viewer = Peer::new(&h);

    camera.join("cam-1", "producer").await;
    let capabilities = viewer.join("cam-1", "viewer").await["rtpCapabilities"].clone();
    let send = camera.transport("cam-1", "send").await;

    let error = viewer
        .err(
            "connect-transport",
            json!({ "roomId": "cam-1", "transportId": send, "dtlsParameters": {} }),
        )
        .await;
    assert_eq!(error, "Transport not found");

    let error = viewer
        .err(
            "produce",
            json!({ "roomId": "cam-1", "transportId": send, "kind": "video", "rtpParameters": vp8() }),
        )
        .await;
    assert_eq!(error, "Transport not found");
    assert_eq!(h.engine.stats().producers, 0);

    // Same for the viewer's recv transport and consumer
    let producer_id = publish(&mut camera, "cam-1", &send, "video", vp8()).await;
    let recv = viewer.transport("cam-1", "recv").await;
    let error = camera
        .err(
            "consume",
            json!({
                "roomId": "cam-1",
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": capabilities,
            }),
        )
        .await;
    assert_eq!(error, "Transport not found");

    let consumed = viewer
        .ok(
            "consume",
            json!({
                "roomId": "cam-1",
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": capabilities,
            }),
        )
        .await;
    let error = camera
        .err("resume-consumer", json!({ "roomId": "cam-1", "consumerId": consumed["id"] }))
        .await;
    assert_eq!(error, "Consumer not found");
    assert_eq!(h.registry().stats().await.rooms[0].consumer_count, 1);
}

#[tokio::test]
async fn test_malformed_frames_get_error_replies() {
    let h = harness(33300).await;
    let mut peer = Peer::new(&h);

    let response = peer.session.handle_frame("{ not json").await;
    assert_eq!(response.id, 0);
    assert!(!response.ok);

    let response = peer
        .session
        .handle_frame(r#"{"id": 12, "method": "join-room", "data": {"roomId": 5}}"#)
        .await;
    assert_eq!(response.id, 12);
    assert!(response.error.unwrap().starts_with("Malformed request"));

    let response = peer.session.handle_frame(r#"{"id": 13, "method": "leave"}"#).await;
    assert_eq!(response.error.as_deref(), Some("Unknown method: leave"));

    // Still usable afterwards
    peer.join("cam-1", "viewer").await;
}

#[tokio::test]
async fn test_camera_viewer_recording_end_to_end() {
    let h = harness(33400).await;
    let mut camera = Peer::new(&h);
    let mut viewer = Peer::new(&h);

    let joined = camera.join("cam-1", "producer").await;
    assert!(joined["producers"].as_array().unwrap().is_empty());
    let send = camera.transport("cam-1", "send").await;
    let video = publish(&mut camera, "cam-1", &send, "video", vp8()).await;
    let audio = publish(&mut camera, "cam-1", &send, "audio", opus()).await;

    // A late viewer learns about existing producers from the join reply
    let joined = viewer.join("cam-1", "viewer").await;
    let producers = joined["producers"].as_array().unwrap();
    assert_eq!(producers.len(), 2);
    let capabilities = joined["rtpCapabilities"].clone();

    let recv = viewer.transport("cam-1", "recv").await;
    for (producer_id, kind, mime_type) in [(&video, "video", "video/VP8"), (&audio, "audio", "audio/opus")] {
        let consumed = viewer
            .ok(
                "consume",
                json!({
                    "roomId": "cam-1",
                    "transportId": recv,
                    "producerId": producer_id,
                    "rtpCapabilities": capabilities,
                }),
            )
            .await;
        assert_eq!(consumed["producerId"].as_str().unwrap(), producer_id.as_str());
        assert_eq!(consumed["kind"], kind);
        assert_eq!(consumed["rtpParameters"]["codecs"][0]["mimeType"], mime_type);
        viewer
            .ok(
                "resume-consumer",
                json!({ "roomId": "cam-1", "consumerId": consumed["id"] }),
            )
            .await;
    }

    camera.ok("start-recording", json!({ "roomId": "cam-1" })).await;
    assert_eq!(
        viewer.err("start-recording", json!({ "roomId": "cam-1" })).await,
        "Recording already in progress"
    );
    assert!(h.registry().stats().await.rooms[0].recording);
    let recording = {
        let room = h.registry().get(&RoomId::from("cam-1")).unwrap();
        let state = room.lock().await;
        Arc::clone(state.recording().unwrap())
    };
    assert_eq!(recording.kinds(), vec![MediaKind::Audio, MediaKind::Video]);

    camera.ok("stop-recording", json!({ "roomId": "cam-1" })).await;
    assert_eq!(
        camera.err("stop-recording", json!({ "roomId": "cam-1" })).await,
        "Recording not found"
    );

    // The decoder is stopped and the file handed to storage in the background
    tokio::time::timeout(Duration::from_secs(10), async {
        while h.uploader.attempts.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("recording was never uploaded");
    assert!(h.uploader.attempts.lock()[0].starts_with("cam-1/cam-1-"));
    let state = tokio::time::timeout(Duration::from_secs(10), recording.wait_closed())
        .await
        .expect("recording never closed");
    assert_eq!(state, RecordingState::Closed);
    assert!(!recording.output_path().exists());
    assert!(!h.registry().stats().await.rooms[0].recording);

    camera.session.disconnect().await;
    assert_eq!(h.registry().room_count(), 1);
    viewer.session.disconnect().await;
    assert_eq!(h.registry().room_count(), 0);
    assert_eq!(h.registry().pool().router_count(), 0);
    assert_eq!(
        h.engine.stats(),
        LoopbackStats {
            workers: 2,
            ..LoopbackStats::default()
        }
    );
}

#[tokio::test]
async fn test_late_requests_on_deleted_room() {
    let h = harness(33500).await;
    let mut camera = Peer::new(&h);
    let mut viewer = Peer::new(&h);

    camera.join("cam-1", "producer").await;
    let send = camera.transport("cam-1", "send").await;
    let producer_id = publish(&mut camera, "cam-1", &send, "video", vp8()).await;

    let joined = viewer.join("cam-1", "viewer").await;
    let recv = viewer.transport("cam-1", "recv").await;
    let consumed = viewer
        .ok(
            "consume",
            json!({
                "roomId": "cam-1",
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": joined["rtpCapabilities"],
            }),
        )
        .await;

    // Room torn down underneath the viewer's connection
    let room_id = RoomId::from("cam-1");
    h.registry().leave(&room_id, camera.session.peer_id()).await;
    h.registry().leave(&room_id, viewer.session.peer_id()).await;
    assert!(h.registry().delete_room(&room_id).await);

    assert_eq!(
        viewer
            .err("resume-consumer", json!({ "roomId": "cam-1", "consumerId": consumed["id"] }))
            .await,
        "Consumer not found"
    );
    assert_eq!(
        viewer.err("stop-recording", json!({ "roomId": "cam-1" })).await,
        "Recording not found"
    );
    assert_eq!(
        viewer.err("start-recording", json!({ "roomId": "cam-1" })).await,
        "Room or producer not found"
    );

    // Disconnecting afterwards is harmless
    viewer.session.disconnect().await;
    camera.session.disconnect().await;
    assert_eq!(h.registry().room_count(), 0);
}

#[tokio::test]
async fn test_resume_after_producer_left() {
    let h = harness(33600).await;
    let mut camera = Peer::new(&h);
    let mut viewer = Peer::new(&h);

    camera.join("cam-1", "producer").await;
    let send = camera.transport("cam-1", "send").await;
    let producer_id = publish(&mut camera, "cam-1", &send, "video", vp8()).await;

    let joined = viewer.join("cam-1", "viewer").await;
    let recv = viewer.transport("cam-1", "recv").await;
    let consumed = viewer
        .ok(
            "consume",
            json!({
                "roomId": "cam-1",
                "transportId": recv,
                "producerId": producer_id,
                "rtpCapabilities": joined["rtpCapabilities"],
            }),
        )
        .await;

    camera.session.disconnect().await;
    assert_eq!(h.registry().room_count(), 1);

    assert_eq!(
        viewer
            .err("resume-consumer", json!({ "roomId": "cam-1", "consumerId": consumed["id"] }))
            .await,
        "Consumer not found"
    );
    assert_eq!(h.registry().stats().await.rooms[0].consumer_count, 0);
}

/// In-memory duplex stream for driving `SignalingSession::run`
struct ChannelStream {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl SignalStream for ChannelStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        self.inbound.recv().await.map(Ok)
    }

    fn send(&self, message: ServerMessage) -> Result<(), String> {
        let text = message.encode()?;
        self.outbound.send(text).map_err(|e| e.to_string())
    }

    fn is_alive(&self) -> bool {
        !self.outbound.is_closed()
    }
}

#[tokio::test]
async fn test_run_loop_replies_and_cleans_up() {
    let h = harness(33700).await;
    let (session, notifications) = h.gateway.connect();
    let (client_tx, inbound) = mpsc::channel(8);
    let (outbound, mut client_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut stream = ChannelStream { inbound, outbound };
        session.run(&mut stream, notifications).await;
    });

    client_tx
        .send(r#"{"id": 1, "method": "join-room", "data": {"roomId": "cam-9", "role": "viewer"}}"#.to_string())
        .await
        .unwrap();
    let reply: Value = serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["ok"], true);
    assert!(reply["data"]["rtpCapabilities"]["codecs"].is_array());

    // A publisher joining later triggers a notification on this connection
    let mut camera = Peer::new(&h);
    camera.join("cam-9", "producer").await;
    let send = camera.transport("cam-9", "send").await;
    publish(&mut camera, "cam-9", &send, "video", vp8()).await;
    let notification: Value = serde_json::from_str(&client_rx.recv().await.unwrap()).unwrap();
    assert_eq!(notification["notification"], "new-producer");
    assert_eq!(notification["data"]["kind"], "video");

    drop(client_tx);
    task.await.unwrap();
    camera.session.disconnect().await;
    assert_eq!(h.registry().room_count(), 0);
}
