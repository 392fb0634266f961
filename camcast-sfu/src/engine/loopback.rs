//! In-process media engine that keeps object bookkeeping without moving packets.
//!
//! Used by the test suites and for running the control plane without a real
//! media worker. It models the parts of a real engine the control plane relies
//! on: payload type assignment, codec matching for `can_consume`, cascading
//! close (router → transports → producers/consumers) and worker death.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::{
    Closeable, ConsumeOptions, DeathHandler, EngineError, EngineResult, MediaConsumer,
    MediaEngine, MediaProducer, MediaRouter, MediaTransport, MediaWorker, PlainTransportOptions,
    TransportConnectParams, WebRtcTransportOptions, WorkerSettings,
};
use crate::types::{
    ConsumerId, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpEncodingParameters, RtpParameters, TransportId, WorkerId,
};

/// First dynamic payload type handed out by routers
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// Live object counts, for leak assertions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub workers: usize,
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

#[derive(Default)]
struct Counters {
    workers: AtomicUsize,
    routers: AtomicUsize,
    transports: AtomicUsize,
    producers: AtomicUsize,
    consumers: AtomicUsize,
    next_port: AtomicU32,
    next_ssrc: AtomicU32,
}

impl Counters {
    fn snapshot(&self) -> LoopbackStats {
        LoopbackStats {
            workers: self.workers.load(Ordering::SeqCst),
            routers: self.routers.load(Ordering::SeqCst),
            transports: self.transports.load(Ordering::SeqCst),
            producers: self.producers.load(Ordering::SeqCst),
            consumers: self.consumers.load(Ordering::SeqCst),
        }
    }

    fn ssrc(&self) -> u32 {
        1000 + self.next_ssrc.fetch_add(1, Ordering::Relaxed)
    }
}

struct Shared {
    counters: Counters,
    latency: Duration,
    worker_limit: Option<usize>,
    created_workers: AtomicUsize,
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
}

impl Shared {
    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

/// Loopback media engine handle (cheap to clone)
#[derive(Clone)]
pub struct LoopbackEngine {
    shared: Arc<Shared>,
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::build(Duration::ZERO, None)
    }

    /// Every worker/router/transport/producer/consumer operation takes `latency`
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(latency, None)
    }

    /// Worker creation fails once `limit` workers have been created
    #[must_use]
    pub fn with_worker_limit(limit: usize) -> Self {
        Self::build(Duration::ZERO, Some(limit))
    }

    fn build(latency: Duration, worker_limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                counters: Counters::default(),
                latency,
                worker_limit,
                created_workers: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        self.shared.counters.snapshot()
    }

    /// Every worker created so far, in creation order
    #[must_use]
    pub fn workers(&self) -> Vec<Arc<LoopbackWorker>> {
        self.shared.workers.lock().clone()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>> {
        self.shared.delay().await;
        let index = self.shared.created_workers.fetch_add(1, Ordering::SeqCst);
        if self.shared.worker_limit.is_some_and(|limit| index >= limit) {
            return Err(EngineError::Internal(format!(
                "worker #{index} failed to start"
            )));
        }

        let worker = Arc::new(LoopbackWorker {
            id: WorkerId::new(format!("worker-{index}")),
            settings: settings.clone(),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            death_handlers: Mutex::new(Vec::new()),
            shared: Arc::clone(&self.shared),
        });
        self.shared.counters.workers.fetch_add(1, Ordering::SeqCst);
        self.shared.workers.lock().push(Arc::clone(&worker));
        Ok(worker)
    }
}

pub struct LoopbackWorker {
    id: WorkerId,
    settings: WorkerSettings,
    alive: AtomicBool,
    closed: AtomicBool,
    death_handlers: Mutex<Vec<DeathHandler>>,
    shared: Arc<Shared>,
}

impl LoopbackWorker {
    /// Simulate an unrecoverable worker fault
    pub fn kill(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let handlers = std::mem::take(&mut *self.death_handlers.lock());
        for handler in handlers {
            handler(reason.to_string());
        }
    }
}

#[async_trait]
impl Closeable for LoopbackWorker {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.death_handlers.lock().clear();
        self.shared.counters.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn id(&self) -> &WorkerId {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        Some(std::process::id())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn on_death(&self, handler: DeathHandler) {
        self.death_handlers.lock().push(handler);
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>> {
        self.shared.delay().await;
        if !self.is_alive() {
            return Err(EngineError::WorkerDead(self.id.clone()));
        }

        let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs = media_codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        self.shared.counters.routers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackRouter {
            id: RouterId::generate(),
            worker_id: self.id.clone(),
            state: Arc::new(RouterState {
                capabilities: RtpCapabilities { codecs },
                producers: Mutex::new(HashMap::new()),
                rtc_min_port: self.settings.rtc_min_port,
                rtc_max_port: self.settings.rtc_max_port,
                shared: Arc::clone(&self.shared),
            }),
            transports: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// State shared between a router and its transports
struct RouterState {
    capabilities: RtpCapabilities,
    producers: Mutex<HashMap<ProducerId, Weak<LoopbackProducer>>>,
    rtc_min_port: u16,
    rtc_max_port: u16,
    shared: Arc<Shared>,
}

impl RouterState {
    fn live_producer(&self, producer_id: &ProducerId) -> Option<Arc<LoopbackProducer>> {
        self.producers
            .lock()
            .get(producer_id)
            .and_then(Weak::upgrade)
            .filter(|p| !p.is_closed())
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.rtc_max_port.saturating_sub(self.rtc_min_port)).max(1);
        let offset = self.shared.counters.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX
        self.rtc_min_port.saturating_add(offset as u16)
    }
}

pub struct LoopbackRouter {
    id: RouterId,
    worker_id: WorkerId,
    state: Arc<RouterState>,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
    closed: AtomicBool,
}

impl LoopbackRouter {
    fn new_transport(&self, kind: TransportKind) -> EngineResult<Arc<dyn MediaTransport>> {
        if self.is_closed() {
            return Err(EngineError::RouterClosed(self.id.clone()));
        }
        let transport = Arc::new(LoopbackTransport {
            id: TransportId::generate(),
            kind,
            local_port: self.state.allocate_port(),
            router: Arc::clone(&self.state),
            connected: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.state.shared.counters.transports.fetch_add(1, Ordering::SeqCst);
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[async_trait]
impl Closeable for LoopbackRouter {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports = std::mem::take(&mut *self.transports.lock());
        for transport in transports {
            transport.close().await;
        }
        self.state.shared.counters.routers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.state.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.state.live_producer(producer_id) else {
            return false;
        };
        producer
            .rtp_parameters
            .primary_codec()
            .is_some_and(|codec| rtp_capabilities.find(codec).is_some())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        self.state.shared.delay().await;
        self.new_transport(TransportKind::WebRtc(options.clone()))
    }

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>> {
        self.state.shared.delay().await;
        self.new_transport(TransportKind::Plain(options.clone()))
    }
}

enum TransportKind {
    WebRtc(WebRtcTransportOptions),
    Plain(PlainTransportOptions),
}

pub struct LoopbackTransport {
    id: TransportId,
    kind: TransportKind,
    local_port: u16,
    router: Arc<RouterState>,
    connected: Mutex<Option<TransportConnectParams>>,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            Err(EngineError::TransportClosed(self.id.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Closeable for LoopbackTransport {
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close().await;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close().await;
        }
        self.router
            .shared
            .counters
            .transports
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn connection_parameters(&self) -> serde_json::Value {
        match &self.kind {
            TransportKind::WebRtc(options) => {
                let ip = options.announced_ip.unwrap_or(options.listen_ip);
                serde_json::json!({
                    "iceParameters": {
                        "usernameFragment": nanoid::nanoid!(16),
                        "password": nanoid::nanoid!(32),
                        "iceLite": true,
                    },
                    "iceCandidates": [{
                        "foundation": "udpcandidate",
                        "priority": 1_076_302_079_u32,
                        "ip": ip.to_string(),
                        "port": self.local_port,
                        "protocol": if options.prefer_udp || !options.enable_tcp { "udp" } else { "tcp" },
                        "type": "host",
                    }],
                    "dtlsParameters": {
                        "role": "auto",
                        "fingerprints": [{
                            "algorithm": "sha-256",
                            "value": nanoid::nanoid!(64, &nanoid::alphabet::SAFE),
                        }],
                    },
                })
            }
            TransportKind::Plain(options) => serde_json::json!({
                "tuple": {
                    "localIp": options.listen_ip.to_string(),
                    "localPort": self.local_port,
                    "protocol": "udp",
                },
                "rtcpMux": options.rtcp_mux,
                "comedia": options.comedia,
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn connect(&self, params: TransportConnectParams) -> EngineResult<()> {
        self.router.shared.delay().await;
        self.ensure_open()?;
        match (&self.kind, &params) {
            (TransportKind::WebRtc(_), TransportConnectParams::Dtls(dtls)) if dtls.is_object() => {}
            (TransportKind::Plain(_), TransportConnectParams::Plain { .. }) => {}
            _ => {
                return Err(EngineError::Unsupported(
                    "connect parameters do not match the transport type".to_string(),
                ))
            }
        }
        *self.connected.lock() = Some(params);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>> {
        self.router.shared.delay().await;
        self.ensure_open()?;

        let codec = rtp_parameters
            .primary_codec()
            .ok_or_else(|| EngineError::Unsupported("rtpParameters carry no codec".to_string()))?;
        let supported = self
            .router
            .capabilities
            .find(codec)
            .is_some_and(|cap| cap.kind == kind);
        if !supported {
            return Err(EngineError::Unsupported(format!(
                "{} {} is not enabled on this router",
                kind, codec.mime_type
            )));
        }

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.router.shared),
        });
        self.router
            .shared
            .counters
            .producers
            .fetch_add(1, Ordering::SeqCst);
        self.router
            .producers
            .lock()
            .insert(producer.id.clone(), Arc::downgrade(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(&self, options: ConsumeOptions) -> EngineResult<Arc<dyn MediaConsumer>> {
        self.router.shared.delay().await;
        self.ensure_open()?;

        let producer = self
            .router
            .live_producer(&options.producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(options.producer_id.clone()))?;
        let producer_codec = producer
            .rtp_parameters
            .primary_codec()
            .ok_or_else(|| EngineError::Internal("producer without codec".to_string()))?;
        let capability = options.rtp_capabilities.find(producer_codec).ok_or_else(|| {
            EngineError::Unsupported(format!("peer cannot receive {}", producer_codec.mime_type))
        })?;

        let mut codec = producer_codec.clone();
        if let Some(payload_type) = capability.preferred_payload_type {
            codec.payload_type = payload_type;
        }
        let counters = &self.router.shared.counters;
        let rtp_parameters = RtpParameters {
            mid: Some(counters.consumers.load(Ordering::Relaxed).to_string()),
            codecs: vec![codec],
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(counters.ssrc()),
                rid: None,
            }],
        };

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::generate(),
            producer_id: producer.id.clone(),
            producer: Arc::downgrade(&producer),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(options.paused),
            closed: AtomicBool::new(false),
            shared: Arc::clone(&self.router.shared),
        });
        counters.consumers.fetch_add(1, Ordering::SeqCst);
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }
}

pub struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

#[async_trait]
impl Closeable for LoopbackProducer {
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.counters.producers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    producer: Weak<LoopbackProducer>,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    shared: Arc<Shared>,
}

#[async_trait]
impl Closeable for LoopbackConsumer {
    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.counters.consumers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> &RtpParameters {
        &self.rtp_parameters
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Closed explicitly, or its producer went away
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
            || self.producer.upgrade().map_or(true, |p| p.is_closed())
    }

    async fn resume(&self) -> EngineResult<()> {
        self.shared.delay().await;
        if self.is_closed() {
            return Err(EngineError::ConsumerClosed(self.id.clone()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: None,
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: None,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
            },
        ]
    }

    fn webrtc_options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: None,
            codecs: vec![crate::types::RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
            }],
            encodings: vec![],
        }
    }

    #[tokio::test]
    async fn test_router_assigns_payload_types() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&codecs()).await.unwrap();

        let caps = router.rtp_capabilities();
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
    }

    #[tokio::test]
    async fn test_consume_uses_router_payload_type() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&codecs()).await.unwrap();
        let send = router.create_webrtc_transport(&webrtc_options()).await.unwrap();
        let recv = router.create_webrtc_transport(&webrtc_options()).await.unwrap();

        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        let caps = router.rtp_capabilities();
        assert!(router.can_consume(producer.id(), &caps));

        let consumer = recv
            .consume(ConsumeOptions {
                producer_id: producer.id().clone(),
                rtp_capabilities: caps,
                paused: true,
            })
            .await
            .unwrap();
        assert!(consumer.is_paused());
        assert_eq!(consumer.rtp_parameters().codecs[0].payload_type, 101);

        consumer.resume().await.unwrap();
        assert!(!consumer.is_paused());
    }

    #[tokio::test]
    async fn test_closing_router_cascades() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&codecs()).await.unwrap();
        let send = router.create_webrtc_transport(&webrtc_options()).await.unwrap();
        let producer = send.produce(MediaKind::Video, vp8_parameters()).await.unwrap();
        assert_eq!(engine.stats().producers, 1);

        router.close().await;
        assert!(send.is_closed());
        assert!(producer.is_closed());
        assert!(!router.can_consume(producer.id(), &router.rtp_capabilities()));

        let stats = engine.stats();
        assert_eq!(stats.routers, 0);
        assert_eq!(stats.transports, 0);
        assert_eq!(stats.producers, 0);
        assert_eq!(stats.workers, 1);
    }

    #[tokio::test]
    async fn test_kill_fires_death_handlers_once() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        worker.on_death(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        engine.workers()[0].kill("segfault");
        engine.workers()[0].kill("segfault again");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!worker.is_alive());
        assert!(worker.create_router(&codecs()).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_rejects_unknown_codec() {
        let engine = LoopbackEngine::new();
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();
        let router = worker.create_router(&codecs()).await.unwrap();
        let send = router.create_webrtc_transport(&webrtc_options()).await.unwrap();

        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/AV1".to_string();
        assert!(send.produce(MediaKind::Video, params).await.is_err());
        // kind must agree with the codec
        assert!(send.produce(MediaKind::Audio, vp8_parameters()).await.is_err());
    }
}
