//! Media engine capability consumed by the control plane.
//!
//! The byte-level engine (ICE/DTLS/SRTP, RTP forwarding) lives behind these
//! traits. The control plane only creates, connects and closes the objects
//! and never touches packets. [`loopback`] ships an in-process implementation
//! that keeps the bookkeeping without moving media.

pub mod loopback;

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{
    ConsumerId, MediaKind, ProducerId, RouterId, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportId, WorkerId,
};

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("worker {0} is not alive")]
    WorkerDead(WorkerId),

    #[error("router {0} is closed")]
    RouterClosed(RouterId),

    #[error("transport {0} is closed")]
    TransportClosed(TransportId),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("consumer {0} is closed")]
    ConsumerClosed(ConsumerId),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Internal(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Settings every worker is launched with
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            log_level: "warn".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// Passive RTP transport. With `comedia` off the engine sends to the address
/// given in [`TransportConnectParams::Plain`] instead of waiting for a peer.
#[derive(Debug, Clone)]
pub struct PlainTransportOptions {
    pub listen_ip: IpAddr,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

#[derive(Debug, Clone)]
pub enum TransportConnectParams {
    /// DTLS parameters from a WebRTC peer, opaque to the control plane
    Dtls(serde_json::Value),
    /// Destination for a plain transport
    Plain {
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
    pub paused: bool,
}

pub type DeathHandler = Box<dyn FnOnce(String) + Send + 'static>;

/// Anything the engine can tear down
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Idempotent
    async fn close(&self);
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self, settings: &WorkerSettings) -> EngineResult<Arc<dyn MediaWorker>>;
}

#[async_trait]
pub trait MediaWorker: Closeable {
    fn id(&self) -> &WorkerId;

    /// OS process id, for diagnostics only
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Register a handler fired once if the worker dies unexpectedly
    fn on_death(&self, handler: DeathHandler);

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> EngineResult<Arc<dyn MediaRouter>>;
}

#[async_trait]
pub trait MediaRouter: Closeable {
    fn id(&self) -> &RouterId;

    fn worker_id(&self) -> &WorkerId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Compatibility predicate checked before any consumer is created
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    fn is_closed(&self) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>>;

    async fn create_plain_transport(
        &self,
        options: &PlainTransportOptions,
    ) -> EngineResult<Arc<dyn MediaTransport>>;
}

#[async_trait]
pub trait MediaTransport: Closeable {
    fn id(&self) -> &TransportId;

    /// ICE candidates, ICE and DTLS parameters handed to the remote peer
    fn connection_parameters(&self) -> serde_json::Value;

    fn is_closed(&self) -> bool;

    async fn connect(&self, params: TransportConnectParams) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn MediaProducer>>;

    async fn consume(&self, options: ConsumeOptions) -> EngineResult<Arc<dyn MediaConsumer>>;
}

pub trait MediaProducer: Closeable {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> &RtpParameters;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait MediaConsumer: Closeable {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> &RtpParameters;

    fn is_paused(&self) -> bool;

    fn is_closed(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;
}
