//! Session Gateway
//!
//! One [`SignalingSession`] per connection, `Connected -> Joined -> closed`.
//! Every media operation needs the connection to have joined the room it
//! names. Engine round trips are bounded by the configured request timeout;
//! an object the engine creates after the deadline is closed.

use async_trait::async_trait;
use camcast_sfu::engine::{ConsumeOptions, MediaTransport, TransportConnectParams};
use camcast_sfu::{
    bounded, create_bounded, PeerId, PeerRole, Recorder, RoomId, RoomNotification, RoomRegistry,
    SfuConfig, SfuError, TransportDirection, TransportId,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{SignalError, SignalResult};
use crate::protocol::{
    transport_reply, ClientRequest, Consume, ConsumeReply, ConnectTransport, CreateTransport,
    JoinRoom, JoinRoomReply, Produce, ProduceReply, ProducerInfo, Request, Response,
    ResumeConsumer, ServerMessage,
};

/// Notifications buffered per connection before they are dropped
const NOTIFICATION_BUFFER: usize = 64;

/// Duplex signaling transport
///
/// Implemented by the WebSocket handler; tests drive sessions directly.
#[async_trait]
pub trait SignalStream: Send {
    /// Next text frame; `None` once the peer is gone
    async fn recv(&mut self) -> Option<Result<String, String>>;

    fn send(&self, message: ServerMessage) -> Result<(), String>;

    fn is_alive(&self) -> bool;
}

/// Shared by every connection
pub struct Gateway {
    registry: Arc<RoomRegistry>,
    recorder: Arc<Recorder>,
    config: SfuConfig,
}

impl Gateway {
    pub fn new(registry: Arc<RoomRegistry>, recorder: Arc<Recorder>, config: SfuConfig) -> Self {
        Self {
            registry,
            recorder,
            config,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Open a session for a new connection, with the receiving end of its
    /// notification channel
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> (SignalingSession, mpsc::Receiver<RoomNotification>) {
        let (notifier, notifications) = mpsc::channel(NOTIFICATION_BUFFER);
        let session = SignalingSession {
            gateway: Arc::clone(self),
            peer_id: PeerId::generate(),
            state: SessionState::Connected,
            notifier,
        };
        debug!(peer_id = %session.peer_id, "Signaling session opened");
        (session, notifications)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    Connected,
    Joined { room_id: RoomId, role: PeerRole },
    Closed,
}

pub struct SignalingSession {
    gateway: Arc<Gateway>,
    peer_id: PeerId,
    state: SessionState,
    notifier: mpsc::Sender<RoomNotification>,
}

impl SignalingSession {
    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Room this connection joined, if any
    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        match &self.state {
            SessionState::Joined { room_id, .. } => Some(room_id),
            _ => None,
        }
    }

    #[must_use]
    pub const fn role(&self) -> Option<PeerRole> {
        match &self.state {
            SessionState::Joined { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// Serve the connection until the peer goes away, then leave the room
    pub async fn run<S: SignalStream>(
        mut self,
        stream: &mut S,
        mut notifications: mpsc::Receiver<RoomNotification>,
    ) {
        loop {
            if !stream.is_alive() {
                debug!(peer_id = %self.peer_id, "Writer gone, closing session");
                break;
            }

            tokio::select! {
                frame = stream.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            let reply = self.handle_frame(&text).await;
                            if let Err(e) = stream.send(reply.into()) {
                                warn!(peer_id = %self.peer_id, error = %e, "Failed to send reply");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(peer_id = %self.peer_id, error = %e, "Error receiving frame");
                            break;
                        }
                        None => {
                            debug!(peer_id = %self.peer_id, "Client disconnected");
                            break;
                        }
                    }
                }

                Some(notification) = notifications.recv() => {
                    if let Err(e) = stream.send(notification.into()) {
                        warn!(peer_id = %self.peer_id, error = %e, "Failed to send notification");
                        break;
                    }
                }
            }
        }

        self.disconnect().await;
    }

    /// Decode and answer one frame
    pub async fn handle_frame(&mut self, text: &str) -> Response {
        match ClientRequest::decode(text) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                debug!(peer_id = %self.peer_id, id = e.id, error = %e.error, "Rejected frame");
                Response::failure(e.id, e.error.client_message())
            }
        }
    }

    pub async fn handle_request(&mut self, request: ClientRequest) -> Response {
        let method = request.request.method();
        match self.handle(request.request).await {
            Ok(data) => Response::success(request.id, data),
            Err(e) => {
                if e.is_internal() {
                    error!(peer_id = %self.peer_id, method, error = %e, "Request failed");
                } else {
                    debug!(peer_id = %self.peer_id, method, error = %e, "Request rejected");
                }
                Response::failure(request.id, e.client_message())
            }
        }
    }

    /// Execute one request; `Ok(None)` is a bare acknowledgement
    pub async fn handle(&mut self, request: Request) -> SignalResult<Option<Value>> {
        match request {
            Request::JoinRoom(req) => self.join_room(req).await,
            Request::CreateTransport(req) => self.create_transport(req).await,
            Request::ConnectTransport(req) => self.connect_transport(req).await,
            Request::Produce(req) => self.produce(req).await,
            Request::Consume(req) => self.consume(req).await,
            Request::ResumeConsumer(req) => self.resume_consumer(req).await,
            Request::StartRecording(req) => {
                self.joined(&req.room_id)?;
                let gateway = &self.gateway;
                gateway
                    .registry
                    .start_recording(&req.room_id, &gateway.recorder)
                    .await?;
                Ok(None)
            }
            Request::StopRecording(req) => {
                self.joined(&req.room_id)?;
                self.gateway.registry.stop_recording(&req.room_id).await?;
                Ok(None)
            }
        }
    }

    /// Leave the joined room, deleting it when this was the last member
    pub async fn disconnect(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Joined { room_id, .. } = state {
            let registry = &self.gateway.registry;
            let remaining = registry.leave(&room_id, &self.peer_id).await;
            if remaining == 0 {
                registry.delete_room(&room_id).await;
            }
        }
        debug!(peer_id = %self.peer_id, "Signaling session closed");
    }

    fn joined(&self, room_id: &RoomId) -> SignalResult<()> {
        match &self.state {
            SessionState::Joined { room_id: joined, .. } if joined == room_id => Ok(()),
            _ => Err(SignalError::NotJoined),
        }
    }

    async fn join_room(&mut self, req: JoinRoom) -> SignalResult<Option<Value>> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Joined { .. } => return Err(SignalError::AlreadyJoined),
            SessionState::Closed => return Err(SignalError::NotJoined),
        }

        let room = self
            .gateway
            .registry
            .join(&req.room_id, &self.peer_id, req.role, self.notifier.clone())
            .await?;
        let producers = room
            .lock()
            .await
            .producers()
            .map(|p| ProducerInfo {
                producer_id: p.id().clone(),
                kind: p.kind(),
            })
            .collect();

        self.state = SessionState::Joined {
            room_id: req.room_id,
            role: req.role,
        };
        reply(&JoinRoomReply {
            rtp_capabilities: room.router().rtp_capabilities(),
            producers,
        })
    }

    async fn create_transport(&self, req: CreateTransport) -> SignalResult<Option<Value>> {
        self.joined(&req.room_id)?;
        let registry = &self.gateway.registry;
        let room = registry
            .get(&req.room_id)
            .ok_or_else(|| SfuError::RoomNotFound(req.room_id.clone()))?;

        let router = Arc::clone(room.router());
        let options = self.gateway.config.webrtc_transport.clone();
        let transport = create_bounded(
            self.gateway.config.request_timeout,
            "webrtc transport",
            async move { router.create_webrtc_transport(&options).await },
        )
        .await?;

        let transport_id = transport.id().clone();
        let parameters = transport.connection_parameters();
        if !registry
            .add_transport(&req.room_id, transport, req.direction, &self.peer_id)
            .await?
        {
            return Err(SfuError::RoomNotFound(req.room_id).into());
        }

        info!(
            room_id = %req.room_id,
            peer_id = %self.peer_id,
            transport_id = %transport_id,
            direction = %req.direction,
            "Transport created"
        );
        Ok(Some(transport_reply(&transport_id, parameters)))
    }

    async fn connect_transport(&self, req: ConnectTransport) -> SignalResult<Option<Value>> {
        self.joined(&req.room_id)?;
        let (transport, _) = self
            .gateway
            .registry
            .get_transport(&req.room_id, &req.transport_id, &self.peer_id)
            .await
            .ok_or_else(|| SfuError::TransportNotFound(req.transport_id.clone()))?;

        bounded(
            self.gateway.config.request_timeout,
            "connect",
            transport.connect(TransportConnectParams::Dtls(req.dtls_parameters)),
        )
        .await?;
        Ok(None)
    }

    async fn produce(&self, req: Produce) -> SignalResult<Option<Value>> {
        self.joined(&req.room_id)?;
        let registry = &self.gateway.registry;
        let transport = self
            .directed_transport(&req.room_id, &req.transport_id, TransportDirection::Send)
            .await?;

        // Fail fast on an occupied slot; add_producer re-checks atomically
        let room = registry
            .get(&req.room_id)
            .ok_or_else(|| SfuError::RoomNotFound(req.room_id.clone()))?;
        if !room.lock().await.producer_slot_free(req.kind) {
            return Err(SfuError::ProducerExists(req.kind).into());
        }

        let kind = req.kind;
        let rtp_parameters = req.rtp_parameters;
        let producer = create_bounded(
            self.gateway.config.request_timeout,
            "produce",
            async move { transport.produce(kind, rtp_parameters).await },
        )
        .await?;

        let producer_id = producer.id().clone();
        registry
            .add_producer(&req.room_id, producer, &req.transport_id, &self.peer_id)
            .await?;
        reply(&ProduceReply { id: producer_id })
    }

    async fn consume(&self, req: Consume) -> SignalResult<Option<Value>> {
        self.joined(&req.room_id)?;
        let registry = &self.gateway.registry;
        let transport = self
            .directed_transport(&req.room_id, &req.transport_id, TransportDirection::Recv)
            .await?;

        let room = registry
            .get(&req.room_id)
            .ok_or_else(|| SfuError::RoomNotFound(req.room_id.clone()))?;
        if !room
            .router()
            .can_consume(&req.producer_id, &req.rtp_capabilities)
        {
            return Err(SfuError::CannotConsume.into());
        }

        let options = ConsumeOptions {
            producer_id: req.producer_id.clone(),
            rtp_capabilities: req.rtp_capabilities,
            paused: true,
        };
        let consumer = create_bounded(
            self.gateway.config.request_timeout,
            "consume",
            async move { transport.consume(options).await },
        )
        .await?;

        let consumer_reply = ConsumeReply {
            id: consumer.id().clone(),
            producer_id: consumer.producer_id().clone(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
        };
        if !registry
            .add_consumer(&req.room_id, consumer, &req.transport_id, &self.peer_id)
            .await?
        {
            return Err(SfuError::RoomNotFound(req.room_id).into());
        }
        reply(&consumer_reply)
    }

    async fn resume_consumer(&self, req: ResumeConsumer) -> SignalResult<Option<Value>> {
        self.joined(&req.room_id)?;
        let registry = &self.gateway.registry;
        let consumer = registry
            .get_consumer(&req.room_id, &req.consumer_id, &self.peer_id)
            .await
            .ok_or_else(|| SfuError::ConsumerNotFound(req.consumer_id.clone()))?;

        if consumer.is_closed() {
            // Producer went away in the meantime
            registry.remove_consumer(&req.room_id, &req.consumer_id).await;
            return Err(SfuError::ConsumerNotFound(req.consumer_id).into());
        }

        bounded(
            self.gateway.config.request_timeout,
            "resume",
            consumer.resume(),
        )
        .await?;
        Ok(None)
    }

    async fn directed_transport(
        &self,
        room_id: &RoomId,
        transport_id: &TransportId,
        expected: TransportDirection,
    ) -> SignalResult<Arc<dyn MediaTransport>> {
        let (transport, direction) = self
            .gateway
            .registry
            .get_transport(room_id, transport_id, &self.peer_id)
            .await
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
        if direction != expected {
            return Err(SfuError::WrongDirection {
                transport_id: transport_id.clone(),
                expected,
            }
            .into());
        }
        Ok(transport)
    }
}

fn reply<T: Serialize>(data: &T) -> SignalResult<Option<Value>> {
    serde_json::to_value(data)
        .map(Some)
        .map_err(|e| SfuError::Internal(format!("failed to encode reply: {e}")).into())
}
