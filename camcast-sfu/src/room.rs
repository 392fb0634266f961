//! Per-room state: members, transports, producer slots, consumers and the
//! recording slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::engine::{MediaConsumer, MediaProducer, MediaRouter, MediaTransport};
use crate::error::{Result, SfuError};
use crate::recording::RecordingSession;
use crate::types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId,
};

/// What a connection joined the room as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Producer,
    Viewer,
}

/// Pushed to members without a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomNotification {
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
    },
}

pub struct Member {
    pub role: PeerRole,
    notifier: mpsc::Sender<RoomNotification>,
}

pub struct TransportEntry {
    pub transport: Arc<dyn MediaTransport>,
    pub direction: TransportDirection,
    pub owner: PeerId,
}

pub struct ProducerEntry {
    pub producer: Arc<dyn MediaProducer>,
    pub transport_id: TransportId,
    pub owner: PeerId,
}

pub struct ConsumerEntry {
    pub consumer: Arc<dyn MediaConsumer>,
    pub transport_id: TransportId,
    pub owner: PeerId,
}

/// Everything guarded by the room lock
#[derive(Default)]
pub struct RoomState {
    members: HashMap<PeerId, Member>,
    transports: HashMap<TransportId, TransportEntry>,
    producers: BTreeMap<MediaKind, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    recording: Option<Arc<RecordingSession>>,
    closed: bool,
}

impl RoomState {
    /// Set once the room has been torn down; a closed state accepts nothing
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_member(&self, peer_id: &PeerId) -> bool {
        self.members.contains_key(peer_id)
    }

    /// Returns false if the peer was already a member
    pub fn add_member(
        &mut self,
        peer_id: PeerId,
        role: PeerRole,
        notifier: mpsc::Sender<RoomNotification>,
    ) -> bool {
        if self.members.contains_key(&peer_id) {
            return false;
        }
        self.members.insert(peer_id, Member { role, notifier });
        true
    }

    pub fn remove_member(&mut self, peer_id: &PeerId) -> Option<Member> {
        self.members.remove(peer_id)
    }

    /// Deliver to every member except `except`; returns how many were reached
    pub fn notify_others(&self, except: &PeerId, notification: &RoomNotification) -> usize {
        let mut delivered = 0;
        for (peer_id, member) in &self.members {
            if peer_id == except {
                continue;
            }
            match member.notifier.try_send(notification.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Dropping notification for slow or gone peer");
                }
            }
        }
        delivered
    }

    #[must_use]
    pub fn transport(&self, transport_id: &TransportId) -> Option<&TransportEntry> {
        self.transports.get(transport_id)
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn insert_transport(&mut self, entry: TransportEntry) {
        self.transports.insert(entry.transport.id().clone(), entry);
    }

    /// A closed producer leaves its slot free
    #[must_use]
    pub fn producer_slot_free(&self, kind: MediaKind) -> bool {
        self.producers
            .get(&kind)
            .map_or(true, |entry| entry.producer.is_closed())
    }

    pub fn insert_producer(&mut self, entry: ProducerEntry) -> Result<()> {
        let kind = entry.producer.kind();
        if !self.producer_slot_free(kind) {
            return Err(SfuError::ProducerExists(kind));
        }
        self.producers.insert(kind, entry);
        Ok(())
    }

    /// Open producers, ordered by kind
    pub fn producers(&self) -> impl Iterator<Item = &Arc<dyn MediaProducer>> {
        self.producers
            .values()
            .map(|entry| &entry.producer)
            .filter(|producer| !producer.is_closed())
    }

    #[must_use]
    pub fn has_producer(&self) -> bool {
        self.producers().next().is_some()
    }

    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<&Arc<dyn MediaProducer>> {
        self.producers().find(|producer| producer.id() == producer_id)
    }

    pub fn insert_consumer(&mut self, entry: ConsumerEntry) {
        self.consumers.insert(entry.consumer.id().clone(), entry);
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(consumer_id)
    }

    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        self.consumers.remove(consumer_id)
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// The recording session, unless it already ended
    #[must_use]
    pub fn recording(&self) -> Option<&Arc<RecordingSession>> {
        self.recording.as_ref().filter(|session| session.is_recording())
    }

    pub fn set_recording(&mut self, session: Arc<RecordingSession>) -> Result<()> {
        if self.recording().is_some() {
            return Err(SfuError::RecordingInProgress);
        }
        self.recording = Some(session);
        Ok(())
    }

    /// Take the running session out of the slot
    pub fn take_recording(&mut self) -> Option<Arc<RecordingSession>> {
        let active = self.recording().is_some();
        let session = self.recording.take();
        session.filter(|_| active)
    }

    /// Close everything `peer_id` owns: consumers, producers, then transports.
    ///
    /// A recording loses its source when the last producer goes, so it is
    /// stopped too.
    pub async fn release_peer(&mut self, peer_id: &PeerId) {
        let consumer_ids: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, entry)| &entry.owner == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in consumer_ids {
            if let Some(entry) = self.consumers.remove(&consumer_id) {
                entry.consumer.close().await;
            }
        }

        let kinds: Vec<MediaKind> = self
            .producers
            .iter()
            .filter(|(_, entry)| &entry.owner == peer_id)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in kinds {
            if let Some(entry) = self.producers.remove(&kind) {
                entry.producer.close().await;
                debug!(peer_id = %peer_id, producer_id = %entry.producer.id(), "Producer closed");
            }
        }

        let transport_ids: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|(_, entry)| &entry.owner == peer_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transport_ids {
            if let Some(entry) = self.transports.remove(&transport_id) {
                entry.transport.close().await;
            }
        }

        // consumers of other peers whose producer just went away
        let orphaned: Vec<ConsumerId> = self
            .consumers
            .iter()
            .filter(|(_, entry)| entry.consumer.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for consumer_id in orphaned {
            if let Some(entry) = self.consumers.remove(&consumer_id) {
                entry.consumer.close().await;
            }
        }

        if !self.has_producer() {
            if let Some(session) = self.take_recording() {
                info!(peer_id = %peer_id, "Publisher left, stopping recording");
                session.stop().await;
            }
        }
    }

    /// Tear the whole room down: transports, producers, consumers, recording.
    ///
    /// Returns the recording that was stopped, if any.
    pub async fn close_all(&mut self) -> Option<Arc<RecordingSession>> {
        self.closed = true;
        self.members.clear();

        for (_, entry) in self.transports.drain() {
            entry.transport.close().await;
        }
        for (_, entry) in std::mem::take(&mut self.producers) {
            entry.producer.close().await;
        }
        for (_, entry) in self.consumers.drain() {
            entry.consumer.close().await;
        }
        let session = self.recording.take()?;
        session.stop().await;
        Some(session)
    }
}

pub struct Room {
    id: RoomId,
    router: Arc<dyn MediaRouter>,
    state: Mutex<RoomState>,
    created_at: DateTime<Utc>,
}

impl Room {
    pub fn new(id: RoomId, router: Arc<dyn MediaRouter>) -> Self {
        Self {
            id,
            router,
            state: Mutex::new(RoomState::default()),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serializes every mutation of this room
    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }
}

/// Read-only snapshot of one room
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    pub room_id: RoomId,
    pub has_producer: bool,
    pub producer_kinds: Vec<MediaKind>,
    pub consumer_count: usize,
    pub transport_count: usize,
    pub member_count: usize,
    pub recording: bool,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub async fn stats(&self) -> RoomStats {
        let state = self.lock().await;
        RoomStats {
            room_id: self.id.clone(),
            has_producer: state.has_producer(),
            producer_kinds: state.producers().map(|p| p.kind()).collect(),
            consumer_count: state.consumer_count(),
            transport_count: state.transport_count(),
            member_count: state.member_count(),
            recording: state.recording().is_some(),
            created_at: self.created_at,
        }
    }
}
