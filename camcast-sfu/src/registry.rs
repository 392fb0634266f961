//! Room Registry - authoritative map of live rooms
//!
//! This module provides:
//! - Lazy room creation with exactly one router per room id, even under
//!   concurrent joins (per-room creation lock, double-checked lookup)
//! - Membership bookkeeping and per-peer cleanup
//! - Cascading teardown when the last member leaves
//! - Read-only statistics for the health surface

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::engine::{MediaConsumer, MediaProducer, MediaTransport};
use crate::error::{Result, SfuError};
use crate::recording::{Recorder, RecordingSession};
use crate::room::{
    ConsumerEntry, PeerRole, ProducerEntry, Room, RoomNotification, RoomStats, TransportEntry,
};
use crate::types::{ConsumerId, PeerId, RoomId, TransportDirection, TransportId};
use crate::worker_pool::WorkerPool;

/// Attempts at joining a room that is being torn down concurrently
const JOIN_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub room_count: usize,
    pub rooms: Vec<RoomStats>,
}

pub struct RoomRegistry {
    pool: Arc<WorkerPool>,
    rooms: DashMap<RoomId, Arc<Room>>,
    creation_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    /// Maximum number of rooms (0 = unlimited)
    max_rooms: usize,
}

impl RoomRegistry {
    pub fn new(pool: Arc<WorkerPool>, max_rooms: usize) -> Self {
        Self {
            pool,
            rooms: DashMap::new(),
            creation_locks: DashMap::new(),
            max_rooms,
        }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    async fn acquire_creation_lock(&self, room_id: &RoomId) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.creation_locks
                .entry(room_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }

    fn release_creation_lock(&self, room_id: &RoomId) {
        // Only drop the entry if nobody else is holding or waiting on it
        self.creation_locks
            .remove_if(room_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Return the room, creating it (and its router) on first use
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        if let Some(room) = self.get(room_id) {
            return Ok(room);
        }

        let _guard = self.acquire_creation_lock(room_id).await;

        // Double-check after acquiring the lock
        if let Some(room) = self.get(room_id) {
            debug!(room_id = %room_id, "Room created by a concurrent caller");
            return Ok(room);
        }

        if self.max_rooms > 0 && self.rooms.len() >= self.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::RoomLimitReached);
        }

        let router = self.pool.create_router(room_id).await?;
        let room = Arc::new(Room::new(room_id.clone(), router));
        self.rooms.insert(room_id.clone(), Arc::clone(&room));

        info!(room_id = %room_id, total_rooms = self.rooms.len(), "Created new room");
        Ok(room)
    }

    /// Join `peer_id` to the room, creating it if needed
    pub async fn join(
        &self,
        room_id: &RoomId,
        peer_id: &PeerId,
        role: PeerRole,
        notifier: mpsc::Sender<RoomNotification>,
    ) -> Result<Arc<Room>> {
        for _ in 0..JOIN_ATTEMPTS {
            let room = self.get_or_create(room_id).await?;
            let mut state = room.lock().await;
            if state.is_closed() {
                // Lost the race against delete_room; the next lookup waits for it
                continue;
            }
            if state.add_member(peer_id.clone(), role, notifier.clone()) {
                info!(
                    room_id = %room_id,
                    peer_id = %peer_id,
                    role = ?role,
                    members = state.member_count(),
                    "Peer joined room"
                );
            }
            drop(state);
            return Ok(room);
        }
        Err(SfuError::RoomNotFound(room_id.clone()))
    }

    /// Remove `peer_id` and close what it owned. Returns the members left.
    pub async fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> usize {
        let Some(room) = self.get(room_id) else {
            return 0;
        };
        let mut state = room.lock().await;
        if state.remove_member(peer_id).is_none() {
            return state.member_count();
        }
        state.release_peer(peer_id).await;
        let remaining = state.member_count();
        info!(room_id = %room_id, peer_id = %peer_id, remaining, "Peer left room");
        remaining
    }

    /// Tear the room down and delete its router.
    ///
    /// Skipped when someone joined after the caller decided to delete.
    pub async fn delete_room(&self, room_id: &RoomId) -> bool {
        let guard = self.acquire_creation_lock(room_id).await;

        let Some(room) = self.get(room_id) else {
            drop(guard);
            self.release_creation_lock(room_id);
            return false;
        };

        let in_use = {
            let mut state = room.lock().await;
            let members = state.member_count();
            if members > 0 {
                debug!(room_id = %room_id, members, "Room in use, not deleting");
                true
            } else {
                if let Some(session) = state.close_all().await {
                    info!(
                        room_id = %room_id,
                        output = %session.output_path().display(),
                        state = ?session.state(),
                        "Recording stopped with room, finalizing"
                    );
                }
                false
            }
        };
        if in_use {
            drop(guard);
            self.release_creation_lock(room_id);
            return false;
        }

        self.rooms.remove(room_id);
        self.pool.delete_router(room_id).await;
        drop(guard);
        self.release_creation_lock(room_id);

        info!(room_id = %room_id, total_rooms = self.rooms.len(), "Room deleted");
        true
    }

    /// Register a transport. A no-op (closing the transport) when the room is
    /// gone; fails with `PeerGone` if the owner left meanwhile.
    pub async fn add_transport(
        &self,
        room_id: &RoomId,
        transport: Arc<dyn MediaTransport>,
        direction: TransportDirection,
        owner: &PeerId,
    ) -> Result<bool> {
        let Some(room) = self.get(room_id) else {
            debug!(room_id = %room_id, transport_id = %transport.id(), "Room gone, closing transport");
            transport.close().await;
            return Ok(false);
        };
        let mut state = room.lock().await;
        if state.is_closed() {
            transport.close().await;
            return Ok(false);
        }
        if !state.is_member(owner) {
            transport.close().await;
            return Err(SfuError::PeerGone(owner.clone()));
        }
        state.insert_transport(TransportEntry {
            transport,
            direction,
            owner: owner.clone(),
        });
        Ok(true)
    }

    /// Look up a transport owned by `owner`; other peers' transports are
    /// reported as missing.
    pub async fn get_transport(
        &self,
        room_id: &RoomId,
        transport_id: &TransportId,
        owner: &PeerId,
    ) -> Option<(Arc<dyn MediaTransport>, TransportDirection)> {
        let room = self.get(room_id)?;
        let state = room.lock().await;
        state
            .transport(transport_id)
            .filter(|entry| &entry.owner == owner)
            .map(|entry| (Arc::clone(&entry.transport), entry.direction))
    }

    /// Fill the producer slot of its kind and tell the other members.
    ///
    /// A producer that loses the slot, or whose room or owner is gone, is
    /// closed here. Returns the number of members notified.
    pub async fn add_producer(
        &self,
        room_id: &RoomId,
        producer: Arc<dyn MediaProducer>,
        transport_id: &TransportId,
        owner: &PeerId,
    ) -> Result<usize> {
        let Some(room) = self.get(room_id) else {
            producer.close().await;
            return Err(SfuError::RoomNotFound(room_id.clone()));
        };
        let mut state = room.lock().await;
        if state.is_closed() {
            producer.close().await;
            return Err(SfuError::RoomNotFound(room_id.clone()));
        }
        if !state.is_member(owner) {
            producer.close().await;
            return Err(SfuError::PeerGone(owner.clone()));
        }

        let notification = RoomNotification::NewProducer {
            producer_id: producer.id().clone(),
            kind: producer.kind(),
        };
        let entry = ProducerEntry {
            producer: Arc::clone(&producer),
            transport_id: transport_id.clone(),
            owner: owner.clone(),
        };
        if let Err(e) = state.insert_producer(entry) {
            producer.close().await;
            return Err(e);
        }

        let notified = state.notify_others(owner, &notification);
        info!(
            room_id = %room_id,
            producer_id = %producer.id(),
            kind = %producer.kind(),
            notified,
            "Producer added"
        );
        Ok(notified)
    }

    /// Register a consumer; closes it when the room or owner is gone
    pub async fn add_consumer(
        &self,
        room_id: &RoomId,
        consumer: Arc<dyn MediaConsumer>,
        transport_id: &TransportId,
        owner: &PeerId,
    ) -> Result<bool> {
        let Some(room) = self.get(room_id) else {
            consumer.close().await;
            return Ok(false);
        };
        let mut state = room.lock().await;
        if state.is_closed() {
            consumer.close().await;
            return Ok(false);
        }
        if !state.is_member(owner) {
            consumer.close().await;
            return Err(SfuError::PeerGone(owner.clone()));
        }
        state.insert_consumer(ConsumerEntry {
            consumer,
            transport_id: transport_id.clone(),
            owner: owner.clone(),
        });
        Ok(true)
    }

    /// Look up a consumer owned by `owner`
    pub async fn get_consumer(
        &self,
        room_id: &RoomId,
        consumer_id: &ConsumerId,
        owner: &PeerId,
    ) -> Option<Arc<dyn MediaConsumer>> {
        let room = self.get(room_id)?;
        let state = room.lock().await;
        state
            .consumer(consumer_id)
            .filter(|entry| &entry.owner == owner)
            .map(|entry| Arc::clone(&entry.consumer))
    }

    /// Drop and close a consumer; silent when anything is already gone
    pub async fn remove_consumer(&self, room_id: &RoomId, consumer_id: &ConsumerId) {
        let Some(room) = self.get(room_id) else {
            return;
        };
        let entry = room.lock().await.remove_consumer(consumer_id);
        if let Some(entry) = entry {
            entry.consumer.close().await;
            debug!(room_id = %room_id, consumer_id = %consumer_id, "Consumer removed");
        }
    }

    /// Start the room's single recording session
    pub async fn start_recording(
        &self,
        room_id: &RoomId,
        recorder: &Recorder,
    ) -> Result<Arc<RecordingSession>> {
        let room = self.get(room_id).ok_or(SfuError::NothingToRecord)?;
        let mut state = room.lock().await;
        if state.is_closed() {
            return Err(SfuError::NothingToRecord);
        }
        if state.recording().is_some() {
            return Err(SfuError::RecordingInProgress);
        }
        let producers: Vec<Arc<dyn MediaProducer>> = state.producers().cloned().collect();
        if producers.is_empty() {
            return Err(SfuError::NothingToRecord);
        }

        let session = recorder.start(room_id, room.router(), &producers).await?;
        state.set_recording(Arc::clone(&session))?;
        Ok(session)
    }

    /// Stop the room's recording; the session finalizes in the background
    pub async fn stop_recording(&self, room_id: &RoomId) -> Result<Arc<RecordingSession>> {
        let room = self.get(room_id).ok_or(SfuError::RecordingNotFound)?;
        let session = room
            .lock()
            .await
            .take_recording()
            .ok_or(SfuError::RecordingNotFound)?;
        session.stop().await;
        Ok(session)
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        let mut stats = Vec::with_capacity(rooms.len());
        for room in rooms {
            stats.push(room.stats().await);
        }
        stats.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        RegistryStats {
            room_count: stats.len(),
            rooms: stats,
        }
    }

    /// Tear down every room, used on shutdown.
    ///
    /// Returns the recordings that were stopped; they finalize in the
    /// background.
    pub async fn close_all(&self) -> Vec<Arc<RecordingSession>> {
        let mut recordings = Vec::new();
        let room_ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        for room_id in room_ids {
            if let Some(room) = self.get(&room_id) {
                let mut state = room.lock().await;
                recordings.extend(state.close_all().await);
            }
            self.rooms.remove(&room_id);
            self.pool.delete_router(&room_id).await;
        }
        self.creation_locks.clear();
        info!(recordings = recordings.len(), "All rooms closed");
        recordings
    }
}
