//! camcast SFU control plane
//!
//! Decides which media worker hosts a room, tracks the lifecycle of rooms,
//! transports, producers and consumers, and records live publications
//! through an external decoder. Media packets never pass through this crate;
//! the byte-level engine sits behind the traits in [`engine`].
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed set of media workers, round-robin router placement
//! - **`RoomRegistry`**: room id → `Room`, creation, membership and teardown
//! - **`Room`**: router, producer slots (one per kind), consumers, transports
//! - **`Recorder`** / **`RecordingSession`**: per-room export pipeline
//!
//! ## Usage
//!
//! ```rust,ignore
//! use camcast_sfu::{engine::loopback::LoopbackEngine, RoomRegistry, SfuConfig, WorkerPool};
//!
//! let engine = LoopbackEngine::new();
//! let pool = WorkerPool::initialize(Arc::new(engine), &SfuConfig::default()).await?;
//! let registry = RoomRegistry::new(pool, 0);
//! let room = registry.get_or_create(&"cam-1".into()).await?;
//! ```

mod config;
pub mod engine;
mod error;
pub mod recording;
mod registry;
mod room;
mod timeout;
mod types;
mod worker_pool;

pub use config::SfuConfig;
pub use error::{Result, SfuError};
pub use recording::{Recorder, RecordingSession, RecordingState};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{PeerRole, Room, RoomNotification, RoomStats, RoomState};
pub use timeout::{bounded, create_bounded};
pub use types::{
    ConsumerId, MediaKind, PeerId, ProducerId, RoomId, RouterId, RtpCapabilities,
    RtpCodecCapability, RtpCodecParameters, RtpEncodingParameters, RtpParameters,
    TransportDirection, TransportId, WorkerId,
};
pub use worker_pool::{WorkerDeath, WorkerInfo, WorkerPool};
