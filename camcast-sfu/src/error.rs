use thiserror::Error;

use crate::engine::EngineError;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportDirection, TransportId};

/// Control-plane errors.
///
/// The `Display` text of the request-validation and conflict variants is what
/// signaling clients see, so it stays short and stable.
#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Room not found")]
    RoomNotFound(RoomId),

    #[error("Transport not found")]
    TransportNotFound(TransportId),

    #[error("Producer not found")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found")]
    ConsumerNotFound(ConsumerId),

    #[error("Transport is not a {expected} transport")]
    WrongDirection {
        transport_id: TransportId,
        expected: TransportDirection,
    },

    #[error("Producer already exists")]
    ProducerExists(MediaKind),

    #[error("Cannot consume")]
    CannotConsume,

    #[error("Recording already in progress")]
    RecordingInProgress,

    #[error("Room or producer not found")]
    NothingToRecord,

    #[error("Recording not found")]
    RecordingNotFound,

    #[error("Maximum number of rooms reached")]
    RoomLimitReached,

    #[error("Peer {0} left the room")]
    PeerGone(PeerId),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("No free port pair in {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decoder error: {0}")]
    Decoder(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Caused by the request itself rather than by the server
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::RoomNotFound(_)
                | Self::TransportNotFound(_)
                | Self::ProducerNotFound(_)
                | Self::ConsumerNotFound(_)
                | Self::WrongDirection { .. }
                | Self::ProducerExists(_)
                | Self::CannotConsume
                | Self::RecordingInProgress
                | Self::NothingToRecord
                | Self::RecordingNotFound
                | Self::RoomLimitReached
                | Self::InvalidInput(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
