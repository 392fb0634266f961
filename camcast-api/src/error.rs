use camcast_sfu::SfuError;
use thiserror::Error;

/// Failure of one signaling request
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Not joined to room")]
    NotJoined,

    #[error("Already joined")]
    AlreadyJoined,

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error(transparent)]
    Sfu(#[from] SfuError),
}

pub type SignalResult<T> = std::result::Result<T, SignalError>;

impl SignalError {
    /// Server-side failure the client cannot act on
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        match self {
            Self::Sfu(e) => !e.is_client_error() && !matches!(e, SfuError::Timeout(_) | SfuError::PeerGone(_)),
            _ => false,
        }
    }

    /// Text sent in the failure reply
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Sfu(SfuError::Timeout(_)) => "Request timed out".to_string(),
            Self::Sfu(SfuError::PeerGone(_)) => Self::NotJoined.to_string(),
            e if e.is_internal() => "Internal server error".to_string(),
            e => e.to_string(),
        }
    }
}
