//! Signaling surface of camcast
//!
//! - `protocol`: JSON request/response/notification frames
//! - `gateway`: per-connection state machine driving the room registry
//! - `http`: axum router (`/ws`, `/health`, `/health/details`)

pub mod error;
pub mod gateway;
pub mod http;
pub mod protocol;

pub use error::{SignalError, SignalResult};
pub use gateway::{Gateway, SignalStream, SignalingSession};
