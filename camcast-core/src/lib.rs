//! Shared configuration and logging for the camcast services.

pub mod config;
pub mod logging;

pub use config::{
    Config, DecoderConfig, LoggingConfig, MediaCodecConfig, RecordingConfig, ServerConfig,
    SfuSettings, UploadBackend, UploadConfig,
};
