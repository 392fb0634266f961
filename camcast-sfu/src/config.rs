//! SFU Configuration

use camcast_core::SfuSettings;
use std::net::IpAddr;
use std::time::Duration;

use crate::engine::{WebRtcTransportOptions, WorkerSettings};
use crate::error::{Result, SfuError};
use crate::types::{MediaKind, RtpCodecCapability};

/// Runtime SFU configuration, resolved from [`SfuSettings`]
#[derive(Debug, Clone)]
pub struct SfuConfig {
    /// Number of media workers in the pool
    pub num_workers: usize,
    pub worker_settings: WorkerSettings,
    /// Options every client-facing transport is created with
    pub webrtc_transport: WebRtcTransportOptions,
    /// Codecs each router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Upper bound for one media-engine round trip
    pub request_timeout: Duration,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
}

impl Default for SfuConfig {
    fn default() -> Self {
        // The default settings always resolve
        Self::from_settings(&SfuSettings::default()).unwrap_or_else(|_| Self {
            num_workers: 1,
            worker_settings: WorkerSettings::default(),
            webrtc_transport: WebRtcTransportOptions {
                listen_ip: IpAddr::from([0, 0, 0, 0]),
                announced_ip: None,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
            },
            media_codecs: Vec::new(),
            request_timeout: Duration::from_secs(10),
            max_rooms: 0,
        })
    }
}

impl SfuConfig {
    pub fn from_settings(settings: &SfuSettings) -> Result<Self> {
        let listen_ip: IpAddr = settings
            .listen_ip
            .parse()
            .map_err(|_| SfuError::InvalidInput(format!("invalid listen_ip {}", settings.listen_ip)))?;
        let announced_ip = if settings.announced_ip.is_empty() {
            None
        } else {
            Some(settings.announced_ip.parse().map_err(|_| {
                SfuError::InvalidInput(format!("invalid announced_ip {}", settings.announced_ip))
            })?)
        };

        let media_codecs = settings
            .media_codecs
            .iter()
            .map(|codec| {
                let kind: MediaKind = codec.kind.parse().map_err(SfuError::InvalidInput)?;
                Ok(RtpCodecCapability {
                    kind,
                    mime_type: codec.mime_type.clone(),
                    preferred_payload_type: None,
                    clock_rate: codec.clock_rate,
                    channels: codec.channels,
                    parameters: codec
                        .parameters
                        .iter()
                        .map(|(k, v)| (k.clone(), parameter_value(v)))
                        .collect(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            num_workers: settings.worker_count(),
            worker_settings: WorkerSettings {
                rtc_min_port: settings.rtc_min_port,
                rtc_max_port: settings.rtc_max_port,
                ..WorkerSettings::default()
            },
            webrtc_transport: WebRtcTransportOptions {
                listen_ip,
                announced_ip,
                enable_udp: true,
                enable_tcp: true,
                prefer_udp: true,
            },
            media_codecs,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            max_rooms: settings.max_rooms,
        })
    }
}

/// Numeric fmtp values travel as numbers, like browsers send them
fn parameter_value(raw: &str) -> serde_json::Value {
    raw.parse::<u64>()
        .map_or_else(|_| serde_json::Value::String(raw.to_string()), serde_json::Value::from)
}
