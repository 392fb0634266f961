use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuSettings,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Maximum size of one signaling frame in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 3016,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// One codec the routers offer to peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCodecConfig {
    /// "audio" or "video"
    pub kind: String,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl MediaCodecConfig {
    fn new(kind: &str, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> Self {
        Self {
            kind: kind.to_string(),
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            parameters: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuSettings {
    /// Number of media workers (0 = one per available CPU)
    pub num_workers: usize,
    pub listen_ip: String,
    /// Public address announced in ICE candidates (empty = `listen_ip`)
    pub announced_ip: String,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Upper bound for every media-engine round trip
    pub request_timeout_ms: u64,
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    pub media_codecs: Vec<MediaCodecConfig>,
}

impl Default for SfuSettings {
    fn default() -> Self {
        let mut h264 = MediaCodecConfig::new("video", "video/H264", 90000, None);
        h264.parameters
            .insert("packetization-mode".to_string(), "1".to_string());
        h264.parameters
            .insert("profile-level-id".to_string(), "42e01f".to_string());
        h264.parameters
            .insert("level-asymmetry-allowed".to_string(), "1".to_string());

        Self {
            num_workers: 0,
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: String::new(),
            rtc_min_port: 40000,
            rtc_max_port: 49999,
            request_timeout_ms: 10_000,
            max_rooms: 0,
            media_codecs: vec![
                MediaCodecConfig::new("audio", "audio/opus", 48000, Some(2)),
                MediaCodecConfig::new("video", "video/VP8", 90000, None),
                h264,
            ],
        }
    }
}

impl SfuSettings {
    /// Resolved worker count
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.num_workers > 0 {
            return self.num_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub program: String,
    /// Argument template; `{sdp}` and `{output}` are substituted
    pub args: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: [
                "-nostdin",
                "-loglevel",
                "error",
                "-protocol_whitelist",
                "file,rtp,udp",
                "-fflags",
                "+genpts",
                "-i",
                "{sdp}",
                "-map",
                "0",
                "-c",
                "copy",
                "-y",
                "{output}",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadBackend {
    /// Copy finished files into a local directory
    #[default]
    Fs,
    S3,
    /// Keep nothing; the upload attempt is only logged
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub backend: UploadBackend,
    /// Root directory (fs) or key prefix (s3)
    pub root: String,
    pub bucket: String,
    pub endpoint: String,
    pub region: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Extra attempts after the first failed upload
    pub max_retries: usize,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            backend: UploadBackend::Fs,
            root: "./uploads".to_string(),
            bucket: String::new(),
            endpoint: String::new(),
            region: None,
            access_key_id: String::new(),
            secret_access_key: String::new(),
            max_retries: 0,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: String,
    /// Container extension handed to the decoder ("webm", "mkv", "mp4")
    pub container: String,
    /// Address the media engine sends recorded RTP to
    pub host: String,
    pub min_port: u16,
    pub max_port: u16,
    /// Hard cap on one recording (0 = unlimited)
    pub max_duration_secs: u64,
    /// Time the decoder gets to finalize after the termination signal
    pub stop_grace_secs: u64,
    pub decoder: DecoderConfig,
    pub upload: UploadConfig,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: "./recordings".to_string(),
            container: "webm".to_string(),
            host: "127.0.0.1".to_string(),
            min_port: 20000,
            max_port: 29999,
            max_duration_secs: 4 * 60 * 60,
            stop_grace_secs: 10,
            decoder: DecoderConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CAMCAST_SERVER__HTTP_PORT, CAMCAST_SFU__NUM_WORKERS, ...
        builder = builder.add_source(
            Environment::with_prefix("CAMCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the whole configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be non-zero".to_string());
        }
        if self.sfu.rtc_min_port >= self.sfu.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) must be lower than sfu.rtc_max_port ({})",
                self.sfu.rtc_min_port, self.sfu.rtc_max_port
            ));
        }
        if self.sfu.request_timeout_ms == 0 {
            errors.push("sfu.request_timeout_ms must be non-zero".to_string());
        }
        if self.sfu.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must list at least one codec".to_string());
        }
        for codec in &self.sfu.media_codecs {
            if codec.kind != "audio" && codec.kind != "video" {
                errors.push(format!(
                    "codec {} has invalid kind {:?}",
                    codec.mime_type, codec.kind
                ));
            }
            if !codec.mime_type.starts_with(&format!("{}/", codec.kind)) {
                errors.push(format!(
                    "codec mime type {} does not match kind {}",
                    codec.mime_type, codec.kind
                ));
            }
        }
        // Recording needs an RTP/RTCP pair starting on an even port
        if u32::from(self.recording.min_port) + 1 >= u32::from(self.recording.max_port) {
            errors.push(format!(
                "recording port range {}-{} is too small",
                self.recording.min_port, self.recording.max_port
            ));
        }
        if self.recording.decoder.program.is_empty() {
            errors.push("recording.decoder.program must be set".to_string());
        }
        if !self.recording.decoder.args.iter().any(|a| a.contains("{sdp}")) {
            errors.push("recording.decoder.args must reference {sdp}".to_string());
        }
        if !self.recording.decoder.args.iter().any(|a| a.contains("{output}")) {
            errors.push("recording.decoder.args must reference {output}".to_string());
        }
        match self.recording.upload.backend {
            UploadBackend::Fs if self.recording.upload.root.is_empty() => {
                errors.push("recording.upload.root is required for the fs backend".to_string());
            }
            UploadBackend::S3 if self.recording.upload.bucket.is_empty() => {
                errors.push("recording.upload.bucket is required for the s3 backend".to_string());
            }
            _ => {}
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
