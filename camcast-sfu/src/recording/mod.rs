//! Recording export: taps a room's producers into a container file through
//! an external decoder and hands the result to storage.
//!
//! Per recorded kind the engine gets a plain transport that sends RTP to a
//! reserved local port pair. The decoder reads all of them through one SDP
//! file and copies the streams without re-encoding.

pub mod ports;
pub mod process;
pub mod sdp;
pub mod session;
pub mod upload;

use camcast_core::RecordingConfig;
use chrono::Utc;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::engine::{
    ConsumeOptions, MediaConsumer, MediaProducer, MediaRouter, MediaTransport,
    PlainTransportOptions, TransportConnectParams,
};
use crate::error::{Result, SfuError};
use crate::timeout::{bounded, create_bounded};
use crate::types::RoomId;

pub use ports::{PortAllocator, PortReservation};
pub use process::{DecoderCommand, DecoderProcess, DescriptorFile};
pub use session::{RecordingSession, RecordingState, RecordingTrack};
pub use upload::{build_uploader, NoopUploader, OpendalUploader, Uploader};

use sdp::{generate_sdp, SdpTrack};
use session::UploadTarget;

/// Starts recording sessions; shared by all rooms
pub struct Recorder {
    config: RecordingConfig,
    host: IpAddr,
    output_dir: PathBuf,
    ports: PortAllocator,
    uploader: Arc<dyn Uploader>,
    request_timeout: Duration,
}

impl Recorder {
    pub fn new(
        config: RecordingConfig,
        uploader: Arc<dyn Uploader>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|_| SfuError::InvalidInput(format!("invalid recording host {}", config.host)))?;
        let output_dir = PathBuf::from(&config.output_dir);
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            ports: PortAllocator::new(host, config.min_port, config.max_port),
            host,
            output_dir,
            uploader,
            request_timeout,
            config,
        })
    }

    /// Build with the uploader named in the configuration
    pub fn from_config(config: RecordingConfig, request_timeout: Duration) -> Result<Self> {
        let uploader = build_uploader(&config.upload)?;
        Self::new(config, uploader, request_timeout)
    }

    #[must_use]
    pub const fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Start recording `producers` of one room.
    ///
    /// Consumers stay paused until the decoder has been spawned. On any
    /// failure everything acquired so far is released and the session ends
    /// up `Failed`.
    pub async fn start(
        &self,
        room_id: &RoomId,
        router: &Arc<dyn MediaRouter>,
        producers: &[Arc<dyn MediaProducer>],
    ) -> Result<Arc<RecordingSession>> {
        let stem = format!(
            "{}-{}",
            file_safe(room_id.as_str()),
            Utc::now().format("%Y%m%d-%H%M%S%3f")
        );
        let output_path = self
            .output_dir
            .join(format!("{stem}.{}", self.config.container));
        let remote_name = format!("{}/{stem}.{}", file_safe(room_id.as_str()), self.config.container);

        let session = Arc::new(RecordingSession::new(
            room_id.clone(),
            output_path,
            remote_name,
        ));
        session.set_state(RecordingState::Starting);

        match self.launch(&session, router, producers).await {
            Ok(()) => {
                session.set_state(RecordingState::Active);
                info!(
                    room_id = %room_id,
                    kinds = ?session.kinds(),
                    output = %session.output_path().display(),
                    "Recording started"
                );
                Ok(session)
            }
            Err(e) => {
                warn!(room_id = %room_id, error = %e, "Recording failed to start");
                session.release_tracks().await;
                let _ = tokio::fs::remove_file(session.output_path()).await;
                session.set_state(RecordingState::Failed);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        session: &Arc<RecordingSession>,
        router: &Arc<dyn MediaRouter>,
        producers: &[Arc<dyn MediaProducer>],
    ) -> Result<()> {
        let mut tracks = Vec::with_capacity(producers.len());
        for producer in producers {
            match self.open_track(router, producer).await {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    for track in tracks {
                        track.consumer.close().await;
                        track.transport.close().await;
                    }
                    return Err(e);
                }
            }
        }

        let sdp = {
            let sdp_tracks: Vec<SdpTrack<'_>> = tracks
                .iter()
                .filter_map(|track| {
                    track.consumer.rtp_parameters().primary_codec().map(|codec| SdpTrack {
                        kind: track.kind,
                        rtp_port: track.ports.rtp_port(),
                        rtcp_port: track.ports.rtcp_port(),
                        codec,
                    })
                })
                .collect();
            generate_sdp(
                self.host,
                &format!("camcast recording {}", session.room_id()),
                &sdp_tracks,
            )
        };

        let consumers: Vec<Arc<dyn MediaConsumer>> =
            tracks.iter().map(|t| Arc::clone(&t.consumer)).collect();
        // From here on the session owns the tracks and releases them
        session.attach(tracks);

        let descriptor =
            DescriptorFile::write(session.output_path().with_extension("sdp"), &sdp).await?;
        let command = DecoderCommand::new(&self.config.decoder, descriptor.path(), session.output_path());
        let max_duration = (self.config.max_duration_secs > 0)
            .then(|| Duration::from_secs(self.config.max_duration_secs));
        let process = DecoderProcess::spawn(
            &command,
            max_duration,
            Duration::from_secs(self.config.stop_grace_secs),
        )?;
        session.set_stop(process.stop_token());

        for consumer in &consumers {
            if let Err(e) = bounded(self.request_timeout, "resume", consumer.resume()).await {
                process.terminate();
                let _ = process.wait().await;
                return Err(e);
            }
        }

        let upload = UploadTarget {
            uploader: Arc::clone(&self.uploader),
            max_retries: self.config.upload.max_retries,
            timeout: Duration::from_secs(self.config.upload.timeout_secs),
        };
        tokio::spawn(Arc::clone(session).finalize(process, descriptor, upload));
        Ok(())
    }

    /// Plain transport, paused consumer, port pair, connect
    async fn open_track(
        &self,
        router: &Arc<dyn MediaRouter>,
        producer: &Arc<dyn MediaProducer>,
    ) -> Result<RecordingTrack> {
        let options = PlainTransportOptions {
            listen_ip: self.host,
            rtcp_mux: false,
            comedia: false,
        };
        let r = Arc::clone(router);
        let transport: Arc<dyn MediaTransport> =
            create_bounded(self.request_timeout, "plain transport", async move {
                r.create_plain_transport(&options).await
            })
            .await?;

        match self.attach_consumer(router, &transport, producer).await {
            Ok((consumer, ports)) => Ok(RecordingTrack {
                kind: producer.kind(),
                transport,
                consumer,
                ports,
            }),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn attach_consumer(
        &self,
        router: &Arc<dyn MediaRouter>,
        transport: &Arc<dyn MediaTransport>,
        producer: &Arc<dyn MediaProducer>,
    ) -> Result<(Arc<dyn MediaConsumer>, PortReservation)> {
        let options = ConsumeOptions {
            producer_id: producer.id().clone(),
            rtp_capabilities: router.rtp_capabilities(),
            paused: true,
        };
        let t = Arc::clone(transport);
        let consumer: Arc<dyn MediaConsumer> =
            create_bounded(self.request_timeout, "recording consumer", async move {
                t.consume(options).await
            })
            .await?;

        let ports = match self.ports.reserve() {
            Ok(ports) => ports,
            Err(e) => {
                consumer.close().await;
                return Err(e);
            }
        };

        let params = TransportConnectParams::Plain {
            ip: self.host,
            port: ports.rtp_port(),
            rtcp_port: Some(ports.rtcp_port()),
        };
        if let Err(e) = bounded(self.request_timeout, "connect", transport.connect(params)).await {
            consumer.close().await;
            return Err(e);
        }

        Ok((consumer, ports))
    }
}

/// Keep room ids usable as file names
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
