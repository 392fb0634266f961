use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::ports::PortReservation;
use super::process::{DecoderProcess, DescriptorFile, ExitCause};
use super::upload::{upload_with_retry, Uploader};
use crate::engine::{MediaConsumer, MediaTransport};
use crate::types::{MediaKind, RoomId};

/// Lifecycle of one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    Starting,
    Active,
    Stopping,
    Finalizing,
    Closed,
    Failed,
}

impl RecordingState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Receive path for one recorded kind
pub struct RecordingTrack {
    pub kind: MediaKind,
    pub transport: Arc<dyn MediaTransport>,
    pub consumer: Arc<dyn MediaConsumer>,
    pub ports: PortReservation,
}

/// Where the finished file goes
pub(super) struct UploadTarget {
    pub uploader: Arc<dyn Uploader>,
    pub max_retries: usize,
    pub timeout: std::time::Duration,
}

pub struct RecordingSession {
    room_id: RoomId,
    output_path: PathBuf,
    remote_name: String,
    tracks: Mutex<Vec<RecordingTrack>>,
    stop: Mutex<Option<CancellationToken>>,
    state_tx: watch::Sender<RecordingState>,
    started_at: DateTime<Utc>,
}

impl RecordingSession {
    pub(crate) fn new(room_id: RoomId, output_path: PathBuf, remote_name: String) -> Self {
        let (state_tx, _) = watch::channel(RecordingState::Idle);
        Self {
            room_id,
            output_path,
            remote_name,
            tracks: Mutex::new(Vec::new()),
            stop: Mutex::new(None),
            state_tx,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    #[must_use]
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    #[must_use]
    pub fn state(&self) -> RecordingState {
        *self.state_tx.borrow()
    }

    /// Starting or Active
    #[must_use]
    pub fn is_recording(&self) -> bool {
        matches!(self.state(), RecordingState::Starting | RecordingState::Active)
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.state_tx.subscribe()
    }

    /// Kinds currently being recorded
    #[must_use]
    pub fn kinds(&self) -> Vec<MediaKind> {
        self.tracks.lock().iter().map(|t| t.kind).collect()
    }

    pub(super) fn set_state(&self, state: RecordingState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(room_id = %self.room_id, from = ?previous, to = ?state, "Recording state changed");
        }
    }

    pub(super) fn attach(&self, tracks: Vec<RecordingTrack>) {
        *self.tracks.lock() = tracks;
    }

    /// Token that terminates the decoder
    pub(super) fn set_stop(&self, stop: CancellationToken) {
        *self.stop.lock() = Some(stop);
    }

    /// Close consumers, then transports, then signal the decoder.
    ///
    /// Returns without waiting for the decoder; see [`Self::wait_closed`].
    pub async fn stop(&self) {
        self.state_tx.send_if_modified(|state| {
            if matches!(state, RecordingState::Starting | RecordingState::Active) {
                *state = RecordingState::Stopping;
                true
            } else {
                false
            }
        });
        info!(room_id = %self.room_id, "Stopping recording");

        let (consumers, transports): (Vec<_>, Vec<_>) = self
            .tracks
            .lock()
            .iter()
            .map(|t| (Arc::clone(&t.consumer), Arc::clone(&t.transport)))
            .unzip();
        for consumer in consumers {
            consumer.close().await;
        }
        for transport in transports {
            transport.close().await;
        }

        let stop = self.stop.lock().clone();
        if let Some(stop) = stop {
            stop.cancel();
        }
    }

    /// Wait for `Closed` or `Failed`
    pub async fn wait_closed(&self) -> RecordingState {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Close and drop every track, releasing the port pairs
    pub(super) async fn release_tracks(&self) {
        let tracks = std::mem::take(&mut *self.tracks.lock());
        for track in tracks {
            track.consumer.close().await;
            track.transport.close().await;
        }
    }

    /// Runs once the decoder is up: waits for it to exit, then cleans up and
    /// hands the file to storage
    pub(super) async fn finalize(
        self: Arc<Self>,
        process: DecoderProcess,
        descriptor: DescriptorFile,
        upload: UploadTarget,
    ) {
        let exit = process.wait().await;
        match exit.cause {
            ExitCause::Exited if !exit.success() => {
                warn!(room_id = %self.room_id, status = ?exit.status, "Decoder exited unexpectedly");
            }
            ExitCause::Exited => {
                info!(room_id = %self.room_id, "Decoder finished on its own");
            }
            cause => {
                // ffmpeg reports 255 after SIGINT even when the file is complete
                info!(
                    room_id = %self.room_id,
                    cause = ?cause,
                    status = ?exit.status,
                    killed = exit.killed,
                    "Decoder stopped"
                );
            }
        }

        self.release_tracks().await;
        self.set_state(RecordingState::Finalizing);
        drop(descriptor);

        if tokio::fs::try_exists(&self.output_path).await.unwrap_or(false) {
            match upload_with_retry(
                upload.uploader.as_ref(),
                &self.output_path,
                &self.remote_name,
                upload.max_retries,
                upload.timeout,
            )
            .await
            {
                Ok(()) => info!(
                    room_id = %self.room_id,
                    remote_name = %self.remote_name,
                    "Recording uploaded"
                ),
                Err(e) => error!(
                    room_id = %self.room_id,
                    remote_name = %self.remote_name,
                    error = %e,
                    "Recording upload failed"
                ),
            }
            if let Err(e) = tokio::fs::remove_file(&self.output_path).await {
                warn!(path = %self.output_path.display(), error = %e, "Failed to remove local recording");
            }
        } else {
            warn!(
                room_id = %self.room_id,
                path = %self.output_path.display(),
                "Decoder produced no output, nothing to upload"
            );
        }

        self.set_state(RecordingState::Closed);
    }
}
