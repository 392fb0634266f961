//! Supervised decoder subprocess.
//!
//! The decoder reads RTP described by an SDP file and writes one container
//! file. A supervisor task owns the child: it captures the exit status,
//! enforces the maximum runtime and turns a stop request into SIGINT followed
//! by a kill once the grace period runs out.

use camcast_core::DecoderConfig;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SfuError};

/// SDP file on disk, removed when dropped
#[derive(Debug)]
pub struct DescriptorFile {
    path: PathBuf,
}

impl DescriptorFile {
    pub async fn write(path: PathBuf, contents: &str) -> Result<Self> {
        tokio::fs::write(&path, contents).await?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DescriptorFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed session descriptor"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove session descriptor"),
        }
    }
}

/// Program and arguments with the placeholders filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecoderCommand {
    pub fn new(config: &DecoderConfig, sdp: &Path, output: &Path) -> Self {
        let sdp = sdp.to_string_lossy();
        let output = output.to_string_lossy();
        Self {
            program: config.program.clone(),
            args: config
                .args
                .iter()
                .map(|arg| arg.replace("{sdp}", &sdp).replace("{output}", &output))
                .collect(),
        }
    }
}

/// How the decoder run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// Exited on its own
    Exited,
    /// Terminated after a stop request
    Stopped,
    /// Terminated after hitting the maximum duration
    DurationLimit,
}

#[derive(Debug, Clone, Copy)]
pub struct DecoderExit {
    pub cause: ExitCause,
    /// None if the status could not be collected
    pub status: Option<ExitStatus>,
    /// The grace period ran out and the child was killed
    pub killed: bool,
}

impl DecoderExit {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }
}

pub struct DecoderProcess {
    pid: Option<u32>,
    stop: CancellationToken,
    supervisor: JoinHandle<DecoderExit>,
}

impl DecoderProcess {
    /// Spawn the decoder and its supervisor.
    ///
    /// `max_duration` of `None` means no runtime limit.
    pub fn spawn(
        command: &DecoderCommand,
        max_duration: Option<Duration>,
        stop_grace: Duration,
    ) -> Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SfuError::Decoder(format!("Failed to start {}: {e}", command.program)))?;

        let pid = child.id();
        info!(program = %command.program, pid = ?pid, "Decoder started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid = ?pid, "decoder: {line}");
                }
            });
        }

        let stop = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(child, stop.clone(), max_duration, stop_grace));

        Ok(Self {
            pid,
            stop,
            supervisor,
        })
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Token that asks the supervisor to terminate the decoder
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Ask the decoder to finish; returns immediately
    pub fn terminate(&self) {
        self.stop.cancel();
    }

    /// Wait until the decoder is gone
    pub async fn wait(self) -> DecoderExit {
        match self.supervisor.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "Decoder supervisor failed");
                DecoderExit {
                    cause: ExitCause::Exited,
                    status: None,
                    killed: false,
                }
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    stop: CancellationToken,
    max_duration: Option<Duration>,
    stop_grace: Duration,
) -> DecoderExit {
    let limit = async {
        match max_duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };

    let cause = tokio::select! {
        status = child.wait() => {
            return DecoderExit {
                cause: ExitCause::Exited,
                status: status.ok(),
                killed: false,
            };
        }
        () = stop.cancelled() => ExitCause::Stopped,
        () = limit => ExitCause::DurationLimit,
    };
    if cause == ExitCause::DurationLimit {
        warn!(pid = ?child.id(), "Decoder reached the maximum recording duration");
    }

    let (status, killed) = terminate(&mut child, stop_grace).await;
    DecoderExit {
        cause,
        status,
        killed,
    }
}

/// SIGINT, then kill after `grace`
async fn terminate(child: &mut Child, grace: Duration) -> (Option<ExitStatus>, bool) {
    interrupt(child);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return (status.ok(), false);
    }

    warn!(pid = ?child.id(), grace_secs = grace.as_secs(), "Decoder ignored SIGINT, killing");
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill decoder");
    }
    (child.wait().await.ok(), true)
}

#[cfg(unix)]
fn interrupt(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        warn!(pid, error = %e, "Failed to send SIGINT to decoder");
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "Failed to stop decoder");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> DecoderCommand {
        DecoderCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_placeholders_substituted() {
        let config = DecoderConfig::default();
        let command = DecoderCommand::new(
            &config,
            Path::new("/tmp/a.sdp"),
            Path::new("/tmp/a.webm"),
        );
        assert_eq!(command.program, "ffmpeg");
        assert!(command.args.contains(&"/tmp/a.sdp".to_string()));
        assert_eq!(command.args.last().map(String::as_str), Some("/tmp/a.webm"));
        assert!(command.args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
    }

    #[tokio::test]
    async fn test_exit_status_captured() {
        let process = DecoderProcess::spawn(&sh("exit 3"), None, Duration::from_secs(1)).unwrap();
        let exit = process.wait().await;
        assert_eq!(exit.cause, ExitCause::Exited);
        assert_eq!(exit.status.and_then(|s| s.code()), Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_stop_sends_sigint() {
        let process =
            DecoderProcess::spawn(&sh("exec sleep 30"), None, Duration::from_secs(5)).unwrap();
        assert!(process.pid().is_some());
        process.terminate();

        let exit = process.wait().await;
        assert_eq!(exit.cause, ExitCause::Stopped);
        assert!(!exit.killed);
    }

    #[tokio::test]
    async fn test_kill_after_grace() {
        let process = DecoderProcess::spawn(
            &sh("trap '' INT; sleep 30"),
            None,
            Duration::from_millis(200),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        process.terminate();

        let exit = process.wait().await;
        assert!(exit.killed);
    }

    #[tokio::test]
    async fn test_duration_limit() {
        let process = DecoderProcess::spawn(
            &sh("exec sleep 30"),
            Some(Duration::from_millis(100)),
            Duration::from_secs(5),
        )
        .unwrap();
        let exit = process.wait().await;
        assert_eq!(exit.cause, ExitCause::DurationLimit);
    }

    #[tokio::test]
    async fn test_descriptor_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam-1.sdp");
        let descriptor = DescriptorFile::write(path.clone(), "v=0\r\n").await.unwrap();
        assert!(descriptor.path().exists());
        drop(descriptor);
        assert!(!path.exists());
    }
}
