// Upload of finished recordings
//
// Backends:
// - Local directory (opendal fs service)
// - AWS S3 / Minio / any S3-compatible storage (opendal s3 service)
// - None, for deployments that collect files some other way

use async_trait::async_trait;
use camcast_core::{UploadBackend, UploadConfig};
use opendal::{services, Operator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::error::{Result, SfuError};

const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Hands a finished file to durable storage
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()>;
}

/// Storage backend for recordings
pub struct OpendalUploader {
    operator: Operator,
}

impl OpendalUploader {
    pub fn fs(root: &str) -> Result<Self> {
        let builder = services::Fs::default().root(root);
        let operator = Operator::new(builder)
            .map_err(|e| SfuError::Upload(format!("fs storage init failed: {e}")))?
            .finish();
        Ok(Self { operator })
    }

    pub fn s3(config: &UploadConfig) -> Result<Self> {
        tracing::info!(
            "Initializing S3 upload storage: bucket={}, endpoint={}",
            config.bucket,
            config.endpoint
        );

        let mut builder = services::S3::default()
            .bucket(&config.bucket)
            .root(&config.root)
            .access_key_id(&config.access_key_id)
            .secret_access_key(&config.secret_access_key);
        if !config.endpoint.is_empty() {
            builder = builder.endpoint(&config.endpoint);
        }
        if let Some(region) = &config.region {
            builder = builder.region(region);
        }

        let operator = Operator::new(builder)
            .map_err(|e| SfuError::Upload(format!("s3 storage init failed: {e}")))?
            .finish();
        Ok(Self { operator })
    }
}

#[async_trait]
impl Uploader for OpendalUploader {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        let mut file = tokio::fs::File::open(local_path).await?;
        let mut writer = self
            .operator
            .writer(remote_name)
            .await
            .map_err(|e| SfuError::Upload(format!("open {remote_name} failed: {e}")))?;

        let mut total = 0usize;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer
                .write(buf[..n].to_vec())
                .await
                .map_err(|e| SfuError::Upload(format!("write {remote_name} failed: {e}")))?;
            total += n;
        }
        writer
            .close()
            .await
            .map_err(|e| SfuError::Upload(format!("close {remote_name} failed: {e}")))?;

        tracing::debug!("Uploaded {} ({} bytes) as {}", local_path.display(), total, remote_name);
        Ok(())
    }
}

/// Keeps nothing; the attempt is only logged
pub struct NoopUploader;

#[async_trait]
impl Uploader for NoopUploader {
    async fn upload(&self, local_path: &Path, remote_name: &str) -> Result<()> {
        tracing::info!(
            "Upload disabled, discarding {} (would be {})",
            local_path.display(),
            remote_name
        );
        Ok(())
    }
}

pub fn build_uploader(config: &UploadConfig) -> Result<Arc<dyn Uploader>> {
    Ok(match config.backend {
        UploadBackend::Fs => {
            std::fs::create_dir_all(&config.root)?;
            Arc::new(OpendalUploader::fs(&config.root)?)
        }
        UploadBackend::S3 => Arc::new(OpendalUploader::s3(config)?),
        UploadBackend::None => Arc::new(NoopUploader),
    })
}

/// Upload with exponential backoff retry (via `backon` crate)
///
/// `max_retries` extra attempts after the first; every attempt is bounded
/// by `timeout`.
pub async fn upload_with_retry(
    uploader: &dyn Uploader,
    local_path: &Path,
    remote_name: &str,
    max_retries: usize,
    timeout: Duration,
) -> Result<()> {
    use backon::{BackoffBuilder, ExponentialBuilder};

    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(max_retries)
        .with_jitter()
        .build();

    let mut last_err = None;
    for delay in std::iter::once(Duration::ZERO).chain(backoff) {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let attempt = tokio::time::timeout(timeout, uploader.upload(local_path, remote_name)).await;
        match attempt {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => {
                tracing::warn!("Upload of {} failed: {}", remote_name, e);
                last_err = Some(e);
            }
            Err(_) => {
                tracing::warn!("Upload of {} timed out after {:?}", remote_name, timeout);
                last_err = Some(SfuError::Timeout("upload"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| SfuError::Upload("no upload attempt made".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyUploader {
        attempts: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Uploader for FlakyUploader {
        async fn upload(&self, _local_path: &Path, _remote_name: &str) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                Err(SfuError::Upload("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_fs_upload_copies_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let local = src_dir.path().join("cam-1.webm");
        tokio::fs::write(&local, b"matroska").await.unwrap();

        let uploader = OpendalUploader::fs(dst_dir.path().to_str().unwrap()).unwrap();
        uploader.upload(&local, "cam-1/cam-1.webm").await.unwrap();

        let copied = tokio::fs::read(dst_dir.path().join("cam-1/cam-1.webm"))
            .await
            .unwrap();
        assert_eq!(copied, b"matroska");
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let uploader = FlakyUploader {
            attempts: AtomicUsize::new(0),
            fail_first: 1,
        };
        let result = upload_with_retry(
            &uploader,
            Path::new("/nonexistent"),
            "x",
            0,
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(uploader.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let uploader = FlakyUploader {
            attempts: AtomicUsize::new(0),
            fail_first: 2,
        };
        upload_with_retry(&uploader, Path::new("/nonexistent"), "x", 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(uploader.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let dst_dir = tempfile::tempdir().unwrap();
        let uploader = OpendalUploader::fs(dst_dir.path().to_str().unwrap()).unwrap();
        assert!(uploader
            .upload(Path::new("/definitely/not/here.webm"), "x.webm")
            .await
            .is_err());
    }
}
