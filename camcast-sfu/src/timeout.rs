//! Deadlines for media-engine round trips.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::engine::{Closeable, EngineResult};
use crate::error::{Result, SfuError};

/// Run `fut` with a deadline.
///
/// Only for operations that create nothing; dropping them half way leaves no
/// engine object behind.
pub async fn bounded<T, E>(
    timeout: Duration,
    what: &'static str,
    fut: impl Future<Output = std::result::Result<T, E>>,
) -> Result<T>
where
    E: Into<SfuError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => {
            warn!(operation = what, timeout_ms = timeout.as_millis() as u64, "Media engine timed out");
            Err(SfuError::Timeout(what))
        }
    }
}

/// Run an engine call that creates an object, with a deadline.
///
/// The call keeps running on its own task after the deadline. If it still
/// produces an object, that object is closed as soon as it arrives.
pub async fn create_bounded<T>(
    timeout: Duration,
    what: &'static str,
    fut: impl Future<Output = EngineResult<Arc<T>>> + Send + 'static,
) -> Result<Arc<T>>
where
    T: ?Sized + Closeable + 'static,
{
    let mut handle = tokio::spawn(fut);
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(result)) => result.map_err(Into::into),
        Ok(Err(e)) => Err(SfuError::Internal(format!("{what} task failed: {e}"))),
        Err(_) => {
            warn!(operation = what, timeout_ms = timeout.as_millis() as u64, "Media engine timed out");
            tokio::spawn(async move {
                if let Ok(Ok(object)) = handle.await {
                    debug!(operation = what, "Closing object created after its deadline");
                    object.close().await;
                }
            });
            Err(SfuError::Timeout(what))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;
    use crate::engine::{MediaEngine, WorkerSettings};

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: Result<()> = bounded(
            Duration::from_millis(10),
            "sleep",
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, SfuError>(())
            },
        )
        .await;
        assert!(matches!(result, Err(SfuError::Timeout("sleep"))));
    }

    #[tokio::test]
    async fn test_late_object_is_closed() {
        let engine = LoopbackEngine::with_latency(Duration::from_millis(50));
        let worker = engine.create_worker(&WorkerSettings::default()).await.unwrap();

        let result = create_bounded(Duration::from_millis(5), "router", async move {
            worker.create_router(&[]).await
        })
        .await;
        assert!(matches!(result, Err(SfuError::Timeout("router"))));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(engine.stats().routers, 0);
    }
}
