//! Fixed pool of media workers and the routers they host.
//!
//! Workers are created once at startup. Each room gets its router on the next
//! worker in round-robin order, regardless of load. A worker dying is treated
//! as fatal: the death is published on a watch channel and the process owner
//! is expected to shut down.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::SfuConfig;
use crate::engine::{MediaEngine, MediaRouter, MediaWorker};
use crate::error::{Result, SfuError};
use crate::timeout::create_bounded;
use crate::types::{RoomId, RtpCodecCapability, WorkerId};

/// Why and which worker died
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_id: WorkerId,
    pub reason: String,
}

/// Diagnostics snapshot of one worker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub alive: bool,
    pub router_count: usize,
}

pub struct WorkerPool {
    workers: Vec<Arc<dyn MediaWorker>>,
    next_worker: AtomicUsize,
    routers: DashMap<RoomId, Arc<dyn MediaRouter>>,
    media_codecs: Vec<RtpCodecCapability>,
    request_timeout: Duration,
    death_tx: Arc<watch::Sender<Option<WorkerDeath>>>,
}

impl WorkerPool {
    /// Create `config.num_workers` workers.
    ///
    /// Any failure is fatal. Workers created before the failure are closed.
    pub async fn initialize(engine: Arc<dyn MediaEngine>, config: &SfuConfig) -> Result<Arc<Self>> {
        if config.num_workers == 0 {
            return Err(SfuError::InvalidInput("worker pool needs at least one worker".to_string()));
        }

        let (death_tx, _) = watch::channel(None);
        let death_tx = Arc::new(death_tx);
        let mut workers: Vec<Arc<dyn MediaWorker>> = Vec::with_capacity(config.num_workers);

        for index in 0..config.num_workers {
            let engine = Arc::clone(&engine);
            let settings = config.worker_settings.clone();
            let created = create_bounded(config.request_timeout, "worker", async move {
                engine.create_worker(&settings).await
            })
            .await;

            let worker = match created {
                Ok(worker) => worker,
                Err(e) => {
                    error!(index, error = %e, "Failed to create media worker");
                    close_workers(&workers).await;
                    return Err(e);
                }
            };

            let worker_id = worker.id().clone();
            let tx = Arc::clone(&death_tx);
            worker.on_death(Box::new(move |reason| {
                error!(worker_id = %worker_id, reason = %reason, "Media worker died");
                tx.send_replace(Some(WorkerDeath { worker_id, reason }));
            }));

            info!(
                index,
                worker_id = %worker.id(),
                pid = ?worker.pid(),
                "Media worker started"
            );
            workers.push(worker);
        }

        info!(num_workers = workers.len(), "Worker pool initialized");

        Ok(Arc::new(Self {
            workers,
            next_worker: AtomicUsize::new(0),
            routers: DashMap::new(),
            media_codecs: config.media_codecs.clone(),
            request_timeout: config.request_timeout,
            death_tx,
        }))
    }

    /// Next worker in round-robin order
    pub fn assign_worker(&self) -> Arc<dyn MediaWorker> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[index])
    }

    /// Create a router for `room_id` on the next worker.
    ///
    /// No dedup here; callers serialize creation per room.
    pub async fn create_router(&self, room_id: &RoomId) -> Result<Arc<dyn MediaRouter>> {
        let worker = self.assign_worker();
        if !worker.is_alive() {
            return Err(crate::engine::EngineError::WorkerDead(worker.id().clone()).into());
        }

        let codecs = self.media_codecs.clone();
        let router = create_bounded(self.request_timeout, "router", async move {
            worker.create_router(&codecs).await
        })
        .await?;

        info!(
            room_id = %room_id,
            router_id = %router.id(),
            worker_id = %router.worker_id(),
            "Router created"
        );

        if let Some(previous) = self.routers.insert(room_id.clone(), Arc::clone(&router)) {
            warn!(room_id = %room_id, router_id = %previous.id(), "Replacing existing router");
            previous.close().await;
        }

        Ok(router)
    }

    /// Close and forget the router of `room_id`. Idempotent.
    pub async fn delete_router(&self, room_id: &RoomId) {
        if let Some((_, router)) = self.routers.remove(room_id) {
            router.close().await;
            info!(room_id = %room_id, router_id = %router.id(), "Router closed");
        }
    }

    #[must_use]
    pub fn router(&self, room_id: &RoomId) -> Option<Arc<dyn MediaRouter>> {
        self.routers.get(room_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.len()
    }

    #[must_use]
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .map(|worker| WorkerInfo {
                id: worker.id().clone(),
                pid: worker.pid(),
                alive: worker.is_alive(),
                router_count: self
                    .routers
                    .iter()
                    .filter(|r| r.value().worker_id() == worker.id())
                    .count(),
            })
            .collect()
    }

    /// Receives `Some(death)` once any worker dies
    #[must_use]
    pub fn subscribe_death(&self) -> watch::Receiver<Option<WorkerDeath>> {
        self.death_tx.subscribe()
    }

    /// Close every router, then every worker
    pub async fn close(&self) {
        let room_ids: Vec<RoomId> = self.routers.iter().map(|r| r.key().clone()).collect();
        for room_id in room_ids {
            self.delete_router(&room_id).await;
        }
        close_workers(&self.workers).await;
        info!("Worker pool closed");
    }
}

async fn close_workers(workers: &[Arc<dyn MediaWorker>]) {
    for worker in workers {
        worker.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackEngine;

    fn config(num_workers: usize) -> SfuConfig {
        SfuConfig {
            num_workers,
            ..SfuConfig::default()
        }
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::initialize(Arc::new(engine.clone()), &config(3)).await.unwrap();

        let order: Vec<String> = (0..7)
            .map(|_| pool.assign_worker().id().to_string())
            .collect();
        assert_eq!(
            order,
            vec!["worker-0", "worker-1", "worker-2", "worker-0", "worker-1", "worker-2", "worker-0"]
        );
    }

    #[tokio::test]
    async fn test_partial_pool_is_closed() {
        let engine = LoopbackEngine::with_worker_limit(2);
        let result = WorkerPool::initialize(Arc::new(engine.clone()), &config(4)).await;
        assert!(result.is_err());
        assert_eq!(engine.stats().workers, 0);
    }

    #[tokio::test]
    async fn test_worker_created_after_deadline_is_closed() {
        let engine = LoopbackEngine::with_latency(Duration::from_millis(100));
        let config = SfuConfig {
            num_workers: 1,
            request_timeout: Duration::from_millis(10),
            ..SfuConfig::default()
        };
        let result = WorkerPool::initialize(Arc::new(engine.clone()), &config).await;
        assert!(matches!(result, Err(SfuError::Timeout("worker"))));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.workers().len(), 1);
        assert_eq!(engine.stats().workers, 0);
    }

    #[tokio::test]
    async fn test_delete_router_is_idempotent() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::initialize(Arc::new(engine.clone()), &config(2)).await.unwrap();
        let room_id = RoomId::from("cam-1");

        pool.create_router(&room_id).await.unwrap();
        assert_eq!(engine.stats().routers, 1);
        assert_eq!(pool.workers().iter().map(|w| w.router_count).sum::<usize>(), 1);

        pool.delete_router(&room_id).await;
        pool.delete_router(&room_id).await;
        assert_eq!(engine.stats().routers, 0);
        assert!(pool.router(&room_id).is_none());
    }

    #[tokio::test]
    async fn test_worker_death_is_published() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::initialize(Arc::new(engine.clone()), &config(2)).await.unwrap();
        let mut death_rx = pool.subscribe_death();

        engine.workers()[1].kill("out of memory");
        death_rx.changed().await.unwrap();
        let death = death_rx.borrow().clone().unwrap();
        assert_eq!(death.worker_id.as_str(), "worker-1");
        assert_eq!(death.reason, "out of memory");
        assert!(!pool.workers()[1].alive);
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::initialize(Arc::new(engine.clone()), &config(2)).await.unwrap();
        pool.create_router(&RoomId::from("a")).await.unwrap();
        pool.create_router(&RoomId::from("b")).await.unwrap();

        pool.close().await;
        assert_eq!(engine.stats(), crate::engine::loopback::LoopbackStats::default());
    }
}
