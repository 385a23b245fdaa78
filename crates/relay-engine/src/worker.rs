//! Bounded worker pools.
//!
//! Jobs wait in a fixed-size queue; a full queue rejects the job and counts it
//! as dropped. Each worker publishes what it is doing to the monitoring
//! store so cluster views show in-flight conversations.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use relay_core::monitor::{PoolType, StatKind, WorkerActivity};
use relay_core::{ServerId, SessionKey};
use relay_store::MonitoringStore;
use relay_telemetry::MetricsRecorder;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::EngineError;

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub pool: PoolType,
    pub workers: u32,
    pub queue_capacity: usize,
}

impl WorkerPoolConfig {
    pub fn processing() -> Self {
        Self {
            pool: PoolType::Processing,
            workers: 8,
            queue_capacity: 256,
        }
    }

    pub fn outbound() -> Self {
        Self {
            pool: PoolType::Outbound,
            workers: 2,
            queue_capacity: 256,
        }
    }
}

/// A job resolves to whether it succeeded.
type Job = BoxFuture<'static, bool>;

struct QueuedJob {
    key: SessionKey,
    job: Job,
}

#[derive(Clone)]
struct WorkerContext {
    server_id: ServerId,
    pool: PoolType,
    monitoring: MonitoringStore,
    metrics: Arc<MetricsRecorder>,
    pending: Arc<AtomicI64>,
}

impl WorkerContext {
    async fn report(&self, activity: WorkerActivity) {
        if let Err(e) = self.monitoring.update_worker_activity(&activity).await {
            debug!(pool = %self.pool, worker = activity.worker_id, error = %e, "worker activity report failed");
        }
    }

    async fn stat(&self, kind: StatKind, delta: i64) {
        if let Err(e) = self.monitoring.increment_stat(kind, delta).await {
            debug!(stat = kind.as_str(), error = %e, "stat update failed");
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    tx: mpsc::Sender<QueuedJob>,
    ctx: WorkerContext,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn the workers. They exit when `cancel` fires.
    pub fn start(
        config: WorkerPoolConfig,
        server_id: ServerId,
        monitoring: MonitoringStore,
        metrics: Arc<MetricsRecorder>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let ctx = WorkerContext {
            server_id,
            pool: config.pool,
            monitoring,
            metrics,
            pending: Arc::new(AtomicI64::new(0)),
        };
        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    ctx.clone(),
                    Arc::clone(&rx),
                    cancel.clone(),
                ))
            })
            .collect();
        Self {
            config,
            tx,
            ctx,
            handles: parking_lot::Mutex::new(handles),
        }
    }

    pub fn pool(&self) -> PoolType {
        self.config.pool
    }

    /// Jobs queued but not yet picked up by a worker.
    pub fn pending(&self) -> i64 {
        self.ctx.pending.load(Ordering::SeqCst)
    }

    /// Queue a job without waiting for it.
    pub async fn submit(&self, key: SessionKey, job: Job) -> Result<(), EngineError> {
        let pool = self.config.pool.as_str();
        match self.tx.try_send(QueuedJob { key, job }) {
            Ok(()) => {
                let pending = self.ctx.pending.fetch_add(1, Ordering::SeqCst) + 1;
                self.ctx.metrics.gauge_set("relay_pool_pending", &[("pool", pool)], pending);
                self.ctx.stat(StatKind::Pending, 1).await;
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(rejected)) => {
                warn!(pool, session_key = %rejected.key, "queue full, dropping job");
                self.ctx.metrics.counter_inc("relay_pool_dropped_total", &[("pool", pool)], 1);
                self.ctx.stat(StatKind::Dropped, 1).await;
                Err(EngineError::QueueFull {
                    pool: pool.to_string(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Shutdown),
        }
    }

    /// Run a future on the pool and wait for its result.
    pub async fn run<F, T>(&self, key: SessionKey, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = async move {
            let result = fut.await;
            let ok = result.is_ok();
            let _ = tx.send(result);
            ok
        }
        .boxed();
        self.submit(key, job).await?;
        rx.await.map_err(|_| EngineError::Shutdown)?
    }

    /// Wait for every worker to exit (after the cancel token fired).
    pub async fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: u32,
    ctx: WorkerContext,
    rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    cancel: CancellationToken,
) {
    let pool = ctx.pool.as_str();
    ctx.report(WorkerActivity::idle(ctx.server_id.clone(), ctx.pool, worker_id, Utc::now()))
        .await;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => None,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(QueuedJob { key, job }) = next else {
            break;
        };

        let pending = ctx.pending.fetch_sub(1, Ordering::SeqCst) - 1;
        ctx.metrics.gauge_set("relay_pool_pending", &[("pool", pool)], pending);
        ctx.stat(StatKind::Pending, -1).await;
        ctx.report(WorkerActivity::busy(
            ctx.server_id.clone(),
            ctx.pool,
            worker_id,
            key.clone(),
            Utc::now(),
        ))
        .await;

        let started = tokio::time::Instant::now();
        let ok = job.await;
        ctx.metrics.histogram_observe(
            "relay_job_duration_ms",
            &[("pool", pool)],
            started.elapsed().as_secs_f64() * 1000.0,
        );
        if ok {
            ctx.metrics.counter_inc("relay_jobs_processed_total", &[("pool", pool)], 1);
            ctx.stat(StatKind::Processed, 1).await;
        } else {
            ctx.metrics.counter_inc("relay_jobs_errored_total", &[("pool", pool)], 1);
            ctx.stat(StatKind::Errored, 1).await;
        }
        ctx.report(WorkerActivity::idle(ctx.server_id.clone(), ctx.pool, worker_id, Utc::now()))
            .await;
        debug!(pool, worker = worker_id, session_key = %key, ok, "job finished");
    }
    debug!(pool, worker = worker_id, "worker stopped");
}
