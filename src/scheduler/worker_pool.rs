//! Pool of analysis workers fed from the job queue.
//!
//! Each worker pulls one [`AnalyzeJob`], runs it to completion and publishes
//! exactly one [`AnalyzeResult`] before pulling the next job.
//!
//! # Features
//!
//! - Fixed pool size, or elastic sizing re-evaluated from host resources
//! - Per-worker stop tokens derived from one shared shutdown token
//! - Workers only stop between jobs, never in the middle of one
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::locator::{DatabaseLocator, LocatorError};
use crate::metrics;
use crate::runner::{AnalysisRunner, RunnerError};
use crate::storage::{ArtifactError, ArtifactStore};

use super::job::{AnalyzeJob, AnalyzeResult, NameWithOwner};
use super::queue::JobQueue;
use super::sizing::{target_worker_count, ResourceProbe, DEFAULT_WORKER_MEMORY_MB};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// The repository has no database any more.
    #[error("No database for {0}")]
    DatabaseMissing(NameWithOwner),

    #[error("Artifact store error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Database locator error: {0}")]
    Locator(#[from] LocatorError),

    #[error("Analysis failed: {0}")]
    Runner(#[from] RunnerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers; zero selects elastic sizing.
    pub num_workers: usize,
    /// Memory budget of one worker for elastic sizing, in megabytes.
    pub worker_memory_mb: u64,
    /// How often elastic sizing re-evaluates the target.
    pub monitor_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            worker_memory_mb: DEFAULT_WORKER_MEMORY_MB,
            monitor_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(3600),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Creates a configuration that sizes the pool from host resources.
    pub fn elastic() -> Self {
        Self::default()
    }

    pub fn with_worker_memory_mb(mut self, mb: u64) -> Self {
        self.worker_memory_mb = mb;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn is_elastic(&self) -> bool {
        self.num_workers == 0
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Number of live workers.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Jobs that produced a successful result.
    pub jobs_completed: u64,
    /// Jobs that produced a failed result.
    pub jobs_failed: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, success: bool, duration: Duration) {
        if success {
            self.jobs_completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::SeqCst);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            average_job_duration: average_duration,
        }
    }
}

/// Collaborators every worker needs to run a job.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub databases: Arc<dyn DatabaseLocator>,
    pub runner: Arc<dyn AnalysisRunner>,
}

struct WorkerSlot {
    id: usize,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the live worker tasks and grows or shrinks their set.
struct Supervisor {
    context: WorkerContext,
    shutdown: CancellationToken,
    workers: Mutex<Vec<WorkerSlot>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SharedPoolStats>,
    next_worker_id: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    /// Spawns or stops workers until exactly `target` are live.
    ///
    /// Excess workers are the most recently spawned ones; they finish their
    /// current job before exiting.
    fn resize(&self, target: usize) {
        let mut workers = lock(&self.workers);
        let current = workers.len();
        if target == current {
            return;
        }

        info!(current = current, target = target, "Resizing worker pool");

        while workers.len() < target {
            let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst);
            let stop = self.shutdown.child_token();
            let worker = Worker {
                id: format!("worker-{}", id),
                context: self.context.clone(),
                stop: stop.clone(),
                stats: Arc::clone(&self.stats),
            };
            let handle = tokio::spawn(worker.run());
            workers.push(WorkerSlot { id, stop, handle });
        }

        let mut retired = lock(&self.retired);
        while workers.len() > target {
            if let Some(slot) = workers.pop() {
                debug!(worker_id = slot.id, "Stopping worker");
                slot.stop.cancel();
                retired.push(slot.handle);
            }
        }
        retired.retain(|handle| !handle.is_finished());

        metrics::set_active_workers(workers.len());
    }

    fn live_workers(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Takes every worker handle, live or retired.
    fn drain_handles(&self) -> Vec<JoinHandle<()>> {
        let mut handles: Vec<_> = lock(&self.workers).drain(..).map(|s| s.handle).collect();
        handles.append(&mut lock(&self.retired));
        handles
    }
}

/// Worker pool that manages the workers of one agent process.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    probe: Arc<dyn ResourceProbe>,
    supervisor: Arc<Supervisor>,
    monitor: Option<JoinHandle<()>>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a pool whose workers stop when `shutdown` is cancelled.
    pub fn new(
        config: WorkerPoolConfig,
        context: WorkerContext,
        probe: Arc<dyn ResourceProbe>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            probe,
            supervisor: Arc::new(Supervisor {
                context,
                shutdown,
                workers: Mutex::new(Vec::new()),
                retired: Mutex::new(Vec::new()),
                stats: Arc::new(SharedPoolStats::new()),
                next_worker_id: AtomicUsize::new(0),
            }),
            monitor: None,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts the workers, and the sizing monitor for elastic pools.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        if !self.config.is_elastic() {
            metrics::set_worker_target(self.config.num_workers);
            self.supervisor.resize(self.config.num_workers);
            info!(num_workers = self.config.num_workers, "Worker pool started");
            return Ok(());
        }

        let initial = evaluate_target(self.probe.as_ref(), self.config.worker_memory_mb).await;
        self.supervisor.resize(initial);
        info!(num_workers = initial, "Elastic worker pool started");

        let supervisor = Arc::clone(&self.supervisor);
        let probe = Arc::clone(&self.probe);
        let interval = self.config.monitor_interval;
        let per_worker_mb = self.config.worker_memory_mb;
        self.monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let target = evaluate_target(probe.as_ref(), per_worker_mb).await;
                        supervisor.resize(target);
                    }
                }
            }
            debug!("Sizing monitor stopped");
        }));

        Ok(())
    }

    /// Cancels the shared shutdown token and waits for every worker to
    /// finish its in-flight job.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.supervisor.shutdown.cancel();

        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                error!(error = %e, "Sizing monitor panicked");
            }
        }

        let handles = self.supervisor.drain_handles();
        let shutdown_future = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let outcome = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        metrics::set_active_workers(0);
        match outcome {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Waits until the shared shutdown token is cancelled, then shuts down.
    pub async fn run_until_shutdown(mut self) -> Result<PoolStats, PoolError> {
        if !self.is_running() {
            self.start().await?;
        }
        self.supervisor.shutdown.cancelled().await;
        self.shutdown().await?;
        Ok(self.stats())
    }

    /// Sets an explicit worker count on a running pool.
    pub fn scale(&self, num_workers: usize) {
        metrics::set_worker_target(num_workers);
        self.supervisor.resize(num_workers);
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.supervisor
            .stats
            .to_pool_stats(self.supervisor.live_workers())
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of live workers.
    pub fn num_workers(&self) -> usize {
        self.supervisor.live_workers()
    }
}

async fn evaluate_target(probe: &dyn ResourceProbe, per_worker_mb: u64) -> usize {
    let host = probe.probe().await;
    let target = target_worker_count(host.available_memory_mb, per_worker_mb, host.logical_cpus);
    debug!(
        available_memory_mb = host.available_memory_mb,
        logical_cpus = host.logical_cpus,
        target = target,
        "Evaluated worker target"
    );
    metrics::set_worker_target(target);
    target
}

/// A single worker that processes jobs from the queue.
struct Worker {
    id: String,
    context: WorkerContext,
    /// Child of the pool's shutdown token.
    stop: CancellationToken,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    async fn run(self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let job = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                job = self.context.queue.next_job() => job,
            };

            match job {
                Some(job) => self.process_job(job).await,
                None => {
                    info!(worker_id = %self.id, "Job stream closed");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Runs one job and publishes its single result.
    async fn process_job(&self, job: AnalyzeJob) {
        let start_time = Instant::now();
        info!(
            worker_id = %self.id,
            session_id = job.spec.session_id,
            repository = %job.spec.nwo,
            "Processing job"
        );

        self.stats.increment_active();
        metrics::record_job_started();

        let result = match self.execute(&job).await {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    job = %job.spec,
                    error = %e,
                    "Job failed"
                );
                AnalyzeResult::failure(job.spec.clone(), e.to_string())
            }
        };

        let duration = start_time.elapsed();
        self.stats.decrement_active();
        self.stats.record(result.is_success(), duration);
        metrics::record_job_finished(duration);

        if let Err(e) = self.context.queue.publish_result(&result).await {
            error!(
                worker_id = %self.id,
                job = %job.spec,
                error = %e,
                "Failed to publish result"
            );
            return;
        }

        info!(
            worker_id = %self.id,
            job = %job.spec,
            status = %result.status,
            result_count = result.result_count,
            duration_ms = duration.as_millis() as u64,
            "Job finished"
        );
    }

    async fn execute(&self, job: &AnalyzeJob) -> Result<AnalyzeResult, PoolError> {
        let scratch = tempfile::Builder::new().prefix("mrva-job-").tempdir()?;

        let pack = self.context.artifacts.get_query_pack(&job.query_pack).await?;
        let pack_path = scratch.path().join("qp.tgz");
        tokio::fs::write(&pack_path, &pack).await?;

        let databases = &self.context.databases;
        let location = databases
            .locate(&job.spec.nwo)
            .await?
            .ok_or_else(|| PoolError::DatabaseMissing(job.spec.nwo.clone()))?;
        let database = databases.get_database(&location).await?;

        let output = self
            .context
            .runner
            .run(&database, &pack_path, &job.query_language)
            .await?;

        let result_location = self
            .context
            .artifacts
            .save_result(&job.spec, &output.archive)
            .await?;

        Ok(AnalyzeResult::success(
            job.spec.clone(),
            output.result_count,
            result_location,
            output.source_location_prefix,
            output.database_sha,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::FilesystemLocator;
    use crate::runner::RunOutput;
    use crate::scheduler::job::{JobSpec, JobStatus};
    use crate::scheduler::queue::MemoryQueue;
    use crate::scheduler::sizing::{HostResources, StaticProbe};
    use crate::storage::MemoryArtifactStore;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct FakeRunner {
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl AnalysisRunner for FakeRunner {
        async fn run(
            &self,
            database: &[u8],
            query_pack: &Path,
            _language: &str,
        ) -> Result<RunOutput, RunnerError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(RunnerError::ToolInvocationFailed {
                    command: "codeql database analyze".to_string(),
                    message: "exit status: 2".to_string(),
                });
            }
            assert!(query_pack.exists());
            Ok(RunOutput {
                result_count: 7,
                archive: database.to_vec(),
                source_location_prefix: "/src".to_string(),
                database_sha: "abc123".to_string(),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        queue: Arc<MemoryQueue>,
        artifacts: Arc<MemoryArtifactStore>,
        context: WorkerContext,
    }

    fn fixture(fail: bool) -> Fixture {
        fixture_with(FakeRunner {
            fail,
            delay: Duration::ZERO,
        })
    }

    fn fixture_with(runner: FakeRunner) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db_dir = dir.path().join("octo/cat");
        std::fs::create_dir_all(&db_dir).unwrap();
        std::fs::write(db_dir.join("octo_cat_db.zip"), b"database").unwrap();

        let queue = Arc::new(MemoryQueue::new(10));
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let context = WorkerContext {
            queue: queue.clone(),
            artifacts: artifacts.clone(),
            databases: Arc::new(FilesystemLocator::new(dir.path())),
            runner: Arc::new(runner),
        };
        Fixture {
            _dir: dir,
            queue,
            artifacts,
            context,
        }
    }

    async fn submit(fixture: &Fixture, repo: &str) -> JobSpec {
        let location = fixture
            .artifacts
            .save_query_pack(1, &[0x1F, 0x8B, 0x00])
            .await
            .unwrap();
        let spec = JobSpec::new(1, NameWithOwner::new("octo", repo));
        fixture
            .queue
            .publish_job(&AnalyzeJob::new(spec.clone(), location, "cpp"))
            .await
            .unwrap();
        spec
    }

    fn host(memory_mb: u64, cpus: usize) -> Arc<dyn ResourceProbe> {
        Arc::new(StaticProbe(HostResources {
            available_memory_mb: memory_mb,
            logical_cpus: cpus,
        }))
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert!(config.is_elastic());
        assert_eq!(config.worker_memory_mb, 2048);
        assert_eq!(config.monitor_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_worker_memory_mb(1024)
            .with_monitor_interval(Duration::from_secs(5))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert!(!config.is_elastic());
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.worker_memory_mb, 1024);
        assert_eq!(config.monitor_interval, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record(true, Duration::from_secs(10));
        stats.record(true, Duration::from_secs(20));
        stats.record(false, Duration::from_secs(5));
        stats.increment_active();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.active_workers, 1);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[tokio::test]
    async fn test_worker_publishes_success() {
        let fixture = fixture(false);
        let shutdown = CancellationToken::new();
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(2),
            fixture.context.clone(),
            host(0, 1),
            shutdown.clone(),
        );
        pool.start().await.unwrap();
        assert_eq!(pool.num_workers(), 2);

        let spec = submit(&fixture, "cat").await;
        let result = fixture.queue.next_result().await.unwrap();

        assert_eq!(result.spec, spec);
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(result.result_count, 7);
        assert_eq!(result.database_sha, "abc123");
        let location = result.result_location.unwrap();
        assert_eq!(
            fixture.artifacts.get_result(&location).await.unwrap(),
            b"database"
        );

        pool.shutdown().await.unwrap();
        assert_eq!(pool.stats().jobs_completed, 1);
        assert_eq!(pool.num_workers(), 0);
    }

    #[tokio::test]
    async fn test_runner_failure_becomes_failed_result() {
        let fixture = fixture(true);
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(1),
            fixture.context.clone(),
            host(0, 1),
            CancellationToken::new(),
        );
        pool.start().await.unwrap();

        submit(&fixture, "cat").await;
        let first = fixture.queue.next_result().await.unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.error.unwrap().contains("exit status"));

        // The worker keeps going after a failure; this repo has no database.
        submit(&fixture, "dog").await;
        let second = fixture.queue.next_result().await.unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert!(second.error.unwrap().contains("octo/dog"));

        pool.shutdown().await.unwrap();
        assert_eq!(pool.stats().jobs_failed, 2);
    }

    #[tokio::test]
    async fn test_elastic_pool_sizes_from_probe() {
        let fixture = fixture(false);
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::elastic().with_monitor_interval(Duration::from_millis(20)),
            fixture.context.clone(),
            host(6144, 8),
            CancellationToken::new(),
        );
        pool.start().await.unwrap();
        assert_eq!(pool.num_workers(), 3);

        pool.scale(1);
        assert_eq!(pool.num_workers(), 1);

        // The monitor restores the resource-derived target.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.num_workers(), 3);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shrinking_lets_running_jobs_finish() {
        let fixture = fixture_with(FakeRunner {
            fail: false,
            delay: Duration::from_millis(300),
        });
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(3),
            fixture.context.clone(),
            host(0, 1),
            CancellationToken::new(),
        );
        pool.start().await.unwrap();

        for _ in 0..3 {
            submit(&fixture, "cat").await;
        }
        // Every worker is now inside a job.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().active_workers, 3);

        pool.scale(1);
        assert_eq!(pool.num_workers(), 1);

        for _ in 0..3 {
            let result = tokio::time::timeout(Duration::from_secs(5), fixture.queue.next_result())
                .await
                .expect("retired worker should still publish")
                .unwrap();
            assert_eq!(result.status, JobStatus::Succeeded);
        }
        assert_eq!(pool.stats().jobs_completed, 3);

        // The remaining worker keeps taking jobs.
        submit(&fixture, "cat").await;
        let result = tokio::time::timeout(Duration::from_secs(5), fixture.queue.next_result())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, JobStatus::Succeeded);
        assert_eq!(pool.num_workers(), 1);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.stats().jobs_completed, 4);
    }

    #[tokio::test]
    async fn test_shared_shutdown_stops_pool() {
        let fixture = fixture(false);
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(3),
            fixture.context.clone(),
            host(0, 1),
            shutdown.clone(),
        );

        let handle = tokio::spawn(pool.run_until_shutdown());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.total_processed(), 0);
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_twice() {
        let fixture = fixture(false);
        let mut pool = WorkerPool::new(
            WorkerPoolConfig::new(1),
            fixture.context.clone(),
            host(0, 1),
            CancellationToken::new(),
        );

        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));
        pool.start().await.unwrap();
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));
        pool.shutdown().await.unwrap();
    }
}
