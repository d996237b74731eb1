// src/jobs/engine.rs
use crate::error::{DispatchError, Result};
use crate::explorer::ExplorerClient;
use crate::jobs::control::ControlToken;
use crate::jobs::executor::{Executor, ExecutorContext};
use crate::jobs::{
    AutoBuyExecutor, AutoSellExecutor, DistributionExecutor, Job, JobMode, JobProgress, JobState,
    RewardsExecutor,
};
use crate::pipeline::{GasPolicy, TransactionPipeline};
use crate::store::JobStore;
use crate::token::TokenService;
use dashmap::DashMap;
use futures::future::join_all;
use log::{error, info, warn};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Engine-wide knobs, lifted from the application configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chain_id: u64,
    pub max_concurrent_jobs: usize,
    pub control_poll: Duration,
    pub unit_interval: Duration,
    pub gas_policy: GasPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            chain_id: config.chain_id,
            max_concurrent_jobs: config.max_concurrent_jobs,
            control_poll: Duration::from_secs(config.control_poll_secs),
            unit_interval: Duration::from_secs(config.unit_interval_secs),
            gas_policy: GasPolicy::from_override(config.gas_price_gwei),
        }
    }
}

/// Queue entry: lower priority number wins, FIFO within a priority.
struct QueuedJob {
    priority: u8,
    seq: u64,
    id: u64,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueuedJob {}
impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest numbers surface.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct JobHandle {
    id: u64,
    record: Arc<Mutex<Job>>,
    control: Arc<ControlToken>,
    done_flag: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobHandle {
    /// Returns true exactly once, for whichever exit path gets there first.
    fn mark_done_once(&self) -> bool {
        !self.done_flag.swap(true, Ordering::SeqCst)
    }

    fn is_done(&self) -> bool {
        self.done_flag.load(Ordering::SeqCst)
    }
}

/// Accepts job submissions, runs one executor per active job on a bounded
/// worker pool, and exposes the control surface (`submit`, `progress`,
/// `pause`, `resume`, `cancel`) that the front-end may invoke.
pub struct JobEngine {
    pipeline: Arc<TransactionPipeline>,
    tokens: Arc<TokenService>,
    explorer: Arc<ExplorerClient>,
    store: Arc<dyn JobStore>,
    settings: EngineSettings,
    jobs: DashMap<u64, Arc<JobHandle>>,
    queue: Mutex<BinaryHeap<QueuedJob>>,
    queue_notify: Notify,
    slots: Arc<Semaphore>,
    seq: AtomicU64,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JobEngine {
    pub fn new(
        pipeline: Arc<TransactionPipeline>,
        tokens: Arc<TokenService>,
        explorer: Arc<ExplorerClient>,
        store: Arc<dyn JobStore>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Arc::new(Self {
            pipeline,
            tokens,
            explorer,
            store,
            settings,
            jobs: DashMap::new(),
            queue: Mutex::new(BinaryHeap::new()),
            queue_notify: Notify::new(),
            slots,
            seq: AtomicU64::new(0),
            dispatcher: std::sync::Mutex::new(None),
        })
    }

    /// Starts the dispatcher task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.dispatcher.lock().expect("dispatcher lock poisoned");
        if guard.is_some() {
            warn!("Job engine already started");
            return;
        }
        let engine = self.clone();
        *guard = Some(tokio::spawn(async move { engine.dispatch_loop().await }));
        info!(
            "🚀 Job engine started ({} worker slots)",
            self.settings.max_concurrent_jobs
        );
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let queued = loop {
                let notified = self.queue_notify.notified();
                if let Some(q) = self.queue.lock().await.pop() {
                    break q;
                }
                notified.await;
            };

            let Some(handle) = self.jobs.get(&queued.id).map(|h| h.value().clone()) else {
                continue;
            };
            if handle.is_done() {
                // Cancelled while still queued.
                continue;
            }

            let permit = match self.slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };

            let engine = self.clone();
            let job_handle = handle.clone();
            let worker = tokio::spawn(async move {
                engine.run_job(job_handle).await;
                drop(permit);
            });
            *handle.worker.lock().await = Some(worker);
        }
    }

    async fn run_job(&self, handle: Arc<JobHandle>) {
        if handle.is_done() {
            return;
        }

        let record = match self.store.get_job(handle.id).await {
            Ok(Some(r)) => r,
            Ok(None) => {
                self.finalize(
                    &handle,
                    Some(DispatchError::Store(format!(
                        "job {} record missing",
                        handle.id
                    ))),
                )
                .await;
                return;
            }
            Err(e) => {
                self.finalize(&handle, Some(e)).await;
                return;
            }
        };

        let mode = handle.record.lock().await.mode;
        // Configuration-class errors surface here, before the first unit.
        let executor = match self.build_executor(mode, &record.config) {
            Ok(ex) => ex,
            Err(e) => {
                error!("Job #{} unusable: {}", handle.id, e);
                self.finalize(&handle, Some(e)).await;
                return;
            }
        };

        {
            let mut job = handle.record.lock().await;
            job.state = JobState::Running;
            job.started_at = Some(Instant::now());
        }
        info!("▶️  Job #{} running ({})", handle.id, mode.as_str());

        let ctx = ExecutorContext {
            job_id: handle.id,
            pipeline: self.pipeline.clone(),
            tokens: self.tokens.clone(),
            explorer: self.explorer.clone(),
            record: handle.record.clone(),
            control: handle.control.clone(),
            control_poll: self.settings.control_poll,
            unit_interval: self.settings.unit_interval,
            gas_policy: self.settings.gas_policy.clone(),
        };

        let result = executor.run(ctx).await;
        self.finalize(&handle, result.err()).await;
    }

    /// Every exit path funnels through here; `is_done` flips exactly once so
    /// the engine can always reap the job.
    async fn finalize(&self, handle: &Arc<JobHandle>, error: Option<DispatchError>) {
        if !handle.mark_done_once() {
            return;
        }
        let mut job = handle.record.lock().await;
        job.is_done = true;
        job.state = if handle.control.is_cancelled() {
            JobState::Cancelled
        } else if let Some(e) = error {
            job.error = Some(e.to_string());
            JobState::Failed
        } else if job.failed_count > 0 {
            JobState::Failed
        } else {
            JobState::Completed
        };
        info!(
            "🏁 Job #{} finished {:?}: {}/{} done, {} failed",
            job.id, job.state, job.done_count, job.total_count, job.failed_count
        );
    }

    fn build_executor(
        &self,
        mode: JobMode,
        config: &serde_json::Value,
    ) -> Result<Box<dyn Executor>> {
        let chain_id = self.settings.chain_id;
        Ok(match mode {
            JobMode::Distribution => Box::new(DistributionExecutor::from_config(config, chain_id)?),
            JobMode::AutoBuy => Box::new(AutoBuyExecutor::from_config(config, chain_id)?),
            JobMode::AutoSell => Box::new(AutoSellExecutor::from_config(config, chain_id)?),
            JobMode::Rewards => Box::new(RewardsExecutor::from_config(config, chain_id)?),
        })
    }

    /// Submits a job. Unknown modes are rejected here, not deep inside a
    /// worker; the submission is recorded through the durable store.
    pub async fn submit(
        &self,
        title: &str,
        mode: &str,
        config: serde_json::Value,
        priority: u8,
    ) -> Result<u64> {
        let mode = JobMode::parse(mode)?;
        let id = self.store.create_job(title, mode.as_str(), &config).await?;

        let handle = Arc::new(JobHandle {
            id,
            record: Arc::new(Mutex::new(Job::new(id, title.to_string(), mode, priority))),
            control: Arc::new(ControlToken::new()),
            done_flag: AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        self.jobs.insert(id, handle);

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.queue.lock().await.push(QueuedJob { priority, seq, id });
        self.queue_notify.notify_one();

        info!(
            "📥 Job #{} '{}' queued (mode {}, priority {})",
            id,
            title,
            mode.as_str(),
            priority
        );
        Ok(id)
    }

    pub async fn progress(&self, id: u64) -> Option<JobProgress> {
        let handle = self.jobs.get(&id)?.value().clone();
        let job = handle.record.lock().await;
        Some(job.progress())
    }

    pub async fn pause(&self, id: u64) -> bool {
        let Some(handle) = self.jobs.get(&id).map(|h| h.value().clone()) else {
            return false;
        };
        let mut job = handle.record.lock().await;
        if job.state != JobState::Running {
            return false;
        }
        handle.control.pause();
        job.state = JobState::Paused;
        info!("⏸️  Job #{} paused", id);
        true
    }

    pub async fn resume(&self, id: u64) -> bool {
        let Some(handle) = self.jobs.get(&id).map(|h| h.value().clone()) else {
            return false;
        };
        let mut job = handle.record.lock().await;
        if job.state != JobState::Paused {
            return false;
        }
        handle.control.resume();
        job.state = JobState::Running;
        info!("▶️  Job #{} resumed", id);
        true
    }

    /// Cooperative cancel: a running job stops within one polling interval;
    /// a still-queued job is finalized immediately.
    pub async fn cancel(&self, id: u64) -> bool {
        let Some(handle) = self.jobs.get(&id).map(|h| h.value().clone()) else {
            return false;
        };
        handle.control.cancel();

        let mut job = handle.record.lock().await;
        if job.state == JobState::Queued && handle.mark_done_once() {
            job.state = JobState::Cancelled;
            job.is_done = true;
        }
        info!("🛑 Cancel requested for job #{}", id);
        true
    }

    /// Polls until the job reports done, or the timeout passes.
    pub async fn wait_until_done(&self, id: u64, timeout: Duration) -> Option<JobProgress> {
        let deadline = Instant::now() + timeout;
        loop {
            let progress = self.progress(id).await?;
            if progress.is_done {
                return Some(progress);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Cancels everything and waits for workers to drain.
    pub async fn shutdown(&self) {
        if let Some(dispatcher) = self
            .dispatcher
            .lock()
            .expect("dispatcher lock poisoned")
            .take()
        {
            dispatcher.abort();
        }

        let handles: Vec<Arc<JobHandle>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        for handle in &handles {
            handle.control.cancel();
        }

        let mut workers = Vec::new();
        for handle in &handles {
            if let Some(worker) = handle.worker.lock().await.take() {
                workers.push(worker);
            }
        }
        join_all(workers).await;
        info!("Job engine stopped");
    }
}
