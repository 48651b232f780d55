use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};

/// Terminal failure handed back by a job handler.
#[derive(Debug)]
pub struct JobError {
    /// Retriable failures get the backoff schedule; fatal ones
    /// dead-letter immediately.
    pub retriable: bool,
    pub message: String,
}

impl JobError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            retriable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retriable: false,
            message: message.into(),
        }
    }
}

/// Port the queue dispatches jobs through. Handlers must be idempotent:
/// delivery is at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job_id: &str) -> Result<(), JobError>;
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub workers: usize,
    /// Job starts allowed per second, process-wide.
    pub rate_limit_per_sec: u32,
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt (2 s, 4 s, 8 s).
    pub backoff_base: Duration,
    pub completed_retention: usize,
    pub completed_ttl: Duration,
    pub failed_retention: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            rate_limit_per_sec: 100,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            completed_retention: 1000,
            completed_ttl: Duration::from_secs(24 * 3600),
            failed_retention: 5000,
        }
    }
}

/// What an enqueue call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The id is in flight or still retained; the existing job covers it.
    Coalesced,
    /// The queue is draining and accepts no new work.
    Draining,
}

/// A dead-lettered job.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub job_id: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Counter snapshot for status reporting.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub coalesced: u64,
}

/// Windowed start-rate limiter: at most `limit` acquisitions per
/// one-second window.
struct RateLimiter {
    limit: u32,
    window: Mutex<RateWindow>,
}

struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            window: Mutex::new(RateWindow {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Block until a start slot is free in the current window.
    async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
                let elapsed = window.window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    window.window_start = Instant::now();
                    window.count = 0;
                }
                if window.count < self.limit {
                    window.count += 1;
                    None
                } else {
                    Some(Duration::from_secs(1).saturating_sub(elapsed))
                }
            };
            match wait {
                None => return,
                Some(remaining) => sleep(remaining.max(Duration::from_millis(1))).await,
            }
        }
    }
}

#[derive(Default)]
struct DedupSets {
    in_flight: HashSet<String>,
    completed: VecDeque<(String, Instant)>,
    completed_ids: HashSet<String>,
    failed: VecDeque<FailedJob>,
    failed_ids: HashSet<String>,
}

struct QueueState {
    config: QueueConfig,
    dedup: Mutex<DedupSets>,
    rate: RateLimiter,
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    coalesced: AtomicU64,
}

impl QueueState {
    fn new(config: QueueConfig) -> Self {
        let rate = RateLimiter::new(config.rate_limit_per_sec);
        Self {
            config,
            dedup: Mutex::new(DedupSets::default()),
            rate,
            queued: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    fn lock_dedup(&self) -> std::sync::MutexGuard<'_, DedupSets> {
        self.dedup.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Job queue binding: dedup by job id, at-least-once dispatch to a pool
/// of worker tasks, bounded retries with exponential backoff, a
/// process-wide start-rate cap, and retention windows for completed and
/// dead-lettered jobs.
pub struct JobQueue {
    tx: mpsc::UnboundedSender<String>,
    state: Arc<QueueState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl JobQueue {
    /// Spawn the worker pool and return the queue handle.
    pub fn start(config: QueueConfig, handler: Arc<dyn JobHandler>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (shutdown_tx, _) = watch::channel(false);
        let state = Arc::new(QueueState::new(config.clone()));

        let mut workers = Vec::with_capacity(config.workers.max(1));
        for worker_id in 0..config.workers.max(1) {
            workers.push(tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                shutdown_tx.subscribe(),
                state.clone(),
                handler.clone(),
            )));
        }

        JobQueue {
            tx,
            state,
            workers: Mutex::new(workers),
            shutdown_tx,
        }
    }

    /// Enqueue a job keyed by raw sample id.
    ///
    /// Ids that are in flight or retained (completed within the
    /// retention window, or dead-lettered) coalesce into the existing
    /// entry instead of dispatching again.
    pub fn enqueue(&self, raw_sample_id: &str) -> EnqueueOutcome {
        if *self.shutdown_tx.borrow() {
            return EnqueueOutcome::Draining;
        }

        {
            let mut dedup = self.state.lock_dedup();
            if dedup.in_flight.contains(raw_sample_id)
                || dedup.completed_ids.contains(raw_sample_id)
                || dedup.failed_ids.contains(raw_sample_id)
            {
                self.state.coalesced.fetch_add(1, Ordering::Relaxed);
                return EnqueueOutcome::Coalesced;
            }
            dedup.in_flight.insert(raw_sample_id.to_string());
        }

        match self.tx.send(raw_sample_id.to_string()) {
            Ok(()) => {
                self.state.queued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Queued
            }
            Err(_) => {
                self.state.lock_dedup().in_flight.remove(raw_sample_id);
                EnqueueOutcome::Draining
            }
        }
    }

    /// Signal drain and wait for workers to finish their current jobs.
    /// Jobs still waiting in the channel are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        let dedup = self.state.lock_dedup();
        QueueStats {
            queued: self.state.queued.load(Ordering::Relaxed) as usize,
            in_flight: dedup.in_flight.len(),
            completed: self.state.completed.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
            coalesced: self.state.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the dead-letter queue, oldest first.
    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.state.lock_dedup().failed.iter().cloned().collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    mut shutdown: watch::Receiver<bool>,
    state: Arc<QueueState>,
    handler: Arc<dyn JobHandler>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                job = guard.recv() => job,
                _ = shutdown.changed() => None,
            }
        };

        match job {
            Some(job_id) => {
                state.queued.fetch_sub(1, Ordering::Relaxed);
                run_job(&state, handler.as_ref(), &job_id).await;
            }
            None => break,
        }
    }
    log::debug!("worker {} drained", worker_id);
}

async fn run_job(state: &QueueState, handler: &dyn JobHandler, job_id: &str) {
    let max_attempts = state.config.max_attempts.max(1);
    let mut attempt = 0u32;

    let outcome = loop {
        attempt += 1;
        state.rate.acquire().await;
        match handler.handle(job_id).await {
            Ok(()) => break Ok(()),
            Err(e) if e.retriable && attempt < max_attempts => {
                let backoff = state.config.backoff_base * 2u32.pow(attempt - 1);
                log::warn!(
                    "job {} attempt {}/{} failed ({}), retrying in {:?}",
                    job_id,
                    attempt,
                    max_attempts,
                    e.message,
                    backoff
                );
                sleep(backoff).await;
            }
            Err(e) => break Err(e),
        }
    };

    let mut dedup = state.lock_dedup();
    dedup.in_flight.remove(job_id);
    match outcome {
        Ok(()) => {
            dedup.completed.push_back((job_id.to_string(), Instant::now()));
            dedup.completed_ids.insert(job_id.to_string());
            state.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            log::error!(
                "job {} dead-lettered after {} attempt(s): {}",
                job_id,
                attempt,
                e.message
            );
            dedup.failed.push_back(FailedJob {
                job_id: job_id.to_string(),
                attempts: attempt,
                error: e.message,
                failed_at: Utc::now(),
            });
            dedup.failed_ids.insert(job_id.to_string());
            state.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    prune_retention(&mut dedup, &state.config);
}

fn prune_retention(dedup: &mut DedupSets, config: &QueueConfig) {
    while dedup.completed.len() > config.completed_retention {
        if let Some((id, _)) = dedup.completed.pop_front() {
            dedup.completed_ids.remove(&id);
        }
    }
    while let Some((_, completed_at)) = dedup.completed.front() {
        if completed_at.elapsed() <= config.completed_ttl {
            break;
        }
        if let Some((id, _)) = dedup.completed.pop_front() {
            dedup.completed_ids.remove(&id);
        }
    }
    while dedup.failed.len() > config.failed_retention {
        if let Some(job) = dedup.failed.pop_front() {
            dedup.failed_ids.remove(&job.job_id);
        }
    }
}
