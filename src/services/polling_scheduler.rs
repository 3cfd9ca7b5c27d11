//! Delayed, retryable job queues
//!
//! Two independent queues (`poll` and `cleanup`) with at-least-once delivery.
//! A job id identifies at most one live job per queue: scheduling an id that
//! is already delayed, waiting or active is a no-op, and an active job is
//! never handed to a second consumer.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

/// Default poll backoff (5 seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default poll attempt cap: 60 x 5s covers the 5 minute window
pub const DEFAULT_POLL_MAX_ATTEMPTS: u32 = 60;

/// Cleanup jobs only retry when the store was unreachable
pub const DEFAULT_CLEANUP_RETRY_SECS: u64 = 10;
pub const DEFAULT_CLEANUP_MAX_ATTEMPTS: u32 = 3;

/// Error types for the scheduler
#[derive(Debug)]
pub enum SchedulerError {
    QueueNotRegistered(QueueName),
    AlreadyConsuming(QueueName),
    InvalidPayload(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::QueueNotRegistered(queue) => {
                write!(f, "Queue {} is not registered", queue)
            }
            SchedulerError::AlreadyConsuming(queue) => {
                write!(f, "Queue {} already has a consumer", queue)
            }
            SchedulerError::InvalidPayload(msg) => write!(f, "Invalid job payload: {}", msg),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Poll,
    Cleanup,
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueName::Poll => write!(f, "poll"),
            QueueName::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Per-queue retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Fixed delay before a retried job is delivered again
    pub backoff: Duration,
    /// Deliveries before the job is dropped
    pub max_attempts: u32,
}

impl QueueConfig {
    pub fn poll_default() -> Self {
        Self {
            backoff: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_attempts: DEFAULT_POLL_MAX_ATTEMPTS,
        }
    }

    pub fn cleanup_default() -> Self {
        Self {
            backoff: Duration::from_secs(DEFAULT_CLEANUP_RETRY_SECS),
            max_attempts: DEFAULT_CLEANUP_MAX_ATTEMPTS,
        }
    }
}

/// A delivered job
#[derive(Debug, Clone)]
pub struct Job {
    pub queue: QueueName,
    pub job_id: String,
    /// Deliveries completed before this one
    pub attempts_made: u32,
    pub payload: serde_json::Value,
    generation: u64,
}

impl Job {
    pub fn new(queue: QueueName, job_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
            attempts_made: 0,
            payload,
            generation: 0,
        }
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, SchedulerError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| SchedulerError::InvalidPayload(format!("{}: {}", self.job_id, e)))
    }
}

/// What the handler wants done with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    Retry,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait JobHandler: Send + Sync {
    /// An `Err` is treated like `JobOutcome::Retry`
    async fn handle(&self, job: &Job) -> Result<JobOutcome, HandlerError>;
}

#[async_trait]
pub trait PollingScheduler: Send + Sync {
    /// Enqueue `job_id` after `delay`. Returns false when a live job with that id already exists.
    async fn schedule(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<bool, SchedulerError>;

    /// Drop a delayed or waiting job, or stop an active one from being retried.
    /// Unknown ids are ignored.
    async fn cancel(&self, queue: QueueName, job_id: &str) -> Result<(), SchedulerError>;

    /// Start delivering jobs of `queue` to `handler`, at most `concurrency` at a time
    async fn consume(
        &self,
        queue: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), SchedulerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Delayed,
    Waiting,
    Active,
}

struct JobEntry {
    generation: u64,
    payload: serde_json::Value,
    attempts_made: u32,
    state: JobState,
    cancelled: bool,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, JobEntry>,
    next_generation: u64,
}

struct QueueInner {
    name: QueueName,
    config: QueueConfig,
    state: Mutex<QueueState>,
    ready_tx: mpsc::UnboundedSender<(String, u64)>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<(String, u64)>>>,
}

impl QueueInner {
    fn new(name: QueueName, config: QueueConfig) -> Arc<Self> {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            config,
            state: Mutex::new(QueueState::default()),
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
        })
    }

    /// Move a delayed job to waiting once its timer fires
    fn promote_after(self: &Arc<Self>, job_id: String, generation: u64, delay: Duration) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = inner.state.lock();
            if let Some(entry) = state.jobs.get_mut(&job_id) {
                if entry.generation == generation && entry.state == JobState::Delayed {
                    entry.state = JobState::Waiting;
                    let _ = inner.ready_tx.send((job_id, generation));
                }
            }
        });
    }

    /// Claim a waiting job for delivery; `None` if it was cancelled or superseded
    fn activate(&self, job_id: &str, generation: u64) -> Option<Job> {
        let mut state = self.state.lock();
        let entry = state.jobs.get_mut(job_id)?;
        if entry.generation != generation || entry.state != JobState::Waiting {
            return None;
        }
        entry.state = JobState::Active;

        Some(Job {
            queue: self.name,
            job_id: job_id.to_string(),
            attempts_made: entry.attempts_made,
            payload: entry.payload.clone(),
            generation,
        })
    }

    fn complete(self: &Arc<Self>, job: &Job, outcome: Result<JobOutcome, HandlerError>) {
        let mut state = self.state.lock();
        let Some(entry) = state.jobs.get_mut(&job.job_id) else {
            return;
        };
        if entry.generation != job.generation {
            return;
        }
        entry.attempts_made += 1;

        let retry = match outcome {
            Ok(JobOutcome::Done) => false,
            Ok(JobOutcome::Retry) => true,
            Err(e) => {
                warn!(queue = %self.name, job_id = %job.job_id, error = %e, "Job handler failed");
                true
            }
        };

        if !retry {
            state.jobs.remove(&job.job_id);
            debug!(queue = %self.name, job_id = %job.job_id, "Job completed");
        } else if entry.cancelled {
            state.jobs.remove(&job.job_id);
            debug!(queue = %self.name, job_id = %job.job_id, "Job cancelled while active, not retrying");
        } else if entry.attempts_made >= self.config.max_attempts {
            let attempts = entry.attempts_made;
            state.jobs.remove(&job.job_id);
            warn!(
                queue = %self.name,
                job_id = %job.job_id,
                attempts = attempts,
                "Job exhausted its attempts, dropping"
            );
        } else {
            entry.state = JobState::Delayed;
            let generation = entry.generation;
            drop(state);
            self.promote_after(job.job_id.clone(), generation, self.config.backoff);
        }
    }
}

/// Process-local scheduler backed by tokio timers
pub struct InMemoryScheduler {
    queues: HashMap<QueueName, Arc<QueueInner>>,
    shutdown: watch::Sender<bool>,
}

impl InMemoryScheduler {
    pub fn new(poll: QueueConfig, cleanup: QueueConfig) -> Self {
        let mut queues = HashMap::new();
        queues.insert(QueueName::Poll, QueueInner::new(QueueName::Poll, poll));
        queues.insert(QueueName::Cleanup, QueueInner::new(QueueName::Cleanup, cleanup));
        let (shutdown, _) = watch::channel(false);

        Self { queues, shutdown }
    }

    fn queue(&self, name: QueueName) -> Result<&Arc<QueueInner>, SchedulerError> {
        self.queues
            .get(&name)
            .ok_or(SchedulerError::QueueNotRegistered(name))
    }

    /// Current state of a job, if it is still live
    pub fn job_state(&self, queue: QueueName, job_id: &str) -> Option<JobState> {
        let inner = self.queues.get(&queue)?;
        inner.state.lock().jobs.get(job_id).map(|entry| entry.state)
    }

    /// Number of live jobs in a queue
    pub fn live_jobs(&self, queue: QueueName) -> usize {
        self.queues
            .get(&queue)
            .map(|inner| inner.state.lock().jobs.len())
            .unwrap_or(0)
    }

    /// Stop all dispatchers; jobs already running finish
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Flips to `true` once `shutdown` is called
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[async_trait]
impl PollingScheduler for InMemoryScheduler {
    async fn schedule(
        &self,
        queue: QueueName,
        job_id: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<bool, SchedulerError> {
        let inner = self.queue(queue)?;

        let generation = {
            let mut state = inner.state.lock();
            if state.jobs.contains_key(job_id) {
                debug!(queue = %queue, job_id = %job_id, "Job already scheduled, ignoring");
                return Ok(false);
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.jobs.insert(
                job_id.to_string(),
                JobEntry {
                    generation,
                    payload,
                    attempts_made: 0,
                    state: if delay.is_zero() {
                        JobState::Waiting
                    } else {
                        JobState::Delayed
                    },
                    cancelled: false,
                },
            );
            generation
        };

        if delay.is_zero() {
            let _ = inner.ready_tx.send((job_id.to_string(), generation));
        } else {
            inner.promote_after(job_id.to_string(), generation, delay);
        }

        debug!(queue = %queue, job_id = %job_id, delay_ms = delay.as_millis() as u64, "Job scheduled");
        Ok(true)
    }

    async fn cancel(&self, queue: QueueName, job_id: &str) -> Result<(), SchedulerError> {
        let inner = self.queue(queue)?;
        let mut state = inner.state.lock();

        match state.jobs.get(job_id).map(|entry| entry.state) {
            Some(JobState::Active) => {
                if let Some(entry) = state.jobs.get_mut(job_id) {
                    entry.cancelled = true;
                }
                debug!(queue = %queue, job_id = %job_id, "Active job marked cancelled");
            }
            Some(_) => {
                state.jobs.remove(job_id);
                debug!(queue = %queue, job_id = %job_id, "Job cancelled");
            }
            None => {
                debug!(queue = %queue, job_id = %job_id, "Cancel for unknown job ignored");
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), SchedulerError> {
        let inner = self.queue(queue)?.clone();
        let mut ready_rx = inner
            .ready_rx
            .lock()
            .take()
            .ok_or(SchedulerError::AlreadyConsuming(queue))?;
        let mut shutdown = self.shutdown.subscribe();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        info!(queue = %queue, concurrency = concurrency.max(1), "Queue consumer started");

        tokio::spawn(async move {
            loop {
                let (job_id, generation) = tokio::select! {
                    _ = shutdown.changed() => break,
                    next = ready_rx.recv() => match next {
                        Some(next) => next,
                        None => break,
                    },
                };

                let permit = tokio::select! {
                    _ = shutdown.changed() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let Some(job) = inner.activate(&job_id, generation) else {
                    continue;
                };

                let inner = inner.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let delivered = job.clone();
                    let outcome = match tokio::spawn(async move { handler.handle(&delivered).await }).await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(format!("handler panicked: {}", e).into()),
                    };
                    inner.complete(&job, outcome);
                    drop(permit);
                });
            }

            info!(queue = %inner.name, "Queue consumer stopped");
        });

        Ok(())
    }
}
