use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;

pub type TaskId = Uuid;

/// Opaque unit of pipeline work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    /// Create or repair the symbolic link for a source file.
    Materialize { source: PathBuf },
}

impl TaskPayload {
    /// The path this payload concerns, used for path-keyed cancellation.
    pub fn path(&self) -> &Path {
        match self {
            TaskPayload::Materialize { source } => source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Externally visible snapshot of one task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: TaskId,
    pub state: TaskState,
    pub priority: u8,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Executes task payloads. The pipeline owns retry policy; runners report a
/// plain `Result` and are never retried internally.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, payload: &TaskPayload) -> Result<()>;
}

/// Intake contract producers (reconcilers) use. Producers only enqueue and
/// cancel-by-path; they never mutate a task after submission.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn submit(&self, payload: TaskPayload, priority: u8) -> TaskId;

    /// Cancel all still-pending tasks whose payload concerns `path`.
    /// Returns how many were cancelled.
    async fn cancel_path(&self, path: &Path) -> usize;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker pool size.
    pub workers: usize,
    /// Maximum execution attempts before a task is marked failed.
    pub max_retries: u32,
    /// Delay before a failed task re-enters the queue.
    pub retry_delay: Duration,
    /// How long terminal tasks stay visible for inspection.
    pub retention: Duration,
    /// Cadence of the terminal-task purge sweep.
    pub sweep_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retention: Duration::from_secs(86_400),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Heap key: lower priority value first, then enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert to get min-priority, FIFO ties.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct TaskEntry {
    payload: TaskPayload,
    state: TaskState,
    priority: u8,
    attempt_count: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl TaskEntry {
    fn status(&self, id: TaskId) -> TaskStatus {
        TaskStatus {
            id,
            state: self.state,
            priority: self.priority,
            attempt_count: self.attempt_count,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct PipelineState {
    heap: BinaryHeap<QueueEntry>,
    tasks: HashMap<TaskId, TaskEntry>,
    next_seq: u64,
    failed_permanently: u64,
}

impl PipelineState {
    fn push(&mut self, id: TaskId, priority: u8) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { priority, seq, id });
    }

    /// Pop the next runnable task, skipping entries whose task was cancelled
    /// while queued, and mark it running.
    fn pop_ready(&mut self) -> Option<(TaskId, TaskPayload)> {
        while let Some(entry) = self.heap.pop() {
            if let Some(task) = self.tasks.get_mut(&entry.id)
                && task.state == TaskState::Pending
            {
                task.state = TaskState::Running;
                task.started_at = Some(Utc::now());
                return Some((entry.id, task.payload.clone()));
            }
        }
        None
    }

    fn queue_depth(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }
}

/// Bounded worker pool draining a priority queue of reconciled change
/// events, with finite retries and run-to-completion semantics: a task once
/// started is never interrupted, only allowed to fail and retry on its own.
pub struct TaskPipeline {
    state: Arc<Mutex<PipelineState>>,
    wakeup: Arc<Notify>,
    config: PipelineConfig,
    runner: Arc<dyn TaskRunner>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaskPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPipeline")
            .field("workers", &self.config.workers)
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}

impl TaskPipeline {
    pub fn new(config: PipelineConfig, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(PipelineState::default())),
            wakeup: Arc::new(Notify::new()),
            config,
            runner,
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the worker pool and the terminal-task purge sweep.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() {
            return;
        }

        for worker_id in 0..self.config.workers.max(1) {
            let pipeline = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pipeline.worker_loop(worker_id).await;
            }));
        }

        let pipeline = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            pipeline.sweep_loop().await;
        }));

        info!("Task pipeline started with {} workers", self.config.workers);
    }

    async fn worker_loop(self: &Arc<Self>, worker_id: usize) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let next = self.state.lock().await.pop_ready();
            match next {
                Some((id, payload)) => self.execute(id, payload).await,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
        }
        debug!("Pipeline worker {} exited", worker_id);
    }

    async fn execute(self: &Arc<Self>, id: TaskId, payload: TaskPayload) {
        let outcome = self.runner.run(&payload).await;

        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return;
        };

        match outcome {
            Ok(()) => {
                task.state = TaskState::Completed;
                task.ended_at = Some(Utc::now());
                debug!(task = %id, "Task completed");
            }
            Err(err) => {
                task.attempt_count += 1;
                task.last_error = Some(err.to_string());

                if task.attempt_count < self.config.max_retries {
                    task.state = TaskState::Pending;
                    let attempt = task.attempt_count;
                    warn!(
                        task = %id,
                        attempt,
                        max = self.config.max_retries,
                        "Task failed, scheduling retry: {}",
                        err
                    );
                    drop(state);
                    self.schedule_retry(id);
                } else {
                    task.state = TaskState::Failed;
                    task.ended_at = Some(Utc::now());
                    state.failed_permanently += 1;
                    error!(
                        task = %id,
                        attempts = self.config.max_retries,
                        "Task failed permanently: {}",
                        err
                    );
                }
            }
        }
    }

    /// Re-enqueue after the retry delay, off the worker that failed so other
    /// workers keep draining the queue in the meantime.
    fn schedule_retry(self: &Arc<Self>, id: TaskId) {
        let pipeline = Arc::clone(self);
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = pipeline.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let mut state = pipeline.state.lock().await;
            // A cancel may have landed while the task waited out its delay.
            if let Some(task) = state.tasks.get(&id)
                && task.state == TaskState::Pending
            {
                let priority = task.priority;
                state.push(id, priority);
                drop(state);
                pipeline.wakeup.notify_one();
            }
        });
    }

    async fn sweep_loop(self: &Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sweep_interval) => {}
            }

            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.config.retention)
                    .unwrap_or_else(|_| chrono::Duration::seconds(86_400));

            let mut state = self.state.lock().await;
            let before = state.tasks.len();
            state.tasks.retain(|_, task| {
                !(task.state.is_terminal()
                    && task.ended_at.map(|t| t < cutoff).unwrap_or(false))
            });
            let purged = before - state.tasks.len();
            if purged > 0 {
                debug!("Purged {} terminal task records", purged);
            }
        }
    }

    /// Cancel a single task. Honored only while the task is still pending.
    pub async fn cancel(&self, id: TaskId) -> bool {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&id) {
            Some(task) if task.state == TaskState::Pending => {
                task.state = TaskState::Cancelled;
                task.ended_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub async fn task_status(&self, id: TaskId) -> Option<TaskStatus> {
        let state = self.state.lock().await;
        state.tasks.get(&id).map(|task| task.status(id))
    }

    pub async fn queue_depth(&self) -> usize {
        self.state.lock().await.queue_depth()
    }

    pub async fn failed_count(&self) -> u64 {
        self.state.lock().await.failed_permanently
    }

    /// Signal shutdown and join all workers, bounded by `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        info!("Shutting down task pipeline");
        self.shutdown.cancel();
        self.wakeup.notify_waiters();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Pipeline worker panicked during shutdown: {}", e),
                Err(_) => warn!("Pipeline worker timed out during shutdown"),
            }
        }
        info!("Task pipeline shutdown complete");
    }
}

#[async_trait]
impl TaskSink for TaskPipeline {
    async fn submit(&self, payload: TaskPayload, priority: u8) -> TaskId {
        let id = Uuid::now_v7();
        let mut state = self.state.lock().await;
        state.tasks.insert(
            id,
            TaskEntry {
                payload,
                state: TaskState::Pending,
                priority,
                attempt_count: 0,
                created_at: Utc::now(),
                started_at: None,
                ended_at: None,
                last_error: None,
            },
        );
        state.push(id, priority);
        drop(state);
        self.wakeup.notify_one();
        id
    }

    async fn cancel_path(&self, path: &Path) -> usize {
        let mut state = self.state.lock().await;
        let mut cancelled = 0;
        for task in state.tasks.values_mut() {
            if task.state == TaskState::Pending && task.payload.path() == path {
                task.state = TaskState::Cancelled;
                task.ended_at = Some(Utc::now());
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("Cancelled {} pending task(s) for {}", cancelled, path.display());
        }
        cancelled
    }
}
