//! The download manager: priority queue, admission, retry state machine and
//! the background monitors.
//!
//! # Concurrency Model
//!
//! - Every admitted task runs in its own Tokio task and holds one active slot
//! - All shared collections live in one `Mutex<SchedulerState>`; transfers
//!   never hold it across an await
//! - The ceiling is an atomic written by the controller and read by admission
//! - Every attempt carries a number; completion, failure and requeue only act
//!   when the number still matches, so each attempt leaves the active set once
//! - Monitors (speed sampler, stall detector, progress ticker) hold a `Weak`
//!   reference and exit when the last manager handle is dropped

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use super::concurrency::AdaptiveController;
use super::config::ManagerConfig;
use super::error::ManagerError;
use super::events::{CompletionSummary, DownloadEvent, ProgressThrottle, ProgressUpdate};
use super::stall::{ActiveTaskView, StallDetector};
use super::stats::{AggregateStats, BandwidthStats, SpeedMeter};
use super::task::{TaskId, TaskSnapshot, TaskSpec, TaskStatus};
use crate::download::{
    ChunkedDownloader, ChunkedRequest, DownloadError, FileState, HttpClient, RetryDecision,
    TransferProgress, TransferRequest, check_file, classify_error, discard, transfer,
};
use crate::source::SourceResolver;

/// Retries are served before any task that has never run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Retry,
    Fresh,
}

/// Pending order: lane, then higher priority, then FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingKey {
    lane: Lane,
    priority: Reverse<i32>,
    seq: u64,
}

/// Counters shared between one attempt and its observers.
#[derive(Debug)]
struct AttemptState {
    progress: TransferProgress,
    size: AtomicU64,
    chunks: Mutex<Vec<Arc<AtomicU64>>>,
}

impl AttemptState {
    fn new(sink: Arc<AtomicU64>, size: u64) -> Self {
        Self {
            progress: TransferProgress::with_sink(sink),
            size: AtomicU64::new(size),
            chunks: Mutex::new(Vec::new()),
        }
    }

    fn chunk_progress(&self) -> Vec<u64> {
        lock(&self.chunks)
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }
}

#[derive(Debug)]
struct TaskEntry {
    id: TaskId,
    spec: TaskSpec,
    status: TaskStatus,
    retry_count: u32,
    /// Size counted in `total_bytes`; refined after a probe or completion.
    size: u64,
    attempt: u64,
    started_at: Option<Instant>,
    attempt_state: Arc<AttemptState>,
    job: Option<JoinHandle<()>>,
    last_error: Option<String>,
    finished_bytes: u64,
}

impl TaskEntry {
    #[allow(clippy::cast_precision_loss)]
    fn snapshot(&self) -> TaskSnapshot {
        let downloaded = if self.status == TaskStatus::Completed {
            self.finished_bytes
        } else {
            self.attempt_state.progress.bytes()
        };
        let speed_bps = match (self.status, self.started_at) {
            (TaskStatus::Downloading | TaskStatus::Paused, Some(started)) => {
                let secs = started.elapsed().as_secs_f64();
                if secs > 0.0 { downloaded as f64 / secs } else { 0.0 }
            }
            _ => 0.0,
        };
        TaskSnapshot {
            id: self.id.clone(),
            url: self.spec.url().to_string(),
            dest: self.spec.dest().to_path_buf(),
            status: self.status,
            priority: self.spec.priority(),
            size: self.size.max(self.attempt_state.size.load(Ordering::Relaxed)),
            downloaded,
            speed_bps,
            retry_count: self.retry_count,
            chunk_progress: self.attempt_state.chunk_progress(),
            last_error: self.last_error.clone(),
            kind: self.spec.kind().map(str::to_string),
            metadata: self.spec.metadata().clone(),
        }
    }

    fn is_running(&self) -> bool {
        matches!(self.status, TaskStatus::Downloading | TaskStatus::Paused)
    }
}

#[derive(Debug)]
struct SchedulerState {
    session: u64,
    next_seq: u64,
    tasks: HashMap<TaskId, TaskEntry>,
    order: Vec<TaskId>,
    pending: BTreeMap<PendingKey, TaskId>,
    active: HashSet<TaskId>,
    backoff: HashSet<TaskId>,
    by_dest: HashMap<PathBuf, TaskId>,
    failed: Vec<TaskId>,
    completed_files: usize,
    failed_files: usize,
    completed_bytes: u64,
    total_bytes: u64,
    speed: SpeedMeter,
    session_start: Instant,
    throttle: ProgressThrottle,
    all_completed_emitted: bool,
}

impl SchedulerState {
    fn new(session: u64, progress_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            session,
            next_seq: 0,
            tasks: HashMap::new(),
            order: Vec::new(),
            pending: BTreeMap::new(),
            active: HashSet::new(),
            backoff: HashSet::new(),
            by_dest: HashMap::new(),
            failed: Vec::new(),
            completed_files: 0,
            failed_files: 0,
            completed_bytes: 0,
            total_bytes: 0,
            speed: SpeedMeter::new(now),
            session_start: now,
            throttle: ProgressThrottle::new(progress_interval),
            all_completed_emitted: false,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn queued_count(&self) -> usize {
        self.pending.len() + self.backoff.len()
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty() && self.backoff.is_empty()
    }

    fn summary(&self) -> CompletionSummary {
        CompletionSummary {
            completed: self.completed_files,
            failed: self.failed_files,
            total: self.tasks.len(),
        }
    }

    fn aggregate(&self) -> AggregateStats {
        let in_flight: u64 = self
            .active
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .map(|entry| entry.attempt_state.progress.bytes())
            .sum();
        AggregateStats {
            total_files: self.tasks.len(),
            completed_files: self.completed_files,
            failed_files: self.failed_files,
            total_bytes: self.total_bytes,
            downloaded_bytes: self.completed_bytes + in_flight,
            active_count: self.active.len(),
            queued_count: self.queued_count(),
            speed_bps: self.speed.current(),
        }
    }

    fn progress_update(&self, task_id: Option<TaskId>) -> ProgressUpdate {
        let stats = self.aggregate();
        ProgressUpdate {
            task_id,
            total_progress_percent: stats.progress_percent(),
            aggregate_speed: stats.speed_bps,
            downloaded_bytes: stats.downloaded_bytes,
            total_bytes: stats.total_bytes,
            active_count: stats.active_count,
            queued_count: stats.queued_count,
        }
    }

    fn recount_size(&mut self, id: &TaskId, size: u64) {
        if let Some(entry) = self.tasks.get_mut(id)
            && entry.size != size
        {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size) + size;
            entry.size = size;
        }
    }
}

/// One admitted attempt, moved into its Tokio task.
#[derive(Debug)]
struct Job {
    id: TaskId,
    attempt: u64,
    session: u64,
    spec: TaskSpec,
    state: Arc<AttemptState>,
}

/// What a successful attempt produced.
#[derive(Debug, Clone, Copy)]
struct JobOutcome {
    bytes: u64,
    skipped: bool,
}

struct Inner {
    config: ManagerConfig,
    runtime: Handle,
    client: HttpClient,
    chunked: ChunkedDownloader,
    resolver: Option<Arc<dyn SourceResolver>>,
    stall: StallDetector,
    state: Mutex<SchedulerState>,
    controller: Mutex<AdaptiveController>,
    ceiling: AtomicUsize,
    events: broadcast::Sender<DownloadEvent>,
    admission_requested: AtomicBool,
    admission_running: AtomicBool,
    paused: AtomicBool,
    stopped: AtomicBool,
    idle: Notify,
    transferred: Arc<AtomicU64>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("ceiling", &self.ceiling.load(Ordering::Relaxed))
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .field("has_resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

/// Handle to one download session.
///
/// Cheap to clone; all clones drive the same queue. Construct it inside a
/// Tokio runtime, the background monitors are spawned on that runtime.
///
/// # Example
///
/// ```no_run
/// use assetfetch_core::{DownloadManager, ManagerConfig, TaskSpec};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = DownloadManager::new(ManagerConfig::default())?;
/// let mut events = manager.subscribe();
/// manager.add_task(
///     TaskSpec::builder("https://example.com/client.jar", "versions/1.20/1.20.jar")
///         .priority(10)
///         .build()?,
/// )?;
/// let summary = manager.wait_for_completion().await?;
/// println!("{} completed, {} failed", summary.completed, summary.failed);
/// # drop(events.try_recv());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Creates a manager with its own HTTP client and no URL rewriting.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Config`] when `config` fails validation
    /// - [`ManagerError::Client`] when the HTTP client cannot be built
    /// - [`ManagerError::NoRuntime`] outside a Tokio runtime
    pub fn new(config: ManagerConfig) -> Result<Self, ManagerError> {
        config.validate()?;
        let client = HttpClient::new()?;
        Self::with_parts(config, client, None)
    }

    /// Creates a manager that rewrites every enqueued URL through `resolver`.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_resolver(
        config: ManagerConfig,
        resolver: Arc<dyn SourceResolver>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let client = HttpClient::new()?;
        Self::with_parts(config, client, Some(resolver))
    }

    /// Creates a manager from explicit collaborators.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Config`] or [`ManagerError::NoRuntime`].
    #[instrument(level = "debug", skip_all)]
    pub fn with_parts(
        config: ManagerConfig,
        client: HttpClient,
        resolver: Option<Arc<dyn SourceResolver>>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime)?;

        let chunked = ChunkedDownloader::new(
            client.clone(),
            config.chunk_size,
            config.max_threads_per_file,
            config.chunk_timeout,
            config.stall.stall_window,
        );
        let stall = StallDetector::new(config.stall.clone(), config.large_file_threshold);
        let (events, _) = broadcast::channel(config.event_capacity);
        let controller = AdaptiveController::new(config.controller.clone());
        let ceiling = controller.ceiling();

        debug!(
            ceiling,
            min = config.controller.min_concurrency,
            max = config.controller.max_concurrency,
            max_retries = config.retry.max_retries(),
            "creating download manager"
        );

        let inner = Arc::new(Inner {
            state: Mutex::new(SchedulerState::new(0, config.progress_interval)),
            controller: Mutex::new(controller),
            ceiling: AtomicUsize::new(ceiling),
            runtime,
            client,
            chunked,
            resolver,
            stall,
            events,
            admission_requested: AtomicBool::new(false),
            admission_running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            idle: Notify::new(),
            transferred: Arc::new(AtomicU64::new(0)),
            config,
        });
        Inner::start_monitors(&inner);
        Ok(Self { inner })
    }

    /// New receiver for every event sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Enqueues one task and runs an admission pass.
    ///
    /// A task whose destination is already pending, running, retrying or
    /// completed is not added again; the existing task's id is returned.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::Stopped`] after [`stop`](Self::stop)
    /// - [`ManagerError::DuplicateTaskId`] when a caller-chosen id is taken
    pub fn add_task(&self, spec: TaskSpec) -> Result<TaskId, ManagerError> {
        let id = self.inner.enqueue(spec)?;
        self.inner.request_admission();
        Ok(id)
    }

    /// Enqueues several tasks with a single admission pass at the end.
    ///
    /// # Errors
    ///
    /// Stops at the first error; tasks before it stay enqueued.
    pub fn add_tasks(
        &self,
        specs: impl IntoIterator<Item = TaskSpec>,
    ) -> Result<Vec<TaskId>, ManagerError> {
        let mut ids = Vec::new();
        let mut result = Ok(());
        for spec in specs {
            match self.inner.enqueue(spec) {
                Ok(id) => ids.push(id),
                Err(error) => {
                    result = Err(error);
                    break;
                }
            }
        }
        self.inner.request_admission();
        result.map(|()| ids)
    }

    /// Suspends admission and marks running tasks paused. In-flight
    /// transfers keep going.
    pub fn pause(&self) {
        if self.inner.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.inner.lock_state();
        let active: Vec<TaskId> = state.active.iter().cloned().collect();
        for id in &active {
            if let Some(entry) = state.tasks.get_mut(id) {
                entry.status = TaskStatus::Paused;
            }
        }
        info!(active = active.len(), "downloads paused");
    }

    /// Restores paused tasks and resumes admission.
    pub fn resume(&self) {
        if !self.inner.paused.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.inner.lock_state();
            let active: Vec<TaskId> = state.active.iter().cloned().collect();
            for id in &active {
                if let Some(entry) = state.tasks.get_mut(id)
                    && entry.status == TaskStatus::Paused
                {
                    entry.status = TaskStatus::Downloading;
                }
            }
        }
        info!("downloads resumed");
        self.inner.request_admission();
    }

    /// Whether admission is suspended.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Aborts every in-flight transfer, drops queued work and removes the
    /// chunk directory. The manager stays inert until [`reset`](Self::reset).
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let jobs = {
            let mut state = self.inner.lock_state();
            state.session += 1;
            let mut jobs = Vec::new();
            let mut dropped: Vec<TaskId> = state.active.drain().collect();
            dropped.extend(std::mem::take(&mut state.pending).into_values());
            dropped.extend(state.backoff.drain());
            for id in &dropped {
                if let Some(entry) = state.tasks.get_mut(id) {
                    entry.status = TaskStatus::Cancelled;
                    entry.last_error = Some(DownloadError::cancelled(entry.spec.url()).to_string());
                    if let Some(job) = entry.job.take() {
                        job.abort();
                        jobs.push(job);
                    }
                }
            }
            info!(aborted = jobs.len(), "download manager stopped");
            jobs
        };

        // Wait for cancellation so no chunk writer outlives the cleanup below.
        for result in join_all(jobs).await {
            if let Err(error) = result
                && !error.is_cancelled()
            {
                warn!(error = %error, "download task panicked");
            }
        }

        let temp_dir = &self.inner.config.temp_dir;
        if let Err(error) = tokio::fs::remove_dir_all(temp_dir).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %temp_dir.display(), error = %error, "failed to remove chunk directory");
        }
        self.inner.idle.notify_waiters();
    }

    /// Whether [`stop`](Self::stop) has been called since the last reset.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stops if needed, then starts a fresh session: no tasks, zeroed
    /// counters, initial ceiling.
    pub async fn reset(&self) {
        self.stop().await;
        {
            let mut state = self.inner.lock_state();
            let session = state.session + 1;
            *state = SchedulerState::new(session, self.inner.config.progress_interval);
        }
        let ceiling = {
            let mut controller = self.inner.lock_controller();
            controller.reset();
            controller.ceiling()
        };
        self.inner.ceiling.store(ceiling, Ordering::SeqCst);
        self.inner.transferred.store(0, Ordering::Relaxed);
        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.stopped.store(false, Ordering::SeqCst);
        debug!(ceiling, "download manager reset");
    }

    /// Current file and byte counters.
    #[must_use]
    pub fn stats(&self) -> AggregateStats {
        self.inner.lock_state().aggregate()
    }

    /// Throughput, efficiency and controller history.
    #[must_use]
    pub fn bandwidth_stats(&self) -> BandwidthStats {
        let (average_speed, efficiency, adjustments, ceiling, min, max) = {
            let controller = self.inner.lock_controller();
            let state = controller.state();
            (
                controller.average_speed(),
                controller.efficiency(),
                controller.adjustments(),
                state.ceiling,
                state.min,
                state.max,
            )
        };
        let state = self.inner.lock_state();
        BandwidthStats {
            current_speed: state.speed.current(),
            average_speed,
            peak_speed: state.speed.peak(),
            efficiency,
            total_transferred: self.inner.transferred.load(Ordering::Relaxed),
            session_elapsed: state.session_start.elapsed(),
            concurrency: ceiling,
            min_concurrency: min,
            max_concurrency: max,
            adjustments,
        }
    }

    /// Sets the ceiling explicitly and runs an admission pass.
    ///
    /// Lowering the ceiling never cancels running tasks; it only holds back
    /// admission until enough of them finish.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Concurrency`] when `n` is outside the configured bounds.
    pub fn set_concurrency(&self, n: usize) -> Result<(), ManagerError> {
        let record = self.inner.lock_controller().set_manual(n, Instant::now())?;
        self.inner.ceiling.store(record.to, Ordering::SeqCst);
        info!(from = record.from, to = record.to, "concurrency set manually");
        self.inner.emit(DownloadEvent::ConcurrencyAdjusted(record));
        self.inner.request_admission();
        Ok(())
    }

    /// Current ceiling.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.inner.ceiling.load(Ordering::SeqCst)
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn task(&self, id: &TaskId) -> Option<TaskSnapshot> {
        self.inner.lock_state().tasks.get(id).map(TaskEntry::snapshot)
    }

    /// Snapshots of every task in enqueue order.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.lock_state();
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(TaskEntry::snapshot)
            .collect()
    }

    /// Snapshots of tasks that exhausted their retries, in failure order.
    #[must_use]
    pub fn failed_tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.lock_state();
        state
            .failed
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .map(TaskEntry::snapshot)
            .collect()
    }

    /// Resolves once nothing is pending, retrying or running.
    ///
    /// # Errors
    ///
    /// [`ManagerError::Stopped`] if the manager is or becomes stopped.
    pub async fn wait_for_completion(&self) -> Result<CompletionSummary, ManagerError> {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.stopped.load(Ordering::SeqCst) {
                return Err(ManagerError::Stopped);
            }
            {
                let state = self.inner.lock_state();
                if state.is_idle() {
                    return Ok(state.summary());
                }
            }
            notified.await;
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        lock(&self.state)
    }

    fn lock_controller(&self) -> MutexGuard<'_, AdaptiveController> {
        lock(&self.controller)
    }

    fn emit(&self, event: DownloadEvent) {
        if self.events.send(event).is_err() {
            trace!("no event subscribers");
        }
    }

    fn enqueue(&self, mut spec: TaskSpec) -> Result<TaskId, ManagerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ManagerError::Stopped);
        }
        if let Some(resolver) = &self.resolver {
            let rewritten = resolver.transform_url(spec.url());
            if rewritten != spec.url() {
                trace!(from = %spec.url(), to = %rewritten, "url rewritten by source");
                spec.set_url(rewritten);
            }
        }

        let mut state = self.lock_state();
        if let Some(existing) = state.by_dest.get(spec.dest()) {
            debug!(task_id = %existing, dest = %spec.dest().display(), "duplicate destination ignored");
            return Ok(existing.clone());
        }

        let seq = state.next_seq();
        let id = spec
            .id()
            .cloned()
            .unwrap_or_else(|| TaskId::generated(seq));
        if let Some(existing) = state.tasks.get(&id) {
            return Err(ManagerError::DuplicateTaskId {
                id,
                existing_dest: existing.spec.dest().to_path_buf(),
            });
        }

        let size = spec.size();
        let key = PendingKey {
            lane: Lane::Fresh,
            priority: Reverse(spec.priority()),
            seq,
        };
        debug!(task_id = %id, priority = spec.priority(), size, url = %spec.url(), "task enqueued");

        state.by_dest.insert(spec.dest().to_path_buf(), id.clone());
        state.pending.insert(key, id.clone());
        state.order.push(id.clone());
        state.total_bytes += size;
        state.all_completed_emitted = false;
        let attempt_state = Arc::new(AttemptState::new(Arc::clone(&self.transferred), size));
        state.tasks.insert(
            id.clone(),
            TaskEntry {
                id: id.clone(),
                spec,
                status: TaskStatus::Pending,
                retry_count: 0,
                size,
                attempt: 0,
                started_at: None,
                attempt_state,
                job: None,
                last_error: None,
                finished_bytes: 0,
            },
        );
        Ok(id)
    }

    /// Runs admission passes until no request is outstanding. Concurrent
    /// callers coalesce: one of them loops, the rest just raise the flag.
    fn request_admission(self: &Arc<Self>) {
        self.admission_requested.store(true, Ordering::SeqCst);
        loop {
            if self.admission_running.swap(true, Ordering::SeqCst) {
                return;
            }
            while self.admission_requested.swap(false, Ordering::SeqCst) {
                self.admission_pass();
            }
            self.admission_running.store(false, Ordering::SeqCst);
            if !self.admission_requested.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn admission_pass(self: &Arc<Self>) {
        if self.paused.load(Ordering::SeqCst) || self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let ceiling = self.ceiling.load(Ordering::SeqCst);
        let mut state = self.lock_state();
        while state.active.len() < ceiling {
            let Some((_, id)) = state.pending.pop_first() else {
                break;
            };
            let session = state.session;
            let Some(entry) = state.tasks.get_mut(&id) else {
                continue;
            };
            entry.attempt += 1;
            entry.status = TaskStatus::Downloading;
            entry.started_at = Some(Instant::now());
            entry.attempt_state = Arc::new(AttemptState::new(
                Arc::clone(&self.transferred),
                entry.size,
            ));
            let job = Job {
                id: id.clone(),
                attempt: entry.attempt,
                session,
                spec: entry.spec.clone(),
                state: Arc::clone(&entry.attempt_state),
            };
            let event = DownloadEvent::TaskStarted {
                id: id.clone(),
                dest_name: entry.spec.dest_name(),
                size: entry.size,
            };
            debug!(task_id = %id, attempt = entry.attempt, retry_count = entry.retry_count, "task admitted");
            entry.job = Some(self.runtime.spawn(run_job(Arc::clone(self), job)));
            state.active.insert(id);
            self.emit(event);
        }
    }

    fn schedule_admission(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.request_admission();
            }
        });
    }

    /// Takes an attempt out of the active set if it is still the current one.
    fn claim_attempt<'a>(
        state: &'a mut SchedulerState,
        id: &TaskId,
        attempt: u64,
        session: u64,
    ) -> Option<&'a mut TaskEntry> {
        if state.session != session || !state.active.contains(id) {
            return None;
        }
        let current = state
            .tasks
            .get(id)
            .is_some_and(|entry| entry.attempt == attempt && entry.is_running());
        if !current {
            return None;
        }
        state.active.remove(id);
        state.tasks.get_mut(id)
    }

    fn complete(self: &Arc<Self>, job: &Job, outcome: JobOutcome) {
        {
            let mut state = self.lock_state();
            let Some(entry) = Self::claim_attempt(&mut state, &job.id, job.attempt, job.session)
            else {
                trace!(task_id = %job.id, attempt = job.attempt, "stale completion ignored");
                return;
            };
            entry.status = TaskStatus::Completed;
            entry.job = None;
            entry.finished_bytes = outcome.bytes;
            entry.last_error = None;
            let dest_name = entry.spec.dest_name();
            info!(
                task_id = %job.id,
                bytes = outcome.bytes,
                skipped = outcome.skipped,
                retry_count = entry.retry_count,
                "task completed"
            );

            state.recount_size(&job.id, outcome.bytes);
            state.completed_files += 1;
            state.completed_bytes += outcome.bytes;
            self.emit(DownloadEvent::TaskCompleted {
                id: job.id.clone(),
                dest_name,
            });
            if state.throttle.ready(Instant::now()) {
                let update = state.progress_update(Some(job.id.clone()));
                self.emit(DownloadEvent::Progress(update));
            }
            self.finish_if_idle(&mut state);
        }
        self.schedule_admission(self.config.completion_defer);
    }

    /// Failure path shared by transfer errors and stall verdicts.
    fn fail(
        self: &Arc<Self>,
        id: &TaskId,
        attempt: u64,
        session: u64,
        error: &DownloadError,
        abort_running: bool,
    ) {
        {
            let mut state = self.lock_state();
            let Some(entry) = Self::claim_attempt(&mut state, id, attempt, session) else {
                trace!(task_id = %id, attempt, "stale failure ignored");
                return;
            };
            if let Some(job) = entry.job.take()
                && abort_running
            {
                job.abort();
            }
            entry.retry_count += 1;
            entry.last_error = Some(error.to_string());
            let failure_type = classify_error(error);
            let dest_name = entry.spec.dest_name();
            let retry_count = entry.retry_count;

            match self.config.retry.should_retry(failure_type, retry_count) {
                RetryDecision::Retry { delay, .. } => {
                    entry.status = TaskStatus::Pending;
                    let dest = entry.spec.dest().to_path_buf();
                    warn!(
                        task_id = %id,
                        error = %error,
                        retry_count,
                        delay_ms = delay.as_millis(),
                        "task failed, will retry"
                    );
                    state.backoff.insert(id.clone());
                    self.emit(DownloadEvent::TaskRetrying {
                        id: id.clone(),
                        dest_name,
                        error: error.to_string(),
                        retry_count,
                        delay,
                    });
                    self.schedule_requeue(
                        id.clone(),
                        attempt,
                        session,
                        delay,
                        error.is_integrity_failure().then_some(dest),
                    );
                }
                RetryDecision::DoNotRetry { reason } => {
                    entry.status = TaskStatus::Failed;
                    let dest = entry.spec.dest().to_path_buf();
                    warn!(
                        task_id = %id,
                        error = %error,
                        retry_count,
                        reason = %reason,
                        "task failed permanently"
                    );
                    state.by_dest.remove(&dest);
                    state.failed.push(id.clone());
                    state.failed_files += 1;
                    self.emit(DownloadEvent::TaskFailed {
                        id: id.clone(),
                        dest_name,
                        error: error.to_string(),
                        retry_count,
                    });
                    self.finish_if_idle(&mut state);
                }
            }
        }
        self.schedule_admission(self.config.failure_defer);
    }

    fn schedule_requeue(
        self: &Arc<Self>,
        id: TaskId,
        attempt: u64,
        session: u64,
        delay: Duration,
        discard_first: Option<PathBuf>,
    ) {
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(dest) = discard_first {
                discard(&dest).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.requeue(&id, attempt, session);
            }
        });
    }

    fn requeue(self: &Arc<Self>, id: &TaskId, attempt: u64, session: u64) {
        {
            let mut state = self.lock_state();
            if state.session != session || !state.backoff.remove(id) {
                return;
            }
            let Some(entry) = state.tasks.get(id) else {
                return;
            };
            if entry.attempt != attempt {
                return;
            }
            let priority = entry.spec.priority();
            let seq = state.next_seq();
            state.pending.insert(
                PendingKey {
                    lane: Lane::Retry,
                    priority: Reverse(priority),
                    seq,
                },
                id.clone(),
            );
            debug!(task_id = %id, "task requeued for retry");
        }
        self.request_admission();
    }

    fn finish_if_idle(&self, state: &mut SchedulerState) {
        if state.is_idle() && !state.all_completed_emitted && !state.tasks.is_empty() {
            state.all_completed_emitted = true;
            let summary = state.summary();
            info!(
                completed = summary.completed,
                failed = summary.failed,
                total = summary.total,
                "all downloads finished"
            );
            self.emit(DownloadEvent::Progress(state.progress_update(None)));
            self.emit(DownloadEvent::AllCompleted(summary));
            self.idle.notify_waiters();
        }
    }

    fn start_monitors(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        let sample_interval = inner.config.controller.sample_interval;
        inner
            .runtime
            .spawn(monitor_loop(weak.clone(), sample_interval, Self::sample_tick));
        inner
            .runtime
            .spawn(monitor_loop(weak.clone(), inner.stall.tick(), Self::stall_tick));
        inner
            .runtime
            .spawn(monitor_loop(weak, inner.config.progress_interval, Self::progress_tick));
    }

    /// Feeds the controller one speed sample and applies its decision.
    fn sample_tick(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let (speed, active, admissible) = {
            let mut state = self.lock_state();
            let total = self.transferred.load(Ordering::Relaxed);
            let speed = state.speed.sample(total, now);
            // Tasks waiting out a backoff cannot be admitted yet.
            (speed, state.active.len(), state.pending.len())
        };
        // Nothing is being admitted while paused, so idle slots say nothing
        // about the network.
        if self.paused.load(Ordering::SeqCst) || (active == 0 && admissible == 0) {
            return;
        }
        let decision = {
            let mut controller = self.lock_controller();
            controller.record_sample(speed);
            controller.evaluate(now, active, admissible)
        };
        if let Some(record) = decision {
            self.ceiling.store(record.to, Ordering::SeqCst);
            let increased = record.to > record.from;
            self.emit(DownloadEvent::ConcurrencyAdjusted(record));
            if increased {
                self.request_admission();
            }
        }
    }

    /// Force-fails attempts that stopped receiving data or ran out of time.
    fn stall_tick(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let (session, views) = {
            let state = self.lock_state();
            let views: Vec<ActiveTaskView> = state
                .active
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .filter_map(|entry| {
                    Some(ActiveTaskView {
                        id: entry.id.clone(),
                        attempt: entry.attempt,
                        url: entry.spec.url().to_string(),
                        started_at: entry.started_at?,
                        idle: entry.attempt_state.progress.idle_for(now),
                        size: entry
                            .size
                            .max(entry.attempt_state.size.load(Ordering::Relaxed)),
                    })
                })
                .collect();
            (state.session, views)
        };
        for (view, verdict) in self.stall.scan(now, &views) {
            warn!(task_id = %view.id, verdict = ?verdict, "forcing stuck task into failure");
            self.fail(
                &view.id,
                view.attempt,
                session,
                &verdict.into_error(&view.url),
                true,
            );
        }
    }

    fn progress_tick(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let update = {
            let mut state = self.lock_state();
            if state.active.is_empty() || !state.throttle.ready(Instant::now()) {
                return;
            }
            state.progress_update(None)
        };
        self.emit(DownloadEvent::Progress(update));
    }
}

async fn monitor_loop(weak: Weak<Inner>, period: Duration, tick: fn(&Arc<Inner>)) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        tick(&inner);
    }
}

async fn run_job(inner: Arc<Inner>, job: Job) {
    match execute(&inner, &job).await {
        Ok(outcome) => inner.complete(&job, outcome),
        Err(error) => inner.fail(&job.id, job.attempt, job.session, &error, false),
    }
}

/// One attempt: skip-if-valid, size probe, chunked or single-stream transfer.
#[instrument(skip(inner, job), fields(task_id = %job.id, attempt = job.attempt))]
async fn execute(inner: &Inner, job: &Job) -> Result<JobOutcome, DownloadError> {
    let spec = &job.spec;
    let dest = spec.dest();
    if let Some(parent) = dest.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }

    let known_size = (spec.size() > 0).then_some(spec.size());
    if check_file(dest, known_size, spec.expected_hash()).await == FileState::Valid {
        let bytes = tokio::fs::metadata(dest)
            .await
            .map(|m| m.len())
            .map_err(|e| DownloadError::io(dest, e))?;
        debug!(dest = %dest.display(), "destination already valid, skipping transfer");
        job.state.progress.set_bytes(bytes);
        return Ok(JobOutcome {
            bytes,
            skipped: true,
        });
    }

    let size = match known_size {
        Some(size) => size,
        None => inner.client.probe_size(spec.url()).await.unwrap_or(0),
    };
    job.state.size.store(size, Ordering::Relaxed);

    if size > inner.config.large_file_threshold {
        let work_dir = inner
            .config
            .temp_dir
            .join(format!("task-{}-{}", job.id.as_str().replace(['/', '\\'], "_"), job.attempt));
        let chunks = inner.chunked.plan(size, &work_dir);
        *lock(&job.state.chunks) = chunks.iter().map(|c| c.progress_handle()).collect();
        let request = ChunkedRequest {
            url: spec.url(),
            dest,
            size,
            expected_hash: spec.expected_hash(),
            work_dir: &work_dir,
        };
        match inner
            .chunked
            .download(request, &chunks, &job.state.progress)
            .await
        {
            Ok(outcome) => {
                return Ok(JobOutcome {
                    bytes: outcome.total_bytes,
                    skipped: false,
                });
            }
            Err(DownloadError::RangeNotSupported { .. }) => {
                debug!("server ignored range requests, falling back to a single stream");
                lock(&job.state.chunks).clear();
            }
            Err(error) => return Err(error),
        }
    }

    let outcome = transfer(
        &inner.client,
        TransferRequest {
            url: spec.url(),
            dest,
            expected_hash: spec.expected_hash(),
            expected_size: known_size,
            resume: inner.config.resume_partial,
            overall_timeout: inner.stall.timeout_for(size),
            stall_timeout: inner.config.stall.stall_window,
        },
        &job.state.progress,
    )
    .await?;
    Ok(JobOutcome {
        bytes: outcome.total_bytes,
        skipped: false,
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::RetryPolicy;
    use crate::scheduler::ControllerConfig;
    use tempfile::TempDir;

    fn key(lane: Lane, priority: i32, seq: u64) -> PendingKey {
        PendingKey {
            lane,
            priority: Reverse(priority),
            seq,
        }
    }

    fn test_config(dir: &TempDir) -> ManagerConfig {
        ManagerConfig {
            temp_dir: dir.path().join("chunks"),
            ..ManagerConfig::default()
        }
    }

    fn eager_controller(dir: &TempDir) -> ManagerConfig {
        ManagerConfig {
            controller: ControllerConfig {
                sample_interval: Duration::from_millis(20),
                cooldown: Duration::from_millis(40),
                min_samples: 1,
                ..Default::default()
            },
            ..test_config(dir)
        }
    }

    #[tokio::test]
    async fn test_controller_holds_ceiling_while_paused() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(eager_controller(&dir)).unwrap();
        manager.pause();
        let specs = (0..5).map(|i| {
            TaskSpec::builder(format!("http://127.0.0.1:9/f{i}"), dir.path().join(format!("f{i}")))
                .build()
                .unwrap()
        });
        manager.add_tasks(specs).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(manager.concurrency(), 12);
        assert!(manager.bandwidth_stats().adjustments.is_empty());
        assert_eq!(manager.stats().active_count, 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_controller_ignores_tasks_waiting_out_backoff() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig {
            retry: RetryPolicy::new(1, Duration::from_secs(30), Duration::from_secs(30)),
            controller: ControllerConfig {
                min_samples: 3,
                ..eager_controller(&dir).controller
            },
            ..test_config(&dir)
        };
        let manager = DownloadManager::new(config).unwrap();
        let id = manager
            .add_task(
                TaskSpec::builder("http://127.0.0.1:9/gone", dir.path().join("gone"))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while manager.task(&id).map_or(0, |t| t.retry_count) == 0 {
            assert!(Instant::now() < deadline, "first attempt never failed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(manager.stats().queued_count, 1);
        assert_eq!(manager.concurrency(), 12);
        assert!(manager.bandwidth_stats().adjustments.is_empty());
        manager.stop().await;
    }

    #[test]
    fn test_pending_order_retry_lane_then_priority_then_fifo() {
        let mut pending = BTreeMap::new();
        pending.insert(key(Lane::Fresh, 5, 1), "b");
        pending.insert(key(Lane::Fresh, 10, 2), "a");
        pending.insert(key(Lane::Fresh, 5, 3), "c");
        pending.insert(key(Lane::Retry, 1, 4), "retry");
        let order: Vec<_> = std::iter::from_fn(|| pending.pop_first().map(|(_, v)| v)).collect();
        assert_eq!(order, vec!["retry", "a", "b", "c"]);
    }

    #[test]
    fn test_construction_outside_runtime_is_rejected() {
        let dir = TempDir::new().unwrap();
        let client = HttpClient::new().unwrap();
        assert!(matches!(
            DownloadManager::with_parts(test_config(&dir), client, None),
            Err(ManagerError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_synchronously() {
        let mut config = ManagerConfig::default();
        config.controller.min_concurrency = 10;
        config.controller.max_concurrency = 2;
        assert!(matches!(
            DownloadManager::new(config),
            Err(ManagerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_existing_file_completes_without_network() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("present.txt");
        std::fs::write(&dest, b"hello").unwrap();

        let manager = DownloadManager::new(test_config(&dir)).unwrap();
        let id = manager
            .add_task(
                TaskSpec::builder("http://127.0.0.1:9/present.txt", &dest)
                    .hash("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let summary = manager.wait_for_completion().await.unwrap();
        assert_eq!(
            summary,
            CompletionSummary {
                completed: 1,
                failed: 0,
                total: 1
            }
        );
        let snapshot = manager.task(&id).unwrap();
        assert_eq!(snapshot.status, TaskStatus::Completed);
        assert_eq!(snapshot.downloaded, 5);

        // completed destinations are not enqueued again
        let again = manager
            .add_task(
                TaskSpec::builder("http://127.0.0.1:9/other", &dest)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert_eq!(again, id);
        assert_eq!(manager.stats().total_files, 1);
    }

    #[tokio::test]
    async fn test_caller_id_collision_is_reported() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&dir)).unwrap();
        manager.pause();
        manager
            .add_task(
                TaskSpec::builder("http://127.0.0.1:9/a", dir.path().join("a"))
                    .id("same")
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let err = manager
            .add_task(
                TaskSpec::builder("http://127.0.0.1:9/b", dir.path().join("b"))
                    .id("same")
                    .build()
                    .unwrap(),
            )
            .unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateTaskId { .. }));
    }

    #[tokio::test]
    async fn test_empty_session_is_immediately_complete() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&dir)).unwrap();
        let summary = manager.wait_for_completion().await.unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn test_manual_concurrency_bounds() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&dir)).unwrap();
        let mut events = manager.subscribe();
        manager.set_concurrency(20).unwrap();
        assert_eq!(manager.concurrency(), 20);
        assert!(matches!(
            manager.set_concurrency(100),
            Err(ManagerError::Concurrency(_))
        ));
        assert_eq!(manager.concurrency(), 20);
        match events.try_recv().unwrap() {
            DownloadEvent::ConcurrencyAdjusted(record) => {
                assert_eq!(record.to, 20);
            }
            other => panic!("unexpected event {other:?}"),
        }
        let bandwidth = manager.bandwidth_stats();
        assert_eq!(bandwidth.concurrency, 20);
        assert_eq!(bandwidth.adjustments.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_makes_manager_inert_until_reset() {
        let dir = TempDir::new().unwrap();
        let manager = DownloadManager::new(test_config(&dir)).unwrap();
        manager.stop().await;
        assert!(manager.is_stopped());
        assert!(matches!(
            manager.add_task(
                TaskSpec::builder("http://127.0.0.1:9/a", dir.path().join("a"))
                    .build()
                    .unwrap()
            ),
            Err(ManagerError::Stopped)
        ));
        assert!(matches!(
            manager.wait_for_completion().await,
            Err(ManagerError::Stopped)
        ));

        manager.reset().await;
        assert!(!manager.is_stopped());
        assert_eq!(manager.concurrency(), 12);
        assert_eq!(manager.stats(), AggregateStats::default());
    }
}
