//! Task scheduler for concurrent execution
//!
//! A fixed pool of worker threads, one ready stack per worker. Tasks sit in
//! a shared [`NodeArena`]; stacks move handles only. A worker pops its own
//! stack first, then steals from peers, then parks for `idle_timeout`.
//!
//! A task body receives a [`TaskContext`] through which it can reach the
//! device registry and push successor tasks onto its own worker's stack as
//! one chain.

pub mod task;
pub mod work_stealer;

pub use task::{Task, TaskBuilder, TaskFn, TaskId, TaskIdGenerator, TaskState};
pub use work_stealer::{StealSnapshot, StealStats, StealStrategy, WorkStealer};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::runtime::context::RuntimeContext;
use crate::runtime::device::DeviceRegistry;
use crate::runtime::lifo::{AnyLifo, Lifo, LifoKind, NodeArena, NodeHandle};
use crate::runtime::memory::AllocError;
use crate::util::config::RuntimeConfig;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Victims probed per steal round.
    #[serde(default = "default_steal_attempts")]
    pub steal_attempts: usize,
    /// Whether idle workers steal from peers.
    #[serde(default = "default_true")]
    pub use_work_stealing: bool,
    #[serde(default)]
    pub steal_strategy: StealStrategy,
    /// How long an idle worker parks before looking again.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Ready stack implementation.
    #[serde(default)]
    pub lifo: LifoKind,
}

fn default_num_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_steal_attempts() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout_ms() -> u64 {
    1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            steal_attempts: default_steal_attempts(),
            use_work_stealing: true,
            steal_strategy: StealStrategy::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            lifo: LifoKind::default(),
        }
    }
}

impl SchedulerConfig {
    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        source: std::io::Error,
    },
    #[error("worker {worker} does not exist ({workers} workers)")]
    UnknownWorker { worker: usize, workers: usize },
    #[error("scheduler is shut down")]
    ShutDown,
    #[error("scheduler needs at least one worker")]
    NoWorkers,
}

/// Scheduler statistics.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total tasks scheduled.
    pub tasks_scheduled: AtomicUsize,
    /// Total tasks completed.
    pub tasks_completed: AtomicUsize,
    /// Tasks whose body panicked.
    pub tasks_failed: AtomicUsize,
    /// Tasks run by a worker other than the one they were pushed to.
    pub tasks_stolen: AtomicUsize,
    /// Chains pushed through `spawn_chain` or `spawn_successors`.
    pub chains_pushed: AtomicUsize,
    /// Total execution time in microseconds.
    pub total_exec_time_us: AtomicUsize,
    /// Peak number of running tasks.
    pub peak_parallelism: AtomicUsize,
    running: AtomicUsize,
}

impl SchedulerStats {
    /// Record `count` scheduled tasks.
    #[inline]
    pub fn record_scheduled(
        &self,
        count: usize,
    ) {
        self.tasks_scheduled.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a completed task.
    #[inline]
    pub fn record_completed(
        &self,
        duration_us: usize,
    ) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.total_exec_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stolen task.
    #[inline]
    pub fn record_steal(&self) {
        self.tasks_stolen.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_chain(&self) {
        self.chains_pushed.fetch_add(1, Ordering::Relaxed);
    }

    fn enter(&self) {
        let current = self.running.fetch_add(1, Ordering::Relaxed) + 1;
        self.update_parallelism(current);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    /// Update parallelism.
    #[inline]
    pub fn update_parallelism(
        &self,
        current: usize,
    ) {
        self.peak_parallelism.fetch_max(current, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_stolen: self.tasks_stolen.load(Ordering::Relaxed),
            chains_pushed: self.chains_pushed.load(Ordering::Relaxed),
            total_exec_time_us: self.total_exec_time_us.load(Ordering::Relaxed),
            peak_parallelism: self.peak_parallelism.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SchedulerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tasks_scheduled: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_stolen: usize,
    pub chains_pushed: usize,
    pub total_exec_time_us: usize,
    pub peak_parallelism: usize,
}

/// What a running task can see of the scheduler.
pub struct TaskContext<'a> {
    worker: usize,
    task: TaskId,
    shared: &'a Shared,
}

impl TaskContext<'_> {
    /// Index of the worker running this task.
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker
    }

    #[inline]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    #[inline]
    pub fn runtime(&self) -> &RuntimeContext {
        &self.shared.context
    }

    #[inline]
    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        self.shared.context.devices()
    }

    /// A fresh task ID from the scheduler's generator.
    #[inline]
    pub fn next_id(&self) -> TaskId {
        self.shared.ids.next()
    }

    /// Push `tasks` onto this worker's stack as one chain. The first task
    /// of the iterator is the first to run.
    pub fn spawn_successors(
        &self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Result<usize, SchedulerError> {
        self.shared.push_chain(self.worker, tasks)
    }
}

impl std::fmt::Debug for TaskContext<'_> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker", &self.worker)
            .field("task", &self.task)
            .finish()
    }
}

/// State shared by the scheduler handle and its workers.
struct Shared {
    context: Arc<RuntimeContext>,
    config: SchedulerConfig,
    arena: Arc<NodeArena<Task>>,
    stacks: Vec<AnyLifo<Task>>,
    stealer: WorkStealer,
    stats: SchedulerStats,
    ids: TaskIdGenerator,
    running: AtomicBool,
    next_worker: AtomicUsize,
    /// Submitted and not yet finished.
    pending: AtomicUsize,
    sleepers: AtomicUsize,
    wake_lock: Mutex<()>,
    wake: Condvar,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl Shared {
    fn check_worker(
        &self,
        worker: usize,
    ) -> Result<(), SchedulerError> {
        if worker >= self.stacks.len() {
            return Err(SchedulerError::UnknownWorker {
                worker,
                workers: self.stacks.len(),
            });
        }
        Ok(())
    }

    fn push_one(
        &self,
        worker: usize,
        task: Task,
    ) -> Result<TaskId, SchedulerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let id = task.id();
        let handle = self.arena.alloc(task)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.stats.record_scheduled(1);
        trace!(%id, worker, "task pushed");
        self.stacks[worker].push(handle);
        self.notify_one();
        Ok(id)
    }

    fn push_chain(
        &self,
        worker: usize,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Result<usize, SchedulerError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let mut chain = self.arena.chain();
        for task in tasks {
            // On failure the chain frees what it already holds.
            chain.append(self.arena.alloc(task)?);
        }
        let len = chain.len();
        if len == 0 {
            return Ok(0);
        }
        self.pending.fetch_add(len, Ordering::AcqRel);
        self.stats.record_scheduled(len);
        self.stats.record_chain();
        debug!(worker, len, "chain pushed");
        self.stacks[worker].push_chain(chain);
        if len > 1 {
            self.notify_all();
        } else {
            self.notify_one();
        }
        Ok(len)
    }

    fn notify_one(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.wake_lock.lock();
            self.wake.notify_one();
        }
    }

    fn notify_all(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.wake_lock.lock();
            self.wake.notify_all();
        }
    }

    fn has_work(&self) -> bool {
        self.stacks.iter().any(|stack| !stack.is_empty())
    }

    fn park(&self) {
        let mut guard = self.wake_lock.lock();
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        if self.running.load(Ordering::Acquire) && !self.has_work() {
            self.wake.wait_for(&mut guard, self.config.idle_timeout());
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn find_work(
        &self,
        worker: usize,
    ) -> Option<NodeHandle> {
        if let Some(handle) = self.stacks[worker].pop() {
            return Some(handle);
        }
        if self.config.use_work_stealing {
            if let Some(handle) = self.stealer.steal::<Task, _>(worker, &self.stacks) {
                self.stats.record_steal();
                return Some(handle);
            }
        }
        None
    }

    /// Run the task behind `handle` and release its slot.
    fn run(
        &self,
        worker: usize,
        mut handle: NodeHandle,
    ) {
        let task = self.arena.get_mut(&mut handle);
        task.set_state(TaskState::Running);
        let id = task.id();
        let executor = task.take_executor();

        let context = TaskContext {
            worker,
            task: id,
            shared: self,
        };

        self.stats.enter();
        let start = Instant::now();
        let outcome = match executor {
            Some(body) => panic::catch_unwind(AssertUnwindSafe(|| body(&context))),
            None => Ok(()),
        };
        let elapsed = start.elapsed();
        self.stats.leave();

        let task = self.arena.get_mut(&mut handle);
        task.record_duration(elapsed);
        match outcome {
            Ok(()) => {
                task.set_state(TaskState::Finished);
                self.stats.record_completed(elapsed.as_micros() as usize);
            }
            Err(_) => {
                task.set_state(TaskState::Failed);
                self.stats.record_failed();
                error!(%id, name = task.name(), worker, "task panicked");
            }
        }

        drop(self.arena.free(handle));
        self.finish_one();
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle.notify_all();
        }
    }

    fn worker_loop(
        &self,
        worker: usize,
    ) {
        debug!(worker, "worker started");
        while self.running.load(Ordering::Acquire) {
            match self.find_work(worker) {
                Some(handle) => self.run(worker, handle),
                None => self.park(),
            }
        }
        debug!(worker, "worker stopped");
    }
}

/// Work-stealing scheduler over per-worker LIFO ready stacks.
pub struct Scheduler {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler with default settings.
    pub fn new(context: Arc<RuntimeContext>) -> Result<Self, SchedulerError> {
        Self::with_config(context, &RuntimeConfig::default())
    }

    /// Create a scheduler from the `scheduler` and `arena` sections.
    pub fn with_config(
        context: Arc<RuntimeContext>,
        config: &RuntimeConfig,
    ) -> Result<Self, SchedulerError> {
        Self::build(context, config.scheduler.clone(), config.arena.capacity)
    }

    /// Create a scheduler whose arena holds `capacity` slots, one ghost per
    /// worker included.
    pub fn build(
        context: Arc<RuntimeContext>,
        config: SchedulerConfig,
        capacity: usize,
    ) -> Result<Self, SchedulerError> {
        let num_workers = config.num_workers;
        if num_workers == 0 {
            return Err(SchedulerError::NoWorkers);
        }

        let arena = Arc::new(NodeArena::with_capacity(capacity)?);
        let stacks = (0..num_workers)
            .map(|_| AnyLifo::new(config.lifo, arena.clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let shared = Arc::new(Shared {
            context,
            stealer: WorkStealer::new(config.steal_strategy, config.steal_attempts),
            config,
            arena,
            stacks,
            stats: SchedulerStats::default(),
            ids: TaskIdGenerator::new(),
            running: AtomicBool::new(true),
            next_worker: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            sleepers: AtomicUsize::new(0),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        });

        let mut scheduler = Self {
            shared,
            workers: Vec::with_capacity(num_workers),
        };
        for worker in 0..num_workers {
            let shared = scheduler.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("tessera-worker-{}", worker))
                .spawn(move || shared.worker_loop(worker));
            match spawned {
                Ok(handle) => scheduler.workers.push(handle),
                Err(source) => {
                    scheduler.shutdown();
                    return Err(SchedulerError::Spawn { worker, source });
                }
            }
        }

        info!(
            workers = num_workers,
            lifo = %scheduler.shared.config.lifo,
            capacity,
            "scheduler started"
        );
        Ok(scheduler)
    }

    /// A fresh task ID.
    #[inline]
    pub fn next_id(&self) -> TaskId {
        self.shared.ids.next()
    }

    /// Build a task with a fresh ID.
    pub fn task<F>(
        &self,
        name: impl Into<String>,
        body: F,
    ) -> Task
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        TaskBuilder::new().name(name).build(self.next_id(), body)
    }

    /// Submit a task, round-robin over worker stacks.
    pub fn spawn(
        &self,
        task: Task,
    ) -> Result<TaskId, SchedulerError> {
        let worker = self.pick_worker();
        self.shared.push_one(worker, task)
    }

    /// Submit a task to a specific worker's stack.
    pub fn spawn_on(
        &self,
        worker: usize,
        task: Task,
    ) -> Result<TaskId, SchedulerError> {
        self.shared.check_worker(worker)?;
        self.shared.push_one(worker, task)
    }

    /// Submit tasks as one chain on a single stack; they pop in iteration
    /// order. Returns how many were pushed.
    pub fn spawn_chain(
        &self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Result<usize, SchedulerError> {
        let worker = self.pick_worker();
        self.shared.push_chain(worker, tasks)
    }

    fn pick_worker(&self) -> usize {
        self.shared.next_worker.fetch_add(1, Ordering::Relaxed) % self.shared.stacks.len()
    }

    /// Block until every submitted task has finished, or the scheduler
    /// stopped.
    pub fn wait_idle(&self) {
        let mut guard = self.shared.idle_lock.lock();
        while self.shared.pending.load(Ordering::Acquire) > 0 {
            if !self.is_running() {
                warn!(
                    pending = self.pending(),
                    "waiting on a stopped scheduler"
                );
                return;
            }
            self.shared.idle.wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    /// Like [`Scheduler::wait_idle`] with an upper bound. Returns whether
    /// the scheduler went idle.
    pub fn wait_idle_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.idle_lock.lock();
        while self.shared.pending.load(Ordering::Acquire) > 0 {
            if self.shared.idle.wait_until(&mut guard, deadline).timed_out() {
                return self.shared.pending.load(Ordering::Acquire) == 0;
            }
        }
        true
    }

    /// Tasks submitted and not yet finished.
    #[inline]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stats(&self) -> &SchedulerStats {
        &self.shared.stats
    }

    #[inline]
    pub fn steal_stats(&self) -> &StealStats {
        self.shared.stealer.stats()
    }

    #[inline]
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    #[inline]
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.shared.context
    }

    /// Get number of workers.
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.shared.stacks.len()
    }

    /// Check if the scheduler is running.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop the workers and join them. Tasks still queued are dropped
    /// without running.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        {
            let _guard = self.shared.wake_lock.lock();
            self.shared.wake.notify_all();
        }
        {
            let _guard = self.shared.idle_lock.lock();
            self.shared.idle.notify_all();
        }

        for (worker, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                error!(worker, "worker thread panicked");
            }
        }

        let pending = self.pending();
        if pending > 0 {
            warn!(pending, "scheduler stopped with queued tasks");
        }
        debug!(stats = ?self.shared.stats.snapshot(), "scheduler stopped");
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.num_workers())
            .field("lifo", &self.shared.config.lifo)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.is_running() || !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
