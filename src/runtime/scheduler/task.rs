//! Task definitions for the scheduler.
//!
//! A task is a named closure. While queued it lives in a slot of the
//! scheduler's node arena; the ready stacks move only its handle.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use super::TaskContext;

/// Body of a task.
pub type TaskFn = Box<dyn FnOnce(&TaskContext<'_>) + Send + 'static>;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    /// Get the inner value.
    #[inline]
    pub fn inner(&self) -> usize {
        self.0
    }
}

impl From<usize> for TaskId {
    fn from(val: usize) -> Self {
        Self(val)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued on a ready stack.
    Ready,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Finished,
    /// The body panicked.
    Failed,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => TaskState::Running,
            2 => TaskState::Finished,
            3 => TaskState::Failed,
            _ => TaskState::Ready,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            TaskState::Ready => 0,
            TaskState::Running => 1,
            TaskState::Finished => 2,
            TaskState::Failed => 3,
        }
    }
}

/// A task that can be scheduled for execution.
pub struct Task {
    id: TaskId,
    name: String,
    state: AtomicU8,
    executor: Option<TaskFn>,
    exec_duration: Option<Duration>,
}

impl std::fmt::Debug for Task {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    /// Create a new task with the given ID and body.
    pub fn new<F>(
        id: TaskId,
        executor: F,
    ) -> Self
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        TaskBuilder::new().build(id, executor)
    }

    /// Create a task without a body (for testing).
    pub fn empty(id: TaskId) -> Self {
        Self {
            id,
            name: id.to_string(),
            state: AtomicU8::new(TaskState::Ready.as_u8()),
            executor: None,
            exec_duration: None,
        }
    }

    /// Get the task ID.
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Get the task name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state.
    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Set the task state.
    #[inline]
    pub fn set_state(
        &self,
        state: TaskState,
    ) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Check if the task is finished.
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Take the body out of the task.
    #[inline]
    pub fn take_executor(&mut self) -> Option<TaskFn> {
        self.executor.take()
    }

    /// Record the execution duration.
    #[inline]
    pub fn record_duration(
        &mut self,
        duration: Duration,
    ) {
        self.exec_duration = Some(duration);
    }

    /// Get the execution duration.
    #[inline]
    pub fn exec_duration(&self) -> Option<Duration> {
        self.exec_duration
    }
}

/// Task builder for constructing tasks with various options.
#[derive(Debug, Default)]
pub struct TaskBuilder {
    name: Option<String>,
}

impl TaskBuilder {
    /// Create a new task builder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the task name.
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Build the task with the given ID and body.
    pub fn build<F>(
        self,
        id: TaskId,
        executor: F,
    ) -> Task
    where
        F: FnOnce(&TaskContext<'_>) + Send + 'static,
    {
        Task {
            id,
            name: self.name.unwrap_or_else(|| id.to_string()),
            state: AtomicU8::new(TaskState::Ready.as_u8()),
            executor: Some(Box::new(executor)),
            exec_duration: None,
        }
    }
}

/// Source of task IDs, shareable across threads.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    next_id: AtomicUsize,
}

impl TaskIdGenerator {
    /// Create a new task ID generator.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate the next task ID.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}
