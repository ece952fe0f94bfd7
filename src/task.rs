//! Task types, priorities and handles for the tick scheduler.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::scheduler::TickScheduler;

/// Closure type for synchronous tick tasks. Periodic tasks are re-invoked,
/// so the closure must be callable more than once.
pub type TaskFn = Box<dyn FnMut() + Send + 'static>;

/// Closure type for one-shot work (deferred and async tasks).
pub type OnceTaskFn = Box<dyn FnOnce() + Send + 'static>;

/// Priority levels for scheduled tasks. Higher priorities run first within
/// a tick; Critical tasks are never deferred by budget pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskPriority {
    /// May be deferred to future ticks under load.
    Low,
    /// Standard task execution.
    Normal,
    /// Preferred over normal tasks.
    High,
    /// Always executed, never deferred. Use sparingly.
    Critical,
}

/// A task queued on the ready heap.
pub(crate) struct ScheduledTask {
    pub id: u64,
    pub owner: String,
    pub work: TaskFn,
    pub execute_tick: u64,
    /// Period in ticks; 0 means one-shot.
    pub period: u64,
    pub priority: TaskPriority,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    /// Heap order: earliest execute-tick first, then highest priority, then
    /// insertion order (task ids are monotonic). `BinaryHeap` is a max-heap,
    /// so "greater" means "pops sooner".
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .execute_tick
            .cmp(&self.execute_tick)
            .then(self.priority.cmp(&other.priority))
            .then(other.id.cmp(&self.id))
    }
}

/// A task with no scheduled tick, drained with leftover budget at tick end.
pub(crate) struct DeferredTask {
    pub owner: String,
    pub work: OnceTaskFn,
    pub priority: TaskPriority,
}

/// Handle to a scheduled task. Cancellation is best-effort: it prevents
/// executions that have not yet been released, and suppresses future
/// periodic executions, but cannot stop an instance already running.
pub struct TaskHandle {
    id: u64,
    scheduler: Weak<TickScheduler>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64, scheduler: Weak<TickScheduler>) -> Self {
        Self { id, scheduler }
    }

    /// Handle whose `cancel` is a no-op, returned for rejected submissions.
    pub(crate) fn inert() -> Self {
        Self {
            id: 0,
            scheduler: Weak::new(),
        }
    }

    pub fn task_id(&self) -> u64 {
        self.id
    }

    /// Cancel the task. Returns true if the task was still live.
    pub fn cancel(&self) -> bool {
        match self.scheduler.upgrade() {
            Some(scheduler) => scheduler.cancel_task(self.id),
            None => false,
        }
    }
}

/// Result handle for an async task submitted with a return value.
///
/// Await it inside an async context, or call [`AsyncCall::join`] to block.
pub struct AsyncCall<T> {
    pub(crate) handle: TaskHandle,
    pub(crate) rx: oneshot::Receiver<T>,
}

impl<T> AsyncCall<T> {
    pub fn handle(&self) -> &TaskHandle {
        &self.handle
    }

    pub fn task_id(&self) -> u64 {
        self.handle.task_id()
    }

    /// Block until the task completes. Errors if the task panicked or the
    /// scheduler dropped the work before producing a result.
    pub fn join(self) -> Result<T, CoreError> {
        self.rx
            .blocking_recv()
            .map_err(|_| CoreError::Internal("async task completed without a result".to_string()))
    }
}

impl<T> Future for AsyncCall<T> {
    type Output = Result<T, CoreError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|result| {
            result.map_err(|_| {
                CoreError::Internal("async task completed without a result".to_string())
            })
        })
    }
}
