//! Fixed-rate tick scheduler with budget-aware deferral and an async pool.
//!
//! One dedicated thread owns the tick loop: it is the only thread that pops
//! the ready heap and executes synchronous task closures, so at most one
//! tick is ever in flight. Async tasks run on a work-stealing tokio runtime
//! and do not consume tick budget. Task closures are isolated with
//! `catch_unwind`; a task fault never kills the tick thread.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetManager;
use crate::error::{panic_message, CoreError, Result};
use crate::lifecycle::{LifecyclePhase, LifecycleTracker};
use crate::metrics::MetricsRegistry;
use crate::task::{AsyncCall, DeferredTask, ScheduledTask, TaskFn, TaskHandle, TaskPriority};

/// Tick period: 50 ms, i.e. 20 ticks per second.
pub const TICK_PERIOD: Duration = Duration::from_millis(50);

/// Deferred work may use at most this fraction of the global tick budget.
const DEFERRED_BUDGET_DIVISOR: u64 = 4;

/// Timeout for joining the async pool during shutdown.
const POOL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tick-driven task scheduler.
///
/// Submissions are accepted from any thread; execution of synchronous tasks
/// happens exclusively on the tick thread in (execute-tick, priority,
/// insertion) order. When the elapsed time in a tick exceeds the global
/// budget, or a task's owner is over its per-unit budget, non-Critical
/// tasks are pushed to the next tick instead of released.
pub struct TickScheduler {
    budget: Arc<BudgetManager>,
    metrics: Arc<MetricsRegistry>,
    lifecycle: Arc<LifecycleTracker>,
    tick_period: Duration,

    current_tick: AtomicU64,
    next_task_id: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
    tick_in_flight: AtomicBool,

    /// Live task ids mapped to their owner. Absence means cancelled.
    live: Mutex<HashMap<u64, String>>,
    ready: Mutex<BinaryHeap<ScheduledTask>>,
    deferred: Mutex<VecDeque<DeferredTask>>,

    tick_thread: Mutex<Option<JoinHandle<()>>>,
    tick_thread_id: Mutex<Option<ThreadId>>,
    pool: Mutex<Option<tokio::runtime::Runtime>>,

    self_weak: Weak<TickScheduler>,
}

impl TickScheduler {
    pub fn new(
        budget: Arc<BudgetManager>,
        metrics: Arc<MetricsRegistry>,
        lifecycle: Arc<LifecycleTracker>,
    ) -> Arc<Self> {
        Self::with_tick_period(budget, metrics, lifecycle, TICK_PERIOD)
    }

    pub fn with_tick_period(
        budget: Arc<BudgetManager>,
        metrics: Arc<MetricsRegistry>,
        lifecycle: Arc<LifecycleTracker>,
        tick_period: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            budget,
            metrics,
            lifecycle,
            tick_period,
            current_tick: AtomicU64::new(0),
            next_task_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tick_in_flight: AtomicBool::new(false),
            live: Mutex::new(HashMap::new()),
            ready: Mutex::new(BinaryHeap::new()),
            deferred: Mutex::new(VecDeque::new()),
            tick_thread: Mutex::new(None),
            tick_thread_id: Mutex::new(None),
            pool: Mutex::new(None),
            self_weak: self_weak.clone(),
        })
    }

    /// Start the tick thread and the async pool. Idempotent while running;
    /// restarting a stopped scheduler is not supported.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let pool = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().max(2))
            .thread_name("vanadium-async")
            .build()
            .map_err(|e| CoreError::Internal(format!("failed to build async pool: {e}")))?;
        *self.pool.lock() = Some(pool);

        let scheduler = self
            .self_weak
            .upgrade()
            .ok_or_else(|| CoreError::Internal("scheduler handle dropped".to_string()))?;
        let handle = std::thread::Builder::new()
            .name("vanadium-tick".to_string())
            .spawn(move || scheduler.tick_loop())?;
        *self.tick_thread.lock() = Some(handle);

        info!(period_ms = self.tick_period.as_millis() as u64, "scheduler started");
        Ok(())
    }

    /// Stop the tick thread, shut the async pool down with a bounded wait,
    /// and drop all queued tasks.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let was_running = self.running.swap(false, Ordering::SeqCst);

        if let Some(handle) = self.tick_thread.lock().take() {
            // A task calling stop() runs on the tick thread itself; joining
            // there would deadlock. The loop exits on its own next wake.
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown_timeout(POOL_SHUTDOWN_TIMEOUT);
        }

        self.live.lock().clear();
        self.ready.lock().clear();
        self.deferred.lock().clear();

        if was_running {
            info!("scheduler stopped");
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick.load(Ordering::SeqCst)
    }

    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    /// Whether the calling thread is the tick thread. Callers use this to
    /// decide when to bounce work onto the tick thread.
    pub fn is_tick_thread(&self) -> bool {
        *self.tick_thread_id.lock() == Some(std::thread::current().id())
    }

    /// Schedule a task for the next tick.
    pub fn run_task(&self, owner: &str, work: impl FnMut() + Send + 'static) -> TaskHandle {
        self.run_task_later(owner, work, 0)
    }

    /// Schedule a one-shot task after `delay_ticks`. Negative delays clamp
    /// to zero.
    pub fn run_task_later(
        &self,
        owner: &str,
        work: impl FnMut() + Send + 'static,
        delay_ticks: i64,
    ) -> TaskHandle {
        self.submit(owner, Box::new(work), delay_ticks, 0, TaskPriority::Normal)
    }

    /// Schedule a repeating task. Periods below one tick clamp to one.
    pub fn run_task_timer(
        &self,
        owner: &str,
        work: impl FnMut() + Send + 'static,
        delay_ticks: i64,
        period_ticks: i64,
    ) -> TaskHandle {
        self.submit(
            owner,
            Box::new(work),
            delay_ticks,
            period_ticks.max(1) as u64,
            TaskPriority::Normal,
        )
    }

    /// Full-control submission. `period_ticks <= 0` means one-shot.
    pub fn run_task_prioritized(
        &self,
        owner: &str,
        work: impl FnMut() + Send + 'static,
        delay_ticks: i64,
        period_ticks: i64,
        priority: TaskPriority,
    ) -> TaskHandle {
        self.submit(
            owner,
            Box::new(work),
            delay_ticks,
            period_ticks.max(0) as u64,
            priority,
        )
    }

    fn submit(
        &self,
        owner: &str,
        work: TaskFn,
        delay_ticks: i64,
        period: u64,
        priority: TaskPriority,
    ) -> TaskHandle {
        if self.stopped.load(Ordering::SeqCst) {
            return TaskHandle::inert();
        }
        let delay = delay_ticks.max(0) as u64;
        let mut execute_tick = self.current_tick.load(Ordering::SeqCst) + delay;
        // A zero-delay submission while a tick is draining has missed that
        // tick's cut; it belongs to the next one.
        if delay == 0 && self.tick_in_flight.load(Ordering::SeqCst) {
            execute_tick += 1;
        }

        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().insert(id, owner.to_string());
        self.ready.lock().push(ScheduledTask {
            id,
            owner: owner.to_string(),
            work,
            execute_tick,
            period,
            priority,
        });
        TaskHandle::new(id, self.self_weak.clone())
    }

    /// Run a fire-and-forget task on the async pool. Execution time is
    /// recorded to metrics but does not consume tick budget.
    pub fn run_async(&self, owner: &str, work: impl FnOnce() + Send + 'static) -> TaskHandle {
        if self.stopped.load(Ordering::SeqCst) {
            return TaskHandle::inert();
        }
        let Some(scheduler) = self.self_weak.upgrade() else {
            return TaskHandle::inert();
        };

        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().insert(id, owner.to_string());

        let pool = self.pool.lock();
        let Some(runtime) = pool.as_ref() else {
            self.live.lock().remove(&id);
            return TaskHandle::inert();
        };
        let owner = owner.to_string();
        runtime.spawn(async move {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(work));
            let duration = started.elapsed().as_nanos() as u64;
            scheduler.metrics.record_task_execution(&owner, duration);
            if let Err(payload) = outcome {
                scheduler.metrics.counter("scheduler.task.errors").increment();
                warn!(owner = %owner, panic = %panic_message(payload), "async task panicked");
            }
            scheduler.live.lock().remove(&id);
        });
        drop(pool);

        TaskHandle::new(id, self.self_weak.clone())
    }

    /// Run an async task that produces a value, exposed via [`AsyncCall`].
    pub fn run_async_call<T, F>(&self, owner: &str, work: F) -> AsyncCall<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if self.stopped.load(Ordering::SeqCst) {
            return AsyncCall {
                handle: TaskHandle::inert(),
                rx,
            };
        }
        let Some(scheduler) = self.self_weak.upgrade() else {
            return AsyncCall {
                handle: TaskHandle::inert(),
                rx,
            };
        };

        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().insert(id, owner.to_string());

        let pool = self.pool.lock();
        let Some(runtime) = pool.as_ref() else {
            self.live.lock().remove(&id);
            return AsyncCall {
                handle: TaskHandle::inert(),
                rx,
            };
        };
        let owner = owner.to_string();
        runtime.spawn(async move {
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(work));
            let duration = started.elapsed().as_nanos() as u64;
            scheduler.metrics.record_task_execution(&owner, duration);
            match outcome {
                Ok(value) => {
                    let _ = tx.send(value);
                }
                Err(payload) => {
                    scheduler.metrics.counter("scheduler.task.errors").increment();
                    warn!(owner = %owner, panic = %panic_message(payload), "async task panicked");
                }
            }
            scheduler.live.lock().remove(&id);
        });
        drop(pool);

        AsyncCall {
            handle: TaskHandle::new(id, self.self_weak.clone()),
            rx,
        }
    }

    /// Queue work with no scheduled tick; it runs when a tick finishes with
    /// budget to spare.
    pub fn defer(&self, owner: &str, work: impl FnOnce() + Send + 'static, priority: TaskPriority) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.deferred.lock().push_back(DeferredTask {
            owner: owner.to_string(),
            work: Box::new(work),
            priority,
        });
    }

    /// Cancel a task by id. Returns true if the task was still live; the
    /// ready-drain skips entries whose id is gone, so cancellation works
    /// even for tasks already queued on the heap.
    pub fn cancel_task(&self, task_id: u64) -> bool {
        self.live.lock().remove(&task_id).is_some()
    }

    /// Cancel every task belonging to `owner` and purge its queued closures
    /// from the heap and the deferred queue. The purge matters for unit
    /// unload: the closures must be dropped before the owning code scope.
    pub fn cancel_owned(&self, owner: &str) -> usize {
        let cancelled = {
            let mut live = self.live.lock();
            let before = live.len();
            live.retain(|_, task_owner| task_owner != owner);
            before - live.len()
        };

        {
            let mut ready = self.ready.lock();
            let retained: BinaryHeap<ScheduledTask> =
                ready.drain().filter(|task| task.owner != owner).collect();
            *ready = retained;
        }
        self.deferred.lock().retain(|task| task.owner != owner);

        if cancelled > 0 {
            debug!(owner, cancelled, "cancelled owned tasks");
        }
        cancelled
    }

    fn tick_loop(self: Arc<Self>) {
        *self.tick_thread_id.lock() = Some(std::thread::current().id());
        let period = self.tick_period;
        let mut next_tick = Instant::now() + period;

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if catch_unwind(AssertUnwindSafe(|| self.run_tick())).is_err() {
                // Internal scheduler fault, not a task fault: stop the loop
                // and flip the lifecycle so the embedder can tear down.
                error!("tick function fault; stopping scheduler");
                self.lifecycle.transition(LifecyclePhase::Stopping);
                self.running.store(false, Ordering::SeqCst);
                break;
            }

            next_tick += period;
            let after = Instant::now();
            if next_tick < after {
                // Overrun absorbed: re-anchor rather than bursting
                // catch-up ticks.
                next_tick = after + period;
            }
        }
    }

    /// One tick: drain ready tasks under the global budget, then drain the
    /// deferred queue with the leftover. Called only from the tick thread
    /// (tests drive it directly for determinism).
    pub(crate) fn run_tick(&self) {
        let tick = self.current_tick.fetch_add(1, Ordering::SeqCst) + 1;
        let tick_start = Instant::now();
        let budget_nanos = self.budget.tick_budget_nanos();
        self.budget.reset_tick_counters();
        self.tick_in_flight.store(true, Ordering::SeqCst);

        let mut processed: u64 = 0;
        let mut pushed_to_next: u64 = 0;

        loop {
            let mut task = {
                let mut ready = self.ready.lock();
                let due = matches!(ready.peek(), Some(top) if top.execute_tick <= tick);
                if !due {
                    break;
                }
                let Some(task) = ready.pop() else { break };
                task
            };

            // Cancelled while queued: drop the closure and move on.
            if !self.live.lock().contains_key(&task.id) {
                continue;
            }

            let elapsed = tick_start.elapsed().as_nanos() as u64;
            let over_global = elapsed > budget_nanos;
            let over_unit = !self.budget.within_budget(&task.owner);
            if (over_global || over_unit) && task.priority != TaskPriority::Critical {
                task.execute_tick = tick + 1;
                self.ready.lock().push(task);
                pushed_to_next += 1;
                continue;
            }

            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| (task.work)()));
            let duration = started.elapsed().as_nanos() as u64;
            self.metrics.record_task_execution(&task.owner, duration);
            self.budget.record_execution(&task.owner, duration);

            match outcome {
                Ok(()) => processed += 1,
                Err(payload) => {
                    self.metrics.counter("scheduler.task.errors").increment();
                    warn!(
                        owner = %task.owner,
                        task = task.id,
                        panic = %panic_message(payload),
                        "task panicked"
                    );
                }
            }

            if task.period > 0 && self.live.lock().contains_key(&task.id) {
                task.execute_tick = tick + task.period;
                self.ready.lock().push(task);
            } else {
                self.live.lock().remove(&task.id);
            }
        }

        let consumed = tick_start.elapsed().as_nanos() as u64;
        if consumed < budget_nanos {
            let leftover = budget_nanos - consumed;
            self.drain_deferred(leftover.min(budget_nanos / DEFERRED_BUDGET_DIVISOR));
        }

        self.tick_in_flight.store(false, Ordering::SeqCst);
        let tick_duration = tick_start.elapsed().as_nanos() as u64;
        self.metrics.record_tick_duration(tick_duration);
        self.metrics.counter("scheduler.tasks.processed").add(processed);
        self.metrics.counter("scheduler.tasks.deferred").add(pushed_to_next);

        if tick_duration > self.tick_period.as_nanos() as u64 {
            self.budget.report_tick_overrun(tick, tick_duration);
        }
    }

    fn drain_deferred(&self, allow_nanos: u64) {
        let start = Instant::now();
        loop {
            if start.elapsed().as_nanos() as u64 > allow_nanos {
                break;
            }
            let Some(task) = self.deferred.lock().pop_front() else {
                break;
            };

            let work = task.work;
            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(move || work()));
            let duration = started.elapsed().as_nanos() as u64;
            self.metrics.record_task_execution(&task.owner, duration);
            self.budget.record_execution(&task.owner, duration);
            if let Err(payload) = outcome {
                self.metrics.counter("scheduler.task.errors").increment();
                warn!(
                    owner = %task.owner,
                    priority = ?task.priority,
                    panic = %panic_message(payload),
                    "deferred task panicked"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        // The tick thread holds a strong reference, so by the time drop
        // runs the thread has already exited; this only releases the pool.
        if let Some(pool) = self.pool.lock().take() {
            pool.shutdown_timeout(POOL_SHUTDOWN_TIMEOUT);
        }
    }
}
