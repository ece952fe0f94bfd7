//! Per-unit execution time accounting against soft per-tick budgets.
//!
//! Budgets never preempt running work; a task that is already executing may
//! exceed its budget arbitrarily. The budget only gates the next release
//! from the scheduler's ready queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use crate::metrics::MetricsRegistry;

const DEFAULT_TICK_BUDGET_MS: u64 = 45;
const DEFAULT_UNIT_BUDGET_MS: u64 = 10;

#[derive(Debug)]
struct UnitBudget {
    budget_nanos: u64,
    tick_consumed: AtomicU64,
    total_consumed: AtomicU64,
    over_budget_count: AtomicU64,
}

impl UnitBudget {
    fn new(budget_nanos: u64) -> Self {
        Self {
            budget_nanos,
            tick_consumed: AtomicU64::new(0),
            total_consumed: AtomicU64::new(0),
            over_budget_count: AtomicU64::new(0),
        }
    }

    fn add(&self, nanos: u64) {
        let before = self.tick_consumed.fetch_add(nanos, Ordering::Relaxed);
        self.total_consumed.fetch_add(nanos, Ordering::Relaxed);
        // Count the event only when this addition crosses the budget line.
        if before < self.budget_nanos && before + nanos >= self.budget_nanos {
            self.over_budget_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn within_budget(&self) -> bool {
        self.tick_consumed.load(Ordering::Relaxed) < self.budget_nanos
    }

    fn remaining(&self) -> u64 {
        self.budget_nanos
            .saturating_sub(self.tick_consumed.load(Ordering::Relaxed))
    }

    fn reset(&self) {
        self.tick_consumed.store(0, Ordering::Relaxed);
    }
}

/// Aggregate accounting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetStats {
    pub total_tick_overruns: u64,
    pub last_overrun_tick: i64,
    pub tick_budget_nanos: u64,
    pub tracked_units: usize,
}

/// Per-unit accounting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitBudgetStats {
    pub unit_id: String,
    pub budget_nanos: u64,
    pub tick_consumed_nanos: u64,
    pub total_consumed_nanos: u64,
    pub over_budget_count: u64,
}

/// RAII timing scope: records the elapsed time against a unit on drop.
pub struct TimingGuard<'a> {
    manager: &'a BudgetManager,
    unit_id: String,
    started: Instant,
}

impl TimingGuard<'_> {
    pub fn elapsed_nanos(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }
}

impl Drop for TimingGuard<'_> {
    fn drop(&mut self) {
        self.manager
            .record_execution(&self.unit_id, self.started.elapsed().as_nanos() as u64);
    }
}

/// Tracks nanoseconds consumed per registered unit per tick.
///
/// Units that never register charge only to metrics and are always
/// considered within budget; registration opts a unit into enforcement.
pub struct BudgetManager {
    metrics: Arc<MetricsRegistry>,
    budgets: RwLock<HashMap<String, Arc<UnitBudget>>>,
    tick_budget_nanos: AtomicU64,
    default_unit_budget_nanos: AtomicU64,
    total_tick_overruns: AtomicU64,
    last_overrun_tick: AtomicI64,
}

impl BudgetManager {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            metrics,
            budgets: RwLock::new(HashMap::new()),
            tick_budget_nanos: AtomicU64::new(DEFAULT_TICK_BUDGET_MS * 1_000_000),
            default_unit_budget_nanos: AtomicU64::new(DEFAULT_UNIT_BUDGET_MS * 1_000_000),
            total_tick_overruns: AtomicU64::new(0),
            last_overrun_tick: AtomicI64::new(-1),
        }
    }

    pub fn shutdown(&self) {
        self.budgets.write().clear();
    }

    pub fn tick_budget_nanos(&self) -> u64 {
        self.tick_budget_nanos.load(Ordering::Relaxed)
    }

    pub fn set_tick_budget_ms(&self, ms: u64) {
        self.tick_budget_nanos.store(ms * 1_000_000, Ordering::Relaxed);
    }

    pub fn set_default_unit_budget_ms(&self, ms: u64) {
        self.default_unit_budget_nanos
            .store(ms * 1_000_000, Ordering::Relaxed);
    }

    /// Register a unit with the default per-tick budget.
    pub fn register_unit(&self, unit_id: &str) {
        self.register_unit_with_budget(
            unit_id,
            self.default_unit_budget_nanos.load(Ordering::Relaxed),
        );
    }

    pub fn register_unit_with_budget(&self, unit_id: &str, budget_nanos: u64) {
        self.budgets
            .write()
            .insert(unit_id.to_string(), Arc::new(UnitBudget::new(budget_nanos)));
    }

    pub fn unregister_unit(&self, unit_id: &str) {
        self.budgets.write().remove(unit_id);
    }

    /// Begin a timing scope that records against `unit_id` when dropped.
    pub fn start_timing(&self, unit_id: &str) -> TimingGuard<'_> {
        TimingGuard {
            manager: self,
            unit_id: unit_id.to_string(),
            started: Instant::now(),
        }
    }

    /// Record execution time. Unregistered owners only reach metrics.
    pub fn record_execution(&self, unit_id: &str, nanos: u64) {
        if let Some(budget) = self.budgets.read().get(unit_id) {
            budget.add(nanos);
        }
        self.metrics.record_unit_execution(unit_id, nanos);
    }

    /// Whether the unit may still be released work this tick.
    pub fn within_budget(&self, unit_id: &str) -> bool {
        match self.budgets.read().get(unit_id) {
            Some(budget) => budget.within_budget(),
            None => true,
        }
    }

    /// Remaining budget this tick; unregistered units report the default.
    pub fn remaining(&self, unit_id: &str) -> u64 {
        match self.budgets.read().get(unit_id) {
            Some(budget) => budget.remaining(),
            None => self.default_unit_budget_nanos.load(Ordering::Relaxed),
        }
    }

    /// Reset all per-tick counters. Called at the start of every tick.
    pub fn reset_tick_counters(&self) {
        for budget in self.budgets.read().values() {
            budget.reset();
        }
    }

    /// Record a tick whose wall duration exceeded the tick period.
    pub fn report_tick_overrun(&self, tick: u64, actual_nanos: u64) {
        self.total_tick_overruns.fetch_add(1, Ordering::Relaxed);
        self.last_overrun_tick.store(tick as i64, Ordering::Relaxed);
        self.metrics.record_tick_overrun(tick, actual_nanos);
    }

    pub fn stats(&self) -> BudgetStats {
        BudgetStats {
            total_tick_overruns: self.total_tick_overruns.load(Ordering::Relaxed),
            last_overrun_tick: self.last_overrun_tick.load(Ordering::Relaxed),
            tick_budget_nanos: self.tick_budget_nanos.load(Ordering::Relaxed),
            tracked_units: self.budgets.read().len(),
        }
    }

    pub fn unit_stats(&self, unit_id: &str) -> Option<UnitBudgetStats> {
        self.budgets.read().get(unit_id).map(|b| UnitBudgetStats {
            unit_id: unit_id.to_string(),
            budget_nanos: b.budget_nanos,
            tick_consumed_nanos: b.tick_consumed.load(Ordering::Relaxed),
            total_consumed_nanos: b.total_consumed.load(Ordering::Relaxed),
            over_budget_count: b.over_budget_count.load(Ordering::Relaxed),
        })
    }
}
