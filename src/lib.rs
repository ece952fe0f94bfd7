//! Vanadium: a modular game-server runtime core.
//!
//! Vanadium is the execution substrate under a game server: it discovers,
//! loads, enables, reloads and unloads binary plug-in units at runtime
//! under a dependency-resolved order, runs their periodic work inside a
//! fixed-rate tick loop governed by per-unit time budgets, and exposes a
//! typed configuration store with file-watch hot reload plus a metrics
//! registry feeding the deferral decisions.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`] — counters, gauges, histograms and timers, a
//!   rolling ring of tick durations, and a bounded overrun log.
//! - [`BudgetManager`] — per-unit per-tick time accounting with a global
//!   tick budget; soft enforcement signalled back to the scheduler.
//! - [`ConfigStore`] — typed configs persisted as `.properties` files,
//!   validated on load, hot-reloaded when edited on disk.
//! - [`TickScheduler`] — the 20 Hz tick loop with priority ordering,
//!   budget-based deferral, a deferred queue drained with leftover budget,
//!   and an async pool for off-tick work.
//! - [`UnitManager`] — manifest parsing, topological load order, isolated
//!   code loading and the unit lifecycle state machine.
//! - [`Runtime`] — the lifecycle orchestrator tying the above together
//!   with rollback on failed start.
//!
//! # Quick start
//!
//! ```no_run
//! use vanadium::Runtime;
//!
//! fn main() -> vanadium::Result<()> {
//!     let runtime = Runtime::new("./data")?;
//!     let _log_guard = vanadium::init_logging(runtime.data_dir(), "info")?;
//!     runtime.start()?;
//!     // ... embedder main loop, signal handling ...
//!     runtime.stop();
//!     Ok(())
//! }
//! ```
//!
//! Units are dynamic libraries placed in `<data_dir>/modules/` that export
//! their manifest and constructor via [`declare_unit!`].

pub mod budget;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod properties;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod units;

pub use budget::{BudgetManager, BudgetStats, TimingGuard, UnitBudgetStats};
pub use config::{ConfigData, ConfigStore, CoreConfig, ValidationErrors};
pub use error::{BoxedError, CoreError, Result};
pub use lifecycle::{LifecycleListener, LifecyclePhase, LifecycleTracker};
pub use logging::{init_logging, LogGuard, UnitLogger};
pub use metrics::{
    Counter, Gauge, Histogram, HistogramStats, JsonFileExporter, LogExporter, MemorySnapshot,
    MetricsExporter, MetricsRegistry, MetricsSnapshot, OverrunRecord, TickStats, Timer, TimerStats,
};
pub use properties::Properties;
pub use runtime::Runtime;
pub use scheduler::{TickScheduler, TICK_PERIOD};
pub use task::{AsyncCall, TaskHandle, TaskPriority};
pub use units::{
    is_valid_unit_id, resolve_load_order, Unit, UnitContext, UnitDescriptor, UnitInfo,
    UnitManager, UnitState, DEFAULT_ENTRY_SYMBOL, PACKAGE_EXTENSIONS,
};

/// Crate version, for embedders that report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
