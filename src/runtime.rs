//! Runtime orchestrator: brings the subsystems up, runs them, tears them
//! down in reverse, and rolls back on a failed start.
//!
//! The embedder creates one `Runtime` handle and retains it; there is no
//! process-wide singleton. Start order is metrics, budgets, config,
//! scheduler, then unit discovery; stop reverses it after unloading every
//! unit in reverse load order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::budget::BudgetManager;
use crate::config::{ConfigStore, CoreConfig};
use crate::error::Result;
use crate::lifecycle::{LifecyclePhase, LifecycleTracker};
use crate::metrics::{LogExporter, MetricsRegistry};
use crate::scheduler::{TickScheduler, TICK_PERIOD};
use crate::task::TaskHandle;
use crate::units::UnitManager;

/// The runtime core. One instance per embedder; not restartable after
/// `stop` — create a fresh instance instead.
pub struct Runtime {
    data_dir: PathBuf,
    instance_id: Uuid,

    lifecycle: Arc<LifecycleTracker>,
    metrics: Arc<MetricsRegistry>,
    budget: Arc<BudgetManager>,
    config: Arc<ConfigStore>,
    scheduler: Arc<TickScheduler>,
    units: Arc<UnitManager>,

    running: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    export_task: Mutex<Option<TaskHandle>>,
}

impl Runtime {
    /// Build a runtime rooted at `data_dir` with the standard 50 ms tick.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        Self::with_tick_period(data_dir, TICK_PERIOD)
    }

    /// Build a runtime with a custom tick period.
    pub fn with_tick_period(data_dir: impl Into<PathBuf>, tick_period: Duration) -> Result<Arc<Self>> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;

        let lifecycle = Arc::new(LifecycleTracker::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let budget = Arc::new(BudgetManager::new(metrics.clone()));
        let config = Arc::new(ConfigStore::new(data_dir.join("config")));
        let scheduler = TickScheduler::with_tick_period(
            budget.clone(),
            metrics.clone(),
            lifecycle.clone(),
            tick_period,
        );
        let units = UnitManager::new(
            data_dir.join("modules"),
            config.clone(),
            scheduler.clone(),
            metrics.clone(),
            budget.clone(),
        );

        Ok(Arc::new(Self {
            data_dir,
            instance_id: Uuid::new_v4(),
            lifecycle,
            metrics,
            budget,
            config,
            scheduler,
            units,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            export_task: Mutex::new(None),
        }))
    }

    /// Bring every subsystem up and load the units. Idempotent while
    /// running. On failure everything started so far is rolled back in
    /// reverse and the runtime is left Stopped.
    pub fn start(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("runtime is already running");
            return Ok(());
        }

        info!(
            instance = %self.instance_id,
            data_dir = %self.data_dir.display(),
            "starting runtime"
        );
        let started = Instant::now();
        self.lifecycle.transition(LifecyclePhase::Starting);

        match self.start_subsystems() {
            Ok(()) => {
                *self.started_at.lock() = Some(started);
                self.lifecycle.transition(LifecyclePhase::Running);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "runtime started"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "startup failed; rolling back");
                self.teardown();
                self.running.store(false, Ordering::SeqCst);
                self.lifecycle.transition(LifecyclePhase::Stopped);
                Err(e)
            }
        }
    }

    fn start_subsystems(&self) -> Result<()> {
        self.metrics.initialize();

        self.config.initialize()?;
        let core_config = self.config.register("core", CoreConfig::default())?;
        self.budget.set_tick_budget_ms(core_config.tick_budget_ms);
        self.budget
            .set_default_unit_budget_ms(core_config.default_unit_budget_ms);
        {
            let budget = self.budget.clone();
            self.config
                .add_reload_listener::<CoreConfig, _>("core", move |_old, new| {
                    budget.set_tick_budget_ms(new.tick_budget_ms);
                    budget.set_default_unit_budget_ms(new.default_unit_budget_ms);
                    info!(
                        tick_budget_ms = new.tick_budget_ms,
                        default_unit_budget_ms = new.default_unit_budget_ms,
                        "budgets updated from configuration"
                    );
                });
        }

        self.scheduler.start()?;

        if core_config.metrics_enabled {
            self.metrics.add_exporter(Box::new(LogExporter));
            let interval_ticks = (core_config.metrics_export_interval_seconds * 1000
                / self.scheduler.tick_period().as_millis().max(1) as u64)
                .max(1) as i64;
            let metrics = self.metrics.clone();
            let handle = self.scheduler.run_task_timer(
                "core",
                move || metrics.export_to_all(),
                interval_ticks,
                interval_ticks,
            );
            *self.export_task.lock() = Some(handle);
        }

        self.units.discover_and_load()?;
        Ok(())
    }

    /// Unload all units in reverse load order, then tear the subsystems
    /// down in reverse start order.
    pub fn stop(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!("stopping runtime");
        self.lifecycle.transition(LifecyclePhase::Stopping);
        self.teardown();
        *self.started_at.lock() = None;
        self.lifecycle.transition(LifecyclePhase::Stopped);
        info!("runtime stopped");
    }

    fn teardown(&self) {
        self.units.unload_all();
        if let Some(handle) = self.export_task.lock().take() {
            handle.cancel();
        }
        self.scheduler.stop();
        self.config.shutdown();
        self.budget.shutdown();
        self.metrics.shutdown();
    }

    /// Reload all configurations, then every reload-supporting enabled
    /// unit.
    pub fn reload(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            warn!("reload requested while not running");
            return Ok(());
        }
        info!("reloading runtime");
        self.lifecycle.transition(LifecyclePhase::Reloading);
        self.config.reload_all();
        self.units.reload_all();
        self.lifecycle.transition(LifecyclePhase::Running);
        info!("runtime reloaded");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lifecycle.phase()
    }

    /// Wall-clock uptime, zero when stopped.
    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleTracker> {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn budget(&self) -> &Arc<BudgetManager> {
        &self.budget
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    pub fn units(&self) -> &Arc<UnitManager> {
        &self.units
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigData, ValidationErrors};
    use crate::error::{BoxedError, CoreError};
    use crate::properties::Properties;
    use crate::task::TaskPriority;
    use crate::units::{Unit, UnitContext, UnitDescriptor, DEFAULT_ENTRY_SYMBOL};
    use std::any::Any;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    struct LimitsConfig {
        tick_budget_ms: u64,
        module_budget_ms: u64,
    }

    impl Default for LimitsConfig {
        fn default() -> Self {
            Self {
                tick_budget_ms: 45,
                module_budget_ms: 10,
            }
        }
    }

    impl ConfigData for LimitsConfig {
        fn load(&mut self, props: &Properties) {
            self.tick_budget_ms = props.get_u64("tick_budget_ms", 45);
            self.module_budget_ms = props.get_u64("module_budget_ms", 10);
        }

        fn save(&self, props: &mut Properties) {
            props.set_u64("tick_budget_ms", self.tick_budget_ms);
            props.set_u64("module_budget_ms", self.module_budget_ms);
        }

        fn validate(&self) -> Vec<String> {
            ValidationErrors::new()
                .require_range_u64("tick_budget_ms", self.tick_budget_ms, 1, 100)
                .require_range_u64("module_budget_ms", self.module_budget_ms, 1, 50)
                .build()
        }
    }

    type EventLog = Arc<Mutex<Vec<(String, &'static str)>>>;

    struct TestUnit {
        name: String,
        events: EventLog,
    }

    impl Unit for TestUnit {
        fn on_load(&mut self, _context: Arc<UnitContext>) -> std::result::Result<(), BoxedError> {
            self.events.lock().push((self.name.clone(), "load"));
            Ok(())
        }

        fn on_enable(&mut self) -> std::result::Result<(), BoxedError> {
            self.events.lock().push((self.name.clone(), "enable"));
            Ok(())
        }

        fn on_disable(&mut self) -> std::result::Result<(), BoxedError> {
            self.events.lock().push((self.name.clone(), "disable"));
            Ok(())
        }

        fn on_reload(&mut self) -> std::result::Result<(), BoxedError> {
            self.events.lock().push((self.name.clone(), "reload"));
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn descriptor(id: &str, hard: &[&str]) -> UnitDescriptor {
        UnitDescriptor::new(
            id,
            "1.0.0",
            DEFAULT_ENTRY_SYMBOL,
            hard.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            BTreeSet::new(),
            format!("modules/{id}.so"),
        )
        .unwrap()
    }

    fn fast_runtime(dir: &Path) -> Arc<Runtime> {
        Runtime::with_tick_period(dir.join("data"), Duration::from_millis(5)).unwrap()
    }

    #[test]
    fn start_creates_layout_and_registers_core_config() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());

        runtime.start().unwrap();
        assert!(runtime.is_running());
        assert_eq!(runtime.phase(), LifecyclePhase::Running);

        let data_dir = runtime.data_dir();
        assert!(data_dir.join("config").is_dir());
        assert!(data_dir.join("modules").is_dir());
        assert!(data_dir.join("config").join("core.properties").is_file());

        let core: CoreConfig = runtime.config().get("core").unwrap();
        assert_eq!(core, CoreConfig::default());
        assert_eq!(runtime.budget().tick_budget_nanos(), 45_000_000);

        runtime.stop();
        assert!(!runtime.is_running());
        assert_eq!(runtime.phase(), LifecyclePhase::Stopped);
        assert_eq!(runtime.uptime(), Duration::ZERO);
    }

    #[test]
    fn start_is_idempotent_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());

        runtime.start().unwrap();
        runtime.start().unwrap();
        assert!(runtime.is_running());
        runtime.stop();
        runtime.stop();
    }

    #[test]
    fn registering_a_config_creates_its_file_with_default_values() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        let value = runtime
            .config()
            .register("limits", LimitsConfig::default())
            .unwrap();
        assert_eq!(value.tick_budget_ms, 45);
        assert_eq!(value.module_budget_ms, 10);

        let path = runtime.data_dir().join("config").join("limits.properties");
        assert!(path.is_file());
        let props = Properties::load_file(&path).unwrap();
        let keys: Vec<&str> = props.keys().collect();
        assert_eq!(keys, vec!["module_budget_ms", "tick_budget_ms"]);

        let fetched: LimitsConfig = runtime.config().get("limits").unwrap();
        assert_eq!(fetched, LimitsConfig::default());
        runtime.stop();
    }

    #[test]
    fn core_config_reload_applies_budgets_live() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        std::fs::write(
            runtime.data_dir().join("config").join("core.properties"),
            "tick_budget_ms=60\ndefault_unit_budget_ms=20\nmetrics_enabled=true\n\
             metrics_export_interval_seconds=60\nlog_level=info\n",
        )
        .unwrap();
        runtime.config().reload("core").unwrap();

        assert_eq!(runtime.budget().tick_budget_nanos(), 60_000_000);
        runtime.stop();
    }

    #[test]
    fn invalid_core_config_edit_is_rejected_and_value_kept() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        std::fs::write(
            runtime.data_dir().join("config").join("core.properties"),
            "tick_budget_ms=200\n",
        )
        .unwrap();

        let err = runtime.config().reload("core").unwrap_err();
        match err {
            CoreError::Validation { errors, .. } => {
                assert!(errors
                    .iter()
                    .any(|e| e == "tick_budget_ms must be between 1 and 100"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let core: CoreConfig = runtime.config().get("core").unwrap();
        assert_eq!(core.tick_budget_ms, 45);
        assert_eq!(runtime.budget().tick_budget_nanos(), 45_000_000);
        runtime.stop();
    }

    #[test]
    fn periodic_unit_task_executes_on_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        let ran_at = Arc::new(Mutex::new(Vec::new()));
        let sink = ran_at.clone();
        let ticks = runtime.scheduler().clone();
        runtime.scheduler().run_task_timer(
            "module_a",
            move || sink.lock().push(ticks.current_tick()),
            0,
            5,
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while runtime.scheduler().current_tick() < 60 {
            assert!(Instant::now() < deadline, "scheduler did not advance");
            std::thread::sleep(Duration::from_millis(10));
        }
        runtime.stop();

        let observed: Vec<u64> = ran_at.lock().iter().copied().filter(|t| *t <= 50).collect();
        assert_eq!(observed.len(), 10, "observed ticks: {observed:?}");
        for tick in &observed {
            assert_eq!((tick - 1) % 5, 0, "unexpected execution tick {tick}");
        }
    }

    #[test]
    fn stop_unloads_units_in_reverse_load_order() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        let units = runtime.units();
        units
            .install_for_test(
                descriptor("alpha", &[]),
                Box::new(TestUnit {
                    name: "alpha".to_string(),
                    events: log.clone(),
                }),
            )
            .unwrap();
        units
            .install_for_test(
                descriptor("beta", &["alpha"]),
                Box::new(TestUnit {
                    name: "beta".to_string(),
                    events: log.clone(),
                }),
            )
            .unwrap();
        units.enable("alpha").unwrap();
        units.enable("beta").unwrap();
        assert_eq!(units.enabled_ids(), vec!["alpha", "beta"]);

        runtime.stop();
        assert_eq!(runtime.units().count(), 0);

        let disables: Vec<String> = log
            .lock()
            .iter()
            .filter(|(_, e)| *e == "disable")
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(disables, vec!["beta", "alpha"]);
    }

    #[test]
    fn runtime_reload_reaches_configs_and_units() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        let log: EventLog = Arc::new(Mutex::new(Vec::new()));
        runtime
            .units()
            .install_for_test(
                descriptor("alpha", &[]),
                Box::new(TestUnit {
                    name: "alpha".to_string(),
                    events: log.clone(),
                }),
            )
            .unwrap();
        runtime.units().enable("alpha").unwrap();

        runtime.reload().unwrap();
        assert_eq!(runtime.phase(), LifecyclePhase::Running);

        let reloads = log.lock().iter().filter(|(_, e)| *e == "reload").count();
        assert_eq!(reloads, 1);
        runtime.stop();
    }

    #[test]
    fn failed_start_rolls_back_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(&data_dir).unwrap();
        // A file where the config directory should be makes C3 fail.
        std::fs::write(data_dir.join("config"), "not a directory").unwrap();

        let runtime = Runtime::with_tick_period(&data_dir, Duration::from_millis(5)).unwrap();
        assert!(runtime.start().is_err());
        assert!(!runtime.is_running());
        assert_eq!(runtime.phase(), LifecyclePhase::Stopped);
    }

    #[test]
    fn deferred_work_survives_into_budgeted_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fast_runtime(dir.path());
        runtime.start().unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        runtime.scheduler().defer(
            "core",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            TaskPriority::Low,
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while ran.load(Ordering::SeqCst) == 0 {
            assert!(Instant::now() < deadline, "deferred task never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        runtime.stop();
    }
}
