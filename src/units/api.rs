//! The plug-in contract: the `Unit` trait, the per-unit context, and the
//! `declare_unit!` macro that packages export their entry points with.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::config::ConfigStore;
use crate::error::BoxedError;
use crate::logging::UnitLogger;
use crate::metrics::MetricsRegistry;
use crate::scheduler::TickScheduler;
use crate::units::{UnitManager, UnitState};

/// Contract every unit implements.
///
/// Hooks return explicit results; the manager additionally contains panics
/// at the boundary, so a misbehaving unit can never take the core down.
/// Units must be thread-safe and release their resources in `on_disable`.
pub trait Unit: Any + Send + Sync {
    /// Called once when the unit is loaded into memory. The context is the
    /// unit's only capability bundle; keep it for later use.
    fn on_load(&mut self, context: Arc<UnitContext>) -> Result<(), BoxedError>;

    /// Called when the unit becomes active. Schedule tasks, register
    /// listeners.
    fn on_enable(&mut self) -> Result<(), BoxedError>;

    /// Called when the unit is deactivated. Best-effort cleanup: errors are
    /// logged but the unit always ends up disabled.
    fn on_disable(&mut self) -> Result<(), BoxedError>;

    /// Called when the runtime reloads. Re-read config values here.
    fn on_reload(&mut self) -> Result<(), BoxedError> {
        Ok(())
    }

    /// Whether this unit supports runtime reloading.
    fn supports_reload(&self) -> bool {
        true
    }

    /// Downcasting hook for typed inter-unit lookup.
    fn as_any(&self) -> &dyn Any;
}

/// Capability bundle handed to a unit at load time.
///
/// Holds the unit's identity, its private data directory, a scoped logger,
/// and references to the core services. The manager reference is weak:
/// units look other units up through it and must not cache what they find.
pub struct UnitContext {
    unit_id: String,
    data_dir: PathBuf,
    logger: UnitLogger,
    config: Arc<ConfigStore>,
    scheduler: Arc<TickScheduler>,
    metrics: Arc<MetricsRegistry>,
    manager: Weak<UnitManager>,
}

impl UnitContext {
    pub(crate) fn new(
        unit_id: String,
        data_dir: PathBuf,
        logger: UnitLogger,
        config: Arc<ConfigStore>,
        scheduler: Arc<TickScheduler>,
        metrics: Arc<MetricsRegistry>,
        manager: Weak<UnitManager>,
    ) -> Self {
        Self {
            unit_id,
            data_dir,
            logger,
            config,
            scheduler,
            metrics,
            manager,
        }
    }

    /// The unique identifier of this unit.
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Private data directory for this unit's files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Logger scoped to this unit.
    pub fn logger(&self) -> &UnitLogger {
        &self.logger
    }

    /// The typed configuration store.
    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// The tick scheduler.
    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    /// The metrics registry.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// The unit manager, for inter-unit lookup. Returns `None` during
    /// teardown when the manager is gone.
    pub fn manager(&self) -> Option<Arc<UnitManager>> {
        self.manager.upgrade()
    }

    /// Whether another unit is currently enabled. Safe to call from inside
    /// lifecycle hooks; queries never contend with the transition in
    /// progress.
    pub fn is_unit_enabled(&self, unit_id: &str) -> bool {
        self.manager()
            .map(|manager| manager.is_enabled(unit_id))
            .unwrap_or(false)
    }

    /// State of another unit, if it is present in the manager. Safe to
    /// call from inside lifecycle hooks.
    pub fn unit_state(&self, unit_id: &str) -> Option<UnitState> {
        self.manager().and_then(|manager| manager.state(unit_id))
    }
}

/// Export the symbols a unit package must carry.
///
/// The first argument is the TOML manifest text; the second is a
/// constructor expression producing the unit value.
///
/// ```ignore
/// pub struct ChatUnit { /* ... */ }
/// // impl Unit for ChatUnit { ... }
///
/// vanadium::declare_unit!(
///     r#"
///         id = "chat"
///         version = "1.0.0"
///         depends = "core_db"
///     "#,
///     ChatUnit::new
/// );
/// ```
#[macro_export]
macro_rules! declare_unit {
    ($manifest:expr, $ctor:expr) => {
        #[no_mangle]
        pub extern "C" fn unit_manifest() -> *const ::std::os::raw::c_char {
            static MANIFEST: ::std::sync::OnceLock<::std::ffi::CString> =
                ::std::sync::OnceLock::new();
            MANIFEST
                .get_or_init(|| {
                    ::std::ffi::CString::new($manifest).expect("manifest contains NUL byte")
                })
                .as_ptr()
        }

        #[no_mangle]
        pub extern "C" fn unit_create() -> *mut ::std::boxed::Box<dyn $crate::Unit> {
            // A panicking constructor must not unwind across the FFI
            // boundary; the loader treats null as a failed construction.
            let created = ::std::panic::catch_unwind(|| {
                let unit: ::std::boxed::Box<dyn $crate::Unit> =
                    ::std::boxed::Box::new(($ctor)());
                unit
            });
            match created {
                Ok(unit) => ::std::boxed::Box::into_raw(::std::boxed::Box::new(unit)),
                Err(_) => ::std::ptr::null_mut(),
            }
        }
    };
}
