//! Runtime lifecycle phases, listeners and shutdown hooks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Phases of the runtime, from construction through shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Created but not started, or fully stopped.
    Stopped,
    /// Subsystems are being brought up.
    Starting,
    /// Fully operational.
    Running,
    /// Configs and units are being reloaded.
    Reloading,
    /// Subsystems are being torn down.
    Stopping,
}

impl LifecyclePhase {
    /// Whether unit load/enable/disable operations are permitted.
    pub fn allows_unit_operations(&self) -> bool {
        matches!(self, LifecyclePhase::Running | LifecyclePhase::Reloading)
    }

    /// Whether new task scheduling is permitted.
    pub fn allows_task_scheduling(&self) -> bool {
        matches!(self, LifecyclePhase::Running)
    }
}

/// Listener notified on phase transitions. All methods default to no-ops;
/// implement only what you need.
pub trait LifecycleListener: Send + Sync {
    fn on_phase_change(&self, _old: LifecyclePhase, _new: LifecyclePhase) {}
    fn on_starting(&self) {}
    fn on_running(&self) {}
    fn on_reloading(&self) {}
    fn on_stopping(&self) {}
    fn on_stopped(&self) {}
}

struct ShutdownHook {
    name: String,
    action: Box<dyn Fn() + Send + Sync>,
}

/// Tracks the current phase and fans transitions out to listeners.
///
/// Shutdown hooks run in reverse registration order when the Stopping phase
/// is entered. Listener panics are contained and logged.
pub struct LifecycleTracker {
    phase: Mutex<LifecyclePhase>,
    listeners: Mutex<Vec<Arc<dyn LifecycleListener>>>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(LifecyclePhase::Stopped),
            listeners: Mutex::new(Vec::new()),
            shutdown_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        *self.phase.lock()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == LifecyclePhase::Running
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LifecycleListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Register a hook executed during the Stopping transition.
    /// Hooks run in reverse registration order.
    pub fn add_shutdown_hook(&self, name: &str, action: impl Fn() + Send + Sync + 'static) {
        self.shutdown_hooks.lock().push(ShutdownHook {
            name: name.to_string(),
            action: Box::new(action),
        });
    }

    /// Move to `new_phase`, notifying listeners when the phase changes.
    /// Entering Stopping also executes the shutdown hooks.
    pub fn transition(&self, new_phase: LifecyclePhase) {
        let old_phase = {
            let mut phase = self.phase.lock();
            std::mem::replace(&mut *phase, new_phase)
        };
        if old_phase == new_phase {
            return;
        }
        info!(from = ?old_phase, to = ?new_phase, "lifecycle transition");
        self.notify(old_phase, new_phase);
        if new_phase == LifecyclePhase::Stopping {
            self.run_shutdown_hooks();
        }
    }

    fn notify(&self, old_phase: LifecyclePhase, new_phase: LifecyclePhase) {
        let listeners: Vec<Arc<dyn LifecycleListener>> = self.listeners.lock().clone();
        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.on_phase_change(old_phase, new_phase);
                match new_phase {
                    LifecyclePhase::Starting => listener.on_starting(),
                    LifecyclePhase::Running => listener.on_running(),
                    LifecyclePhase::Reloading => listener.on_reloading(),
                    LifecyclePhase::Stopping => listener.on_stopping(),
                    LifecyclePhase::Stopped => listener.on_stopped(),
                }
            }));
            if outcome.is_err() {
                warn!("lifecycle listener panicked");
            }
        }
    }

    fn run_shutdown_hooks(&self) {
        let hooks = self.shutdown_hooks.lock();
        debug!(count = hooks.len(), "running shutdown hooks");
        for hook in hooks.iter().rev() {
            if catch_unwind(AssertUnwindSafe(|| (hook.action)())).is_err() {
                warn!(hook = %hook.name, "shutdown hook panicked");
            }
        }
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}
