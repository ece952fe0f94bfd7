//! Unit discovery, dependency resolution and lifecycle management.
//!
//! Units are dynamic-library packages in the modules directory. Discovery
//! parses each package's embedded manifest into a descriptor, dependency
//! resolution produces a topological load order, and the manager drives
//! each unit through its state machine. Unloading drops the instance and
//! every closure it scheduled before the code scope is released.
//!
//! Locking: transitions (load, enable, disable, unload, reload) serialize
//! on one reentrant mutex; the container map and per-container state are
//! only ever locked briefly and never across a unit hook. A hook may
//! therefore query sibling units through its context, or even drive
//! another transition, without deadlocking.

mod api;
mod descriptor;
mod loader;
mod state;

pub use api::{Unit, UnitContext};
pub use descriptor::{is_valid_unit_id, UnitDescriptor, DEFAULT_ENTRY_SYMBOL, PACKAGE_EXTENSIONS};
pub use state::UnitState;

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::budget::BudgetManager;
use crate::config::ConfigStore;
use crate::error::{panic_message, CoreError, Result};
use crate::logging::UnitLogger;
use crate::metrics::MetricsRegistry;
use crate::scheduler::TickScheduler;
use loader::CodeScope;

/// Read-only information about a managed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: String,
    pub version: String,
    pub state: UnitState,
}

/// Manager-owned record binding a descriptor to its live instance.
///
/// State and instance sit in their own cells so queries can read state
/// while a transition on the same unit is mid-hook. Both cells are locked
/// only briefly; neither lock is held across user code except the instance
/// lock during that unit's own hook.
struct UnitContainer {
    descriptor: UnitDescriptor,
    instance: Mutex<Box<dyn Unit>>,
    context: Arc<UnitContext>,
    state: Mutex<UnitState>,
}

impl UnitContainer {
    fn state(&self) -> UnitState {
        *self.state.lock()
    }

    fn set_state(&self, state: UnitState) {
        *self.state.lock() = state;
    }
}

/// Produce a load order over `descriptors` that is a valid topological
/// order of the hard-dependency graph.
///
/// Cycles are logged with the offending path and every cycle member is
/// excluded. A missing hard dependency excludes the dependent, transitively.
/// Soft dependencies sort their providers earlier when present but never
/// gate inclusion.
pub fn resolve_load_order(descriptors: Vec<UnitDescriptor>) -> Vec<UnitDescriptor> {
    let by_id: HashMap<&str, &UnitDescriptor> =
        descriptors.iter().map(|d| (d.id(), d)).collect();

    let mut sorted = Vec::new();
    let mut visited = HashSet::new();
    let mut excluded = HashSet::new();
    let mut stack = Vec::new();

    for descriptor in &descriptors {
        visit(
            descriptor,
            &by_id,
            &mut visited,
            &mut excluded,
            &mut stack,
            &mut sorted,
        );
    }
    sorted
}

fn visit(
    descriptor: &UnitDescriptor,
    by_id: &HashMap<&str, &UnitDescriptor>,
    visited: &mut HashSet<String>,
    excluded: &mut HashSet<String>,
    stack: &mut Vec<String>,
    sorted: &mut Vec<UnitDescriptor>,
) -> bool {
    let id = descriptor.id();
    if excluded.contains(id) {
        return false;
    }
    if visited.contains(id) {
        return true;
    }
    if let Some(position) = stack.iter().position(|entry| entry == id) {
        let cycle_path = stack[position..]
            .iter()
            .map(String::as_str)
            .chain([id])
            .collect::<Vec<&str>>()
            .join(" -> ");
        error!(cycle = %cycle_path, "circular dependency; excluding cycle members");
        for member in &stack[position..] {
            excluded.insert(member.clone());
        }
        return false;
    }

    stack.push(id.to_string());
    let mut includable = true;
    for dependency in descriptor.hard_dependencies() {
        match by_id.get(dependency.as_str()) {
            None => {
                warn!(unit = id, dependency = %dependency, "missing hard dependency; excluding unit");
                includable = false;
                break;
            }
            Some(provider) => {
                if !visit(provider, by_id, visited, excluded, stack, sorted) {
                    if !excluded.contains(id) {
                        warn!(unit = id, dependency = %dependency, "hard dependency excluded; excluding unit");
                    }
                    includable = false;
                    break;
                }
            }
        }
    }
    if includable {
        for dependency in descriptor.soft_dependencies() {
            if let Some(provider) = by_id.get(dependency.as_str()) {
                // Best-effort ordering hint only.
                let _ = visit(provider, by_id, visited, excluded, stack, sorted);
            }
        }
    }
    stack.pop();

    if includable && !excluded.contains(id) {
        visited.insert(id.to_string());
        sorted.push(descriptor.clone());
        true
    } else {
        excluded.insert(id.to_string());
        false
    }
}

/// Owns every unit container and its code scope.
///
/// Transitions run on the caller's thread under the reentrant transition
/// mutex. Queries (`is_loaded`, `is_enabled`, `state`, `list`, lookups via
/// [`UnitContext`]) take only the brief structural read lock and therefore
/// stay callable from inside any unit hook.
pub struct UnitManager {
    modules_dir: PathBuf,
    // Containers are declared before scopes so instances drop before the
    // libraries that hold their code.
    containers: RwLock<HashMap<String, Arc<UnitContainer>>>,
    /// Serializes transitions; reentrant so a hook may drive another
    /// transition the way the original's reentrant writer allowed.
    transitions: ReentrantMutex<()>,
    scopes: Mutex<HashMap<String, CodeScope>>,
    load_order: Mutex<Vec<String>>,

    config: Arc<ConfigStore>,
    scheduler: Arc<TickScheduler>,
    metrics: Arc<MetricsRegistry>,
    budget: Arc<BudgetManager>,
    self_weak: Weak<UnitManager>,
}

impl UnitManager {
    pub fn new(
        modules_dir: impl Into<PathBuf>,
        config: Arc<ConfigStore>,
        scheduler: Arc<TickScheduler>,
        metrics: Arc<MetricsRegistry>,
        budget: Arc<BudgetManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            modules_dir: modules_dir.into(),
            containers: RwLock::new(HashMap::new()),
            transitions: ReentrantMutex::new(()),
            scopes: Mutex::new(HashMap::new()),
            load_order: Mutex::new(Vec::new()),
            config,
            scheduler,
            metrics,
            budget,
            self_weak: self_weak.clone(),
        })
    }

    pub fn modules_dir(&self) -> &PathBuf {
        &self.modules_dir
    }

    /// Discover packages in the modules directory, resolve the dependency
    /// order, then load and enable every resolvable unit. Individual
    /// failures are logged and do not stop the rest.
    pub fn discover_and_load(&self) -> Result<()> {
        std::fs::create_dir_all(&self.modules_dir)?;

        let mut descriptors = Vec::new();
        for entry in std::fs::read_dir(&self.modules_dir)? {
            let path = entry?.path();
            let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
                continue;
            };
            if !PACKAGE_EXTENSIONS.contains(&extension) {
                continue;
            }
            match CodeScope::read_manifest(&path) {
                Ok(manifest) => match UnitDescriptor::parse_manifest(&path, &manifest) {
                    Ok(descriptor) => descriptors.push(descriptor),
                    Err(e) => {
                        error!(package = %path.display(), error = %e, "bad unit manifest; skipping package");
                    }
                },
                Err(e) => {
                    error!(package = %path.display(), error = %e, "unreadable unit package; skipping");
                }
            }
        }
        info!(packages = descriptors.len(), "discovered unit packages");

        let ordered = resolve_load_order(descriptors);
        for descriptor in &ordered {
            if let Err(e) = self.load(descriptor.clone()) {
                error!(unit = descriptor.id(), error = %e, "failed to load unit");
            }
        }
        for descriptor in &ordered {
            if self.is_loaded(descriptor.id()) {
                if let Err(e) = self.enable(descriptor.id()) {
                    error!(unit = descriptor.id(), error = %e, "failed to enable unit");
                }
            }
        }

        info!(loaded = self.count(), "unit discovery complete");
        Ok(())
    }

    /// Load a unit from its package. All hard dependencies must already be
    /// loaded. On failure nothing is installed and the code scope closes.
    pub fn load(&self, descriptor: UnitDescriptor) -> Result<()> {
        let scope = CodeScope::open(descriptor.package_path()).map_err(|detail| {
            CoreError::Load {
                unit: descriptor.id().to_string(),
                detail,
            }
        })?;
        let instance = scope
            .create_instance(descriptor.entry_symbol())
            .map_err(|detail| CoreError::Load {
                unit: descriptor.id().to_string(),
                detail,
            })?;
        self.install(Some(scope), descriptor, instance)
    }

    // `scope` is the first parameter on purpose: parameters drop in
    // reverse declaration order, and the instance must drop before the
    // library on every early-return path.
    fn install(
        &self,
        scope: Option<CodeScope>,
        descriptor: UnitDescriptor,
        mut instance: Box<dyn Unit>,
    ) -> Result<()> {
        let _transition = self.transitions.lock();
        let id = descriptor.id().to_string();
        {
            let containers = self.containers.read();
            if containers.contains_key(&id) {
                return Err(CoreError::Load {
                    unit: id,
                    detail: "unit is already loaded".to_string(),
                });
            }
            for dependency in descriptor.hard_dependencies() {
                if !containers.contains_key(dependency) {
                    return Err(CoreError::Dependency {
                        unit: id,
                        detail: format!("missing hard dependency '{dependency}'"),
                    });
                }
            }
        }

        info!(unit = %id, version = descriptor.version(), "loading unit");
        let data_dir = self.modules_dir.join(&id);
        std::fs::create_dir_all(&data_dir).map_err(|e| CoreError::Load {
            unit: id.clone(),
            detail: format!("failed to create data directory: {e}"),
        })?;

        let context = Arc::new(UnitContext::new(
            id.clone(),
            data_dir,
            UnitLogger::new(&id),
            self.config.clone(),
            self.scheduler.clone(),
            self.metrics.clone(),
            self.self_weak.clone(),
        ));

        // No map lock is held here: the hook may freely query the manager.
        match catch_unwind(AssertUnwindSafe(|| instance.on_load(context.clone()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(CoreError::Load {
                    unit: id,
                    detail: e.to_string(),
                });
            }
            Err(payload) => {
                return Err(CoreError::Load {
                    unit: id,
                    detail: format!("panic in on_load: {}", panic_message(payload)),
                });
            }
        }

        self.containers.write().insert(
            id.clone(),
            Arc::new(UnitContainer {
                descriptor,
                instance: Mutex::new(instance),
                context,
                state: Mutex::new(UnitState::Loaded),
            }),
        );

        if let Some(scope) = scope {
            self.scopes.lock().insert(id.clone(), scope);
        }
        self.load_order.lock().push(id.clone());
        self.budget.register_unit(&id);
        info!(unit = %id, "unit loaded");
        Ok(())
    }

    /// Enable a loaded (or re-enable a disabled) unit.
    ///
    /// Hard dependencies are only required to be loaded, not enabled; a
    /// dependent that needs a live dependency checks for it in its own
    /// `on_enable`.
    pub fn enable(&self, id: &str) -> Result<()> {
        let _transition = self.transitions.lock();
        let container = self.transition_container(id)?;
        let current = container.state();
        if !current.can_enable() {
            return Err(CoreError::InvalidState {
                unit: id.to_string(),
                operation: "enable",
                state: current,
            });
        }

        info!(unit = id, "enabling unit");
        container.set_state(UnitState::Enabling);
        let outcome = {
            let mut instance = container.instance.lock();
            catch_unwind(AssertUnwindSafe(|| instance.on_enable()))
        };
        match outcome {
            Ok(Ok(())) => {
                container.set_state(UnitState::Enabled);
                info!(unit = id, "unit enabled");
                Ok(())
            }
            Ok(Err(e)) => {
                container.set_state(UnitState::Failed);
                Err(CoreError::Enable {
                    unit: id.to_string(),
                    detail: e.to_string(),
                })
            }
            Err(payload) => {
                container.set_state(UnitState::Failed);
                Err(CoreError::Enable {
                    unit: id.to_string(),
                    detail: format!("panic in on_enable: {}", panic_message(payload)),
                })
            }
        }
    }

    /// Disable an enabled unit. Errors from `on_disable` are logged; the
    /// unit always ends up Disabled.
    pub fn disable(&self, id: &str) -> Result<()> {
        let _transition = self.transitions.lock();
        let container = self.transition_container(id)?;
        let current = container.state();
        if !current.can_disable() {
            return Err(CoreError::InvalidState {
                unit: id.to_string(),
                operation: "disable",
                state: current,
            });
        }

        info!(unit = id, "disabling unit");
        container.set_state(UnitState::Disabling);
        let outcome = {
            let mut instance = container.instance.lock();
            catch_unwind(AssertUnwindSafe(|| instance.on_disable()))
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(unit = id, error = %e, "error disabling unit");
            }
            Err(payload) => {
                error!(unit = id, panic = %panic_message(payload), "panic disabling unit");
            }
        }
        container.set_state(UnitState::Disabled);
        info!(unit = id, "unit disabled");
        Ok(())
    }

    /// Unload a unit entirely: disable if active, cancel its scheduled
    /// tasks, drop the instance, then release its code scope.
    pub fn unload(&self, id: &str) -> Result<()> {
        let _transition = self.transitions.lock();
        let Some(container) = self.containers.write().remove(id) else {
            return Err(CoreError::UnknownUnit {
                unit: id.to_string(),
            });
        };

        info!(unit = id, "unloading unit");
        let was_active = container.state().is_active();
        container.set_state(UnitState::Unloading);
        if was_active {
            let outcome = {
                let mut instance = container.instance.lock();
                catch_unwind(AssertUnwindSafe(|| instance.on_disable()))
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(unit = id, error = %e, "error disabling unit during unload"),
                Err(payload) => {
                    error!(unit = id, panic = %panic_message(payload), "panic disabling unit during unload");
                }
            }
        }

        // The unit's queued closures hold code from its library; purge them
        // before the instance and scope go away.
        self.scheduler.cancel_owned(id);
        self.budget.unregister_unit(id);
        self.load_order.lock().retain(|entry| entry != id);

        debug!(unit = id, data_dir = %container.context.data_dir().display(), "dropping unit container");
        // Queries only borrow containers under the map lock, and other
        // transitions are excluded, so this is the last strong reference.
        drop(container);
        if self.scopes.lock().remove(id).is_some() {
            debug!(unit = id, "code scope released");
        }
        info!(unit = id, "unit unloaded");
        Ok(())
    }

    /// Ask a unit to reload its configuration. Refused when the unit does
    /// not advertise reload support. The manifest is not re-parsed, no
    /// structural lock is taken, and queries proceed throughout.
    pub fn reload(&self, id: &str) -> Result<()> {
        let _transition = self.transitions.lock();
        let container = self.transition_container(id)?;
        if !container.instance.lock().supports_reload() {
            return Err(CoreError::Reload {
                unit: id.to_string(),
                detail: "unit does not support reload".to_string(),
            });
        }

        info!(unit = id, "reloading unit");
        let outcome = {
            let mut instance = container.instance.lock();
            catch_unwind(AssertUnwindSafe(|| instance.on_reload()))
        };
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CoreError::Reload {
                unit: id.to_string(),
                detail: e.to_string(),
            }),
            Err(payload) => Err(CoreError::Reload {
                unit: id.to_string(),
                detail: format!("panic in on_reload: {}", panic_message(payload)),
            }),
        }
    }

    /// Reload every enabled unit that supports it.
    pub fn reload_all(&self) {
        let ids = self.load_order.lock().clone();
        for id in ids {
            let eligible = {
                let containers = self.containers.read();
                containers
                    .get(&id)
                    .map(|c| c.state().is_active() && c.instance.lock().supports_reload())
            };
            match eligible {
                Some(true) => {
                    if let Err(e) = self.reload(&id) {
                        error!(unit = %id, error = %e, "failed to reload unit");
                    }
                }
                Some(false) => debug!(unit = %id, "unit skipped during reload"),
                None => {}
            }
        }
    }

    /// Unload every unit in reverse load order.
    pub fn unload_all(&self) {
        let ids: Vec<String> = {
            let order = self.load_order.lock();
            order.iter().rev().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.unload(&id) {
                error!(unit = %id, error = %e, "failed to unload unit");
            }
        }
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.containers.read_recursive().contains_key(id)
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.containers
            .read_recursive()
            .get(id)
            .map(|container| container.state().is_active())
            .unwrap_or(false)
    }

    /// Current state of a unit, or `None` if it is not present.
    pub fn state(&self, id: &str) -> Option<UnitState> {
        self.containers
            .read_recursive()
            .get(id)
            .map(|container| container.state())
    }

    pub fn count(&self) -> usize {
        self.containers.read_recursive().len()
    }

    /// Ids of loaded units, in load order.
    pub fn loaded_ids(&self) -> Vec<String> {
        self.load_order.lock().clone()
    }

    pub fn enabled_ids(&self) -> Vec<String> {
        let containers = self.containers.read_recursive();
        self.load_order
            .lock()
            .iter()
            .filter(|id| {
                containers
                    .get(*id)
                    .map(|c| c.state().is_active())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Unit information in load order.
    pub fn list(&self) -> Vec<UnitInfo> {
        let containers = self.containers.read_recursive();
        self.load_order
            .lock()
            .iter()
            .filter_map(|id| {
                containers.get(id).map(|container| UnitInfo {
                    id: id.clone(),
                    version: container.descriptor.version().to_string(),
                    state: container.state(),
                })
            })
            .collect()
    }

    /// Look a unit up by id and concrete type. The reference is only valid
    /// inside the closure; callers must not cache it. Blocks while the
    /// target unit's own hook is executing; a unit must not look itself up
    /// from inside one of its hooks.
    pub fn with_unit<T: Unit, R>(&self, id: &str, f: impl FnOnce(&T) -> R) -> Option<R> {
        let containers = self.containers.read_recursive();
        let container = containers.get(id)?;
        let instance = container.instance.lock();
        instance.as_any().downcast_ref::<T>().map(f)
    }

    /// Fetch a container for a transition. Only transition methods clone
    /// the `Arc`, and transitions exclude each other, so unload always
    /// drops the final reference before releasing the code scope.
    fn transition_container(&self, id: &str) -> Result<Arc<UnitContainer>> {
        self.containers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownUnit {
                unit: id.to_string(),
            })
    }

    /// Test seam: install a pre-built instance without a code scope.
    #[cfg(test)]
    pub(crate) fn install_for_test(
        &self,
        descriptor: UnitDescriptor,
        instance: Box<dyn Unit>,
    ) -> Result<()> {
        self.install(None, descriptor, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxedError;
    use crate::lifecycle::LifecycleTracker;
    use std::any::Any;
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type EventLog = Arc<Mutex<Vec<(String, &'static str)>>>;

    struct TestUnit {
        name: String,
        events: EventLog,
        fail_enable: bool,
        fail_disable: bool,
        reload_supported: bool,
        context: Option<Arc<UnitContext>>,
    }

    impl TestUnit {
        fn new(name: &str, events: EventLog) -> Self {
            Self {
                name: name.to_string(),
                events,
                fail_enable: false,
                fail_disable: false,
                reload_supported: true,
                context: None,
            }
        }

        fn failing_enable(mut self) -> Self {
            self.fail_enable = true;
            self
        }

        fn failing_disable(mut self) -> Self {
            self.fail_disable = true;
            self
        }

        fn without_reload(mut self) -> Self {
            self.reload_supported = false;
            self
        }

        fn push(&self, event: &'static str) {
            self.events.lock().push((self.name.clone(), event));
        }
    }

    impl Unit for TestUnit {
        fn on_load(&mut self, context: Arc<UnitContext>) -> std::result::Result<(), BoxedError> {
            self.push("load");
            self.context = Some(context);
            Ok(())
        }

        fn on_enable(&mut self) -> std::result::Result<(), BoxedError> {
            if self.fail_enable {
                return Err("enable refused".into());
            }
            self.push("enable");
            Ok(())
        }

        fn on_disable(&mut self) -> std::result::Result<(), BoxedError> {
            self.push("disable");
            if self.fail_disable {
                return Err("disable hiccup".into());
            }
            Ok(())
        }

        fn on_reload(&mut self) -> std::result::Result<(), BoxedError> {
            self.push("reload");
            Ok(())
        }

        fn supports_reload(&self) -> bool {
            self.reload_supported
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Observation taken from inside a hook: (phase, sibling state,
    /// sibling enabled, own state as the manager reports it).
    type Probe = (&'static str, Option<UnitState>, bool, Option<UnitState>);

    /// Unit whose hooks query the manager mid-transition, the way a
    /// dependent is expected to check on its dependency.
    struct ProbingUnit {
        target: &'static str,
        observations: Arc<Mutex<Vec<Probe>>>,
        context: Option<Arc<UnitContext>>,
    }

    impl ProbingUnit {
        fn observe(&self, phase: &'static str, context: &UnitContext) {
            self.observations.lock().push((
                phase,
                context.unit_state(self.target),
                context.is_unit_enabled(self.target),
                context.unit_state(context.unit_id()),
            ));
        }
    }

    impl Unit for ProbingUnit {
        fn on_load(&mut self, context: Arc<UnitContext>) -> std::result::Result<(), BoxedError> {
            self.observe("load", &context);
            self.context = Some(context);
            Ok(())
        }

        fn on_enable(&mut self) -> std::result::Result<(), BoxedError> {
            let context = self.context.clone().ok_or("context missing")?;
            self.observe("enable", &context);
            Ok(())
        }

        fn on_disable(&mut self) -> std::result::Result<(), BoxedError> {
            let context = self.context.clone().ok_or("context missing")?;
            self.observe("disable", &context);
            Ok(())
        }

        fn on_reload(&mut self) -> std::result::Result<(), BoxedError> {
            let context = self.context.clone().ok_or("context missing")?;
            self.observe("reload", &context);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn descriptor(id: &str, hard: &[&str], soft: &[&str]) -> UnitDescriptor {
        let to_set = |ids: &[&str]| -> BTreeSet<String> {
            ids.iter().map(|s| s.to_string()).collect()
        };
        UnitDescriptor::new(
            id,
            "1.0.0",
            DEFAULT_ENTRY_SYMBOL,
            to_set(hard),
            to_set(soft),
            format!("modules/{id}.so"),
        )
        .unwrap()
    }

    fn fixture(dir: &Path) -> (Arc<UnitManager>, Arc<TickScheduler>, Arc<BudgetManager>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let budget = Arc::new(BudgetManager::new(metrics.clone()));
        let lifecycle = Arc::new(LifecycleTracker::new());
        let scheduler = TickScheduler::new(budget.clone(), metrics.clone(), lifecycle);
        let config = Arc::new(ConfigStore::new(dir.join("config")));
        let manager = UnitManager::new(
            dir.join("modules"),
            config,
            scheduler.clone(),
            metrics,
            budget.clone(),
        );
        (manager, scheduler, budget)
    }

    fn events() -> EventLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn load_enable_disable_walks_the_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, budget) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", log.clone())))
            .unwrap();
        assert_eq!(manager.state("a"), Some(UnitState::Loaded));
        assert!(budget.unit_stats("a").is_some());

        manager.enable("a").unwrap();
        assert_eq!(manager.state("a"), Some(UnitState::Enabled));
        assert!(manager.is_enabled("a"));

        manager.disable("a").unwrap();
        assert_eq!(manager.state("a"), Some(UnitState::Disabled));

        // Re-enable from Disabled is legal.
        manager.enable("a").unwrap();
        assert_eq!(manager.state("a"), Some(UnitState::Enabled));

        let seen: Vec<&'static str> = log.lock().iter().map(|(_, e)| *e).collect();
        assert_eq!(seen, vec!["load", "enable", "disable", "enable"]);
    }

    #[test]
    fn hooks_can_query_sibling_units_mid_transition() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap();
        manager.enable("a").unwrap();

        let observations = Arc::new(Mutex::new(Vec::new()));
        manager
            .install_for_test(
                descriptor("probe", &["a"], &[]),
                Box::new(ProbingUnit {
                    target: "a",
                    observations: observations.clone(),
                    context: None,
                }),
            )
            .unwrap();
        manager.enable("probe").unwrap();
        manager.reload("probe").unwrap();
        manager.disable("probe").unwrap();

        // Every hook observed its enabled dependency, and its own state is
        // visible mid-transition (absent during on_load, since the
        // container is installed only after the hook returns).
        assert_eq!(
            *observations.lock(),
            vec![
                ("load", Some(UnitState::Enabled), true, None),
                ("enable", Some(UnitState::Enabled), true, Some(UnitState::Enabling)),
                ("reload", Some(UnitState::Enabled), true, Some(UnitState::Enabled)),
                ("disable", Some(UnitState::Enabled), true, Some(UnitState::Disabling)),
            ]
        );
    }

    #[test]
    fn enable_is_rejected_outside_loaded_or_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap();
        manager.enable("a").unwrap();

        let err = manager.enable("a").unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidState {
                operation: "enable",
                state: UnitState::Enabled,
                ..
            }
        ));

        assert!(matches!(
            manager.enable("ghost").unwrap_err(),
            CoreError::UnknownUnit { .. }
        ));
    }

    #[test]
    fn enable_failure_marks_unit_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        manager
            .install_for_test(
                descriptor("a", &[], &[]),
                Box::new(TestUnit::new("a", events()).failing_enable()),
            )
            .unwrap();

        let err = manager.enable("a").unwrap_err();
        assert!(matches!(err, CoreError::Enable { .. }));
        assert_eq!(manager.state("a"), Some(UnitState::Failed));

        // Failed is terminal until unload.
        assert!(matches!(
            manager.enable("a").unwrap_err(),
            CoreError::InvalidState { .. }
        ));
        manager.unload("a").unwrap();
        assert_eq!(manager.state("a"), None);
    }

    #[test]
    fn disable_error_still_lands_in_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(
                descriptor("a", &[], &[]),
                Box::new(TestUnit::new("a", log.clone()).failing_disable()),
            )
            .unwrap();
        manager.enable("a").unwrap();

        manager.disable("a").unwrap();
        assert_eq!(manager.state("a"), Some(UnitState::Disabled));
    }

    #[test]
    fn load_requires_hard_dependencies_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        let err = manager
            .install_for_test(
                descriptor("b", &["a"], &[]),
                Box::new(TestUnit::new("b", events())),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::Dependency { .. }));
        assert_eq!(manager.state("b"), None);

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap();
        manager
            .install_for_test(
                descriptor("b", &["a"], &[]),
                Box::new(TestUnit::new("b", events())),
            )
            .unwrap();
        assert!(manager.is_loaded("b"));
    }

    #[test]
    fn duplicate_load_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap();
        let err = manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap_err();
        assert!(matches!(err, CoreError::Load { .. }));
    }

    #[test]
    fn failed_on_load_leaves_no_container() {
        struct BrokenUnit;
        impl Unit for BrokenUnit {
            fn on_load(&mut self, _: Arc<UnitContext>) -> std::result::Result<(), BoxedError> {
                Err("corrupt data".into())
            }
            fn on_enable(&mut self) -> std::result::Result<(), BoxedError> {
                Ok(())
            }
            fn on_disable(&mut self) -> std::result::Result<(), BoxedError> {
                Ok(())
            }
            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let (manager, _, budget) = fixture(dir.path());

        let err = manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(BrokenUnit))
            .unwrap_err();
        assert!(matches!(err, CoreError::Load { .. }));
        assert_eq!(manager.state("a"), None);
        assert!(manager.loaded_ids().is_empty());
        assert!(budget.unit_stats("a").is_none());
    }

    #[test]
    fn unload_disables_active_unit_and_cancels_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, scheduler, budget) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", log.clone())))
            .unwrap();
        manager.enable("a").unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        scheduler.run_task_timer("a", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }, 0, 1);

        manager.unload("a").unwrap();
        assert_eq!(manager.state("a"), None);
        assert!(budget.unit_stats("a").is_none());

        let seen: Vec<&'static str> = log.lock().iter().map(|(_, e)| *e).collect();
        assert_eq!(seen, vec!["load", "enable", "disable"]);

        scheduler.run_tick();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unload_all_runs_in_reverse_load_order() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", log.clone())))
            .unwrap();
        manager
            .install_for_test(
                descriptor("b", &["a"], &[]),
                Box::new(TestUnit::new("b", log.clone())),
            )
            .unwrap();
        manager.enable("a").unwrap();
        manager.enable("b").unwrap();

        manager.unload_all();
        assert_eq!(manager.count(), 0);

        let disables: Vec<String> = log
            .lock()
            .iter()
            .filter(|(_, e)| *e == "disable")
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(disables, vec!["b", "a"]);
    }

    #[test]
    fn reload_refused_without_support() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(
                descriptor("a", &[], &[]),
                Box::new(TestUnit::new("a", log.clone()).without_reload()),
            )
            .unwrap();
        manager.enable("a").unwrap();

        assert!(matches!(
            manager.reload("a").unwrap_err(),
            CoreError::Reload { .. }
        ));
    }

    #[test]
    fn reload_all_touches_only_enabled_supporting_units() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", log.clone())))
            .unwrap();
        manager
            .install_for_test(
                descriptor("b", &[], &[]),
                Box::new(TestUnit::new("b", log.clone()).without_reload()),
            )
            .unwrap();
        manager
            .install_for_test(descriptor("c", &[], &[]), Box::new(TestUnit::new("c", log.clone())))
            .unwrap();
        manager.enable("a").unwrap();
        manager.enable("b").unwrap();
        // c stays Loaded, never enabled.

        manager.reload_all();

        let reloads: Vec<String> = log
            .lock()
            .iter()
            .filter(|(_, e)| *e == "reload")
            .map(|(id, _)| id.clone())
            .collect();
        assert_eq!(reloads, vec!["a"]);
    }

    #[test]
    fn disable_and_unload_do_not_cascade_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", log.clone())))
            .unwrap();
        manager
            .install_for_test(
                descriptor("b", &["a"], &[]),
                Box::new(TestUnit::new("b", log.clone())),
            )
            .unwrap();
        manager.enable("a").unwrap();
        manager.enable("b").unwrap();

        // The core neither refuses nor cascades; dependents are expected to
        // notice on their own.
        manager.disable("a").unwrap();
        assert!(manager.is_enabled("b"));

        manager.unload("a").unwrap();
        assert!(manager.is_enabled("b"));
        assert_eq!(manager.state("a"), None);
    }

    #[test]
    fn context_gives_units_scoped_services() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());
        let log = events();

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", log.clone())))
            .unwrap();
        manager
            .install_for_test(
                descriptor("b", &["a"], &[]),
                Box::new(TestUnit::new("b", log.clone())),
            )
            .unwrap();
        manager.enable("a").unwrap();

        // The data directory was created under modules/<id>/.
        assert!(dir.path().join("modules").join("a").is_dir());

        manager
            .with_unit::<TestUnit, _>("b", |unit| {
                let context = unit.context.as_ref().expect("context captured on load");
                assert_eq!(context.unit_id(), "b");
                assert!(context.is_unit_enabled("a"));
                assert_eq!(context.unit_state("a"), Some(UnitState::Enabled));
                assert!(!context.is_unit_enabled("missing"));
            })
            .expect("unit b present");

        manager.disable("a").unwrap();
        manager
            .with_unit::<TestUnit, _>("b", |unit| {
                let context = unit.context.as_ref().expect("context captured on load");
                assert!(!context.is_unit_enabled("a"));
            })
            .expect("unit b present");
    }

    #[test]
    fn with_unit_downcasts_by_type() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap();

        let name = manager.with_unit::<TestUnit, _>("a", |unit| unit.name.clone());
        assert_eq!(name, Some("a".to_string()));
        assert!(manager.with_unit::<TestUnit, _>("missing", |_| ()).is_none());
    }

    #[test]
    fn list_reports_load_order_and_states() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = fixture(dir.path());

        manager
            .install_for_test(descriptor("a", &[], &[]), Box::new(TestUnit::new("a", events())))
            .unwrap();
        manager
            .install_for_test(descriptor("b", &[], &[]), Box::new(TestUnit::new("b", events())))
            .unwrap();
        manager.enable("b").unwrap();

        let infos = manager.list();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "a");
        assert_eq!(infos[0].state, UnitState::Loaded);
        assert_eq!(infos[1].id, "b");
        assert_eq!(infos[1].state, UnitState::Enabled);
        assert_eq!(manager.enabled_ids(), vec!["b"]);
    }

    #[test]
    fn resolution_orders_hard_dependencies_first() {
        // Deliberately shuffled input.
        let input = vec![
            descriptor("c", &["b"], &[]),
            descriptor("a", &[], &[]),
            descriptor("b", &["a"], &[]),
        ];
        let order: Vec<String> = resolve_load_order(input)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn resolution_excludes_missing_dependency_dependents() {
        let input = vec![
            descriptor("a", &[], &[]),
            descriptor("b", &["a"], &[]),
            descriptor("c", &["d_missing"], &[]),
        ];
        let order: Vec<String> = resolve_load_order(input)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn resolution_excludes_transitively() {
        let input = vec![
            descriptor("c", &["missing"], &[]),
            descriptor("d", &["c"], &[]),
            descriptor("e", &["d"], &[]),
            descriptor("a", &[], &[]),
        ];
        let order: Vec<String> = resolve_load_order(input)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(order, vec!["a"]);
    }

    #[test]
    fn resolution_excludes_cycles_but_keeps_the_rest() {
        let input = vec![
            descriptor("a", &["b"], &[]),
            descriptor("b", &["a"], &[]),
            descriptor("c", &[], &[]),
        ];
        let order: Vec<String> = resolve_load_order(input)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(order, vec!["c"]);
    }

    #[test]
    fn soft_dependencies_order_but_do_not_gate() {
        let input = vec![
            descriptor("b", &[], &["a"]),
            descriptor("a", &[], &[]),
        ];
        let order: Vec<String> = resolve_load_order(input)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(order, vec!["a", "b"]);

        // A missing soft dependency never excludes the unit.
        let input = vec![descriptor("b", &[], &["ghost"])];
        let order: Vec<String> = resolve_load_order(input)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(order, vec!["b"]);
    }
}
