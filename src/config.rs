//! Typed configuration store with validation, persistence and hot reload.
//!
//! Each registered config owns one `<id>.properties` file under the config
//! directory. Values are immutable snapshots swapped atomically on reload;
//! readers always observe either the old or the new value, never a partial
//! one. A background thread watches the directory and reloads changed files
//! after a short debounce. If the watcher cannot start, hot reload degrades
//! to off and the manual `reload*` calls still work.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::properties::Properties;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Contract the store demands of a typed configuration.
///
/// Implementations need a zero-state `Default`, absorb and emit flat
/// properties, and report validation problems as human-readable messages.
/// Types that evolve their key set bump `schema_version` and translate old
/// files in `migrate`; a migration failure is treated as a validation
/// failure and leaves the registered value untouched.
pub trait ConfigData: Any + Send + Sync {
    /// Absorb values from properties, falling back to defaults per field.
    fn load(&mut self, props: &Properties);

    /// Emit all fields into properties.
    fn save(&self, props: &mut Properties);

    /// Validate the current field values.
    fn validate(&self) -> Vec<String> {
        Vec::new()
    }

    /// Current schema version of this type.
    fn schema_version(&self) -> u32 {
        1
    }

    /// Translate properties written by an older schema version.
    fn migrate(
        &self,
        _from_version: u32,
        props: Properties,
    ) -> std::result::Result<Properties, String> {
        Ok(props)
    }
}

type ErasedValue = Arc<dyn Any + Send + Sync>;
type LoadFn = Box<dyn Fn(&Properties) -> Result<ErasedValue> + Send + Sync>;
type ListenerFn = Box<dyn Fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) + Send + Sync>;

struct Holder {
    path: PathBuf,
    type_id: TypeId,
    value: RwLock<ErasedValue>,
    load_fresh: LoadFn,
}

/// Build the type-erased loader used for both registration and reload.
fn make_loader<T: ConfigData + Default>(id: String) -> LoadFn {
    Box::new(move |props: &Properties| {
        let mut value = T::default();
        let file_version = props.get_u32("schema_version", 1);
        let migrated;
        let effective = if file_version < value.schema_version() {
            migrated = value.migrate(file_version, props.clone()).map_err(|e| {
                CoreError::Validation {
                    id: id.clone(),
                    errors: vec![format!(
                        "schema migration from version {file_version} failed: {e}"
                    )],
                }
            })?;
            &migrated
        } else {
            props
        };
        value.load(effective);
        let errors = value.validate();
        if !errors.is_empty() {
            return Err(CoreError::Validation {
                id: id.clone(),
                errors,
            });
        }
        Ok(Arc::new(value) as ErasedValue)
    })
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Registry of typed configurations backed by the config directory.
pub struct ConfigStore {
    config_dir: PathBuf,
    holders: RwLock<HashMap<String, Arc<Holder>>>,
    listeners: RwLock<HashMap<String, Vec<ListenerFn>>>,
    initialized: AtomicBool,
    /// Last mtime seen per config id. Seeded at registration so the
    /// watcher only reacts to edits made after a config exists.
    watch_baseline: Mutex<HashMap<String, SystemTime>>,
    watcher_running: Arc<AtomicBool>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    debounce: Duration,
}

impl ConfigStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            holders: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            watch_baseline: Mutex::new(HashMap::new()),
            watcher_running: Arc::new(AtomicBool::new(false)),
            watcher_thread: Mutex::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: RELOAD_DEBOUNCE,
        }
    }

    #[cfg(test)]
    fn with_poll_interval(config_dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        let mut store = Self::new(config_dir);
        store.poll_interval = poll_interval;
        store
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Create the config directory and start the file watcher. Idempotent.
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        std::fs::create_dir_all(&self.config_dir)?;
        self.start_watcher();
        Ok(())
    }

    /// Stop the watcher and drop all holders and listeners. Idempotent.
    pub fn shutdown(&self) {
        if self
            .initialized
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.watcher_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.watcher_thread.lock().take() {
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
        self.holders.write().clear();
        self.listeners.write().clear();
        self.watch_baseline.lock().clear();
    }

    /// Register a typed config under `id`, loading `<id>.properties` when it
    /// exists and writing the default value to disk when it does not.
    ///
    /// Validation failure of on-disk content leaves the id unregistered and
    /// returns the error list.
    pub fn register<T: ConfigData + Default + Clone>(
        &self,
        id: &str,
        default_value: T,
    ) -> Result<T> {
        let path = self.config_dir.join(format!("{id}.properties"));
        let loader = make_loader::<T>(id.to_string());

        let (erased, value): (ErasedValue, T) = if path.exists() {
            let props = Properties::load_file(&path).map_err(|e| CoreError::Configuration {
                id: id.to_string(),
                detail: format!("failed to read {}: {e}", path.display()),
            })?;
            let erased = loader(&props)?;
            let value = erased
                .clone()
                .downcast::<T>()
                .map(|arc| (*arc).clone())
                .map_err(|_| CoreError::TypeMismatch { id: id.to_string() })?;
            (erased, value)
        } else {
            let errors = default_value.validate();
            if !errors.is_empty() {
                return Err(CoreError::Validation {
                    id: id.to_string(),
                    errors,
                });
            }
            let mut props = Properties::new();
            default_value.save(&mut props);
            props
                .save_file(&path, &format!("vanadium configuration - {id}"))
                .map_err(|e| CoreError::Configuration {
                    id: id.to_string(),
                    detail: format!("failed to write {}: {e}", path.display()),
                })?;
            (Arc::new(default_value.clone()), default_value)
        };

        if let Some(mtime) = file_mtime(&path) {
            self.watch_baseline.lock().insert(id.to_string(), mtime);
        }
        self.holders.write().insert(
            id.to_string(),
            Arc::new(Holder {
                path,
                type_id: TypeId::of::<T>(),
                value: RwLock::new(erased),
                load_fresh: loader,
            }),
        );
        debug!(config = id, "configuration registered");
        Ok(value)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.holders.read().contains_key(id)
    }

    /// Current value of a registered config.
    pub fn get<T: ConfigData + Clone>(&self, id: &str) -> Result<T> {
        let holder = self.holder(id)?;
        if holder.type_id != TypeId::of::<T>() {
            return Err(CoreError::TypeMismatch { id: id.to_string() });
        }
        let erased = holder.value.read().clone();
        erased
            .downcast::<T>()
            .map(|arc| (*arc).clone())
            .map_err(|_| CoreError::TypeMismatch { id: id.to_string() })
    }

    /// Re-parse the file, validate, swap the value, notify listeners.
    /// The holder is unchanged when parsing or validation fails.
    pub fn reload(&self, id: &str) -> Result<()> {
        let holder = self.holder(id)?;
        let props = Properties::load_file(&holder.path).map_err(|e| CoreError::Configuration {
            id: id.to_string(),
            detail: format!("failed to read {}: {e}", holder.path.display()),
        })?;
        let fresh = (holder.load_fresh)(&props)?;

        let old = {
            let mut guard = holder.value.write();
            std::mem::replace(&mut *guard, fresh.clone())
        };

        self.notify_listeners(id, &*old, &*fresh);
        info!(config = id, "configuration reloaded");
        Ok(())
    }

    /// Best-effort reload of every registered id.
    pub fn reload_all(&self) {
        let ids: Vec<String> = self.holders.read().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.reload(&id) {
                warn!(config = %id, error = %e, "reload failed");
            }
        }
    }

    /// Persist `value` to disk and install it as the current value.
    pub fn save<T: ConfigData + Clone>(&self, id: &str, value: &T) -> Result<()> {
        let holder = self.holder(id)?;
        if holder.type_id != TypeId::of::<T>() {
            return Err(CoreError::TypeMismatch { id: id.to_string() });
        }
        let mut props = Properties::new();
        value.save(&mut props);
        props
            .save_file(&holder.path, &format!("vanadium configuration - {id}"))
            .map_err(|e| CoreError::Configuration {
                id: id.to_string(),
                detail: format!("failed to write {}: {e}", holder.path.display()),
            })?;
        *holder.value.write() = Arc::new(value.clone());
        // Our own write is not an external edit; keep the watcher quiet.
        if let Some(mtime) = file_mtime(&holder.path) {
            self.watch_baseline.lock().insert(id.to_string(), mtime);
        }
        Ok(())
    }

    /// Register a listener invoked with (old, new) after each successful
    /// reload of `id`. Listener panics are contained and logged.
    pub fn add_reload_listener<T, F>(&self, id: &str, listener: F)
    where
        T: ConfigData,
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let erased: ListenerFn = Box::new(move |old, new| {
            if let (Some(old), Some(new)) = (old.downcast_ref::<T>(), new.downcast_ref::<T>()) {
                listener(old, new);
            }
        });
        self.listeners
            .write()
            .entry(id.to_string())
            .or_default()
            .push(erased);
    }

    fn holder(&self, id: &str) -> Result<Arc<Holder>> {
        self.holders
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotRegistered { id: id.to_string() })
    }

    fn notify_listeners(
        &self,
        id: &str,
        old: &(dyn Any + Send + Sync),
        new: &(dyn Any + Send + Sync),
    ) {
        let listeners = self.listeners.read();
        if let Some(for_id) = listeners.get(id) {
            for listener in for_id {
                if catch_unwind(AssertUnwindSafe(|| listener(old, new))).is_err() {
                    warn!(config = id, "config reload listener panicked");
                }
            }
        }
    }

    fn watched_paths(&self) -> Vec<(String, PathBuf)> {
        self.holders
            .read()
            .iter()
            .map(|(id, holder)| (id.clone(), holder.path.clone()))
            .collect()
    }

    fn start_watcher(self: &Arc<Self>) {
        let store = Arc::downgrade(self);
        let running = self.watcher_running.clone();
        running.store(true, Ordering::SeqCst);
        let poll_interval = self.poll_interval;
        let debounce = self.debounce;

        let thread_running = running.clone();
        let spawned = std::thread::Builder::new()
            .name("vanadium-config-watch".to_string())
            .spawn(move || {
                while thread_running.load(Ordering::SeqCst) {
                    std::thread::sleep(poll_interval);
                    let Some(store) = store.upgrade() else { break };
                    let mut changed = Vec::new();
                    {
                        let mut baseline = store.watch_baseline.lock();
                        for (id, path) in store.watched_paths() {
                            let Some(mtime) = file_mtime(&path) else { continue };
                            match baseline.get(&id) {
                                Some(previous) if *previous != mtime => {
                                    baseline.insert(id.clone(), mtime);
                                    changed.push(id);
                                }
                                // Registered without a baseline: record it
                                // without reloading.
                                None => {
                                    baseline.insert(id, mtime);
                                }
                                _ => {}
                            }
                        }
                    }
                    if !changed.is_empty() {
                        std::thread::sleep(debounce);
                        for id in changed {
                            if let Err(e) = store.reload(&id) {
                                warn!(config = %id, error = %e, "hot reload rejected");
                            }
                        }
                    }
                }
            });

        match spawned {
            Ok(handle) => *self.watcher_thread.lock() = Some(handle),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                warn!(error = %e, "config watcher unavailable; hot reload disabled");
            }
        }
    }
}

impl Drop for ConfigStore {
    fn drop(&mut self) {
        self.watcher_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.watcher_thread.lock().take() {
            // The watcher can hold the final strong reference; it must not
            // join itself.
            if std::thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }
}

/// Accumulates human-readable validation failures.
#[derive(Debug, Default)]
pub struct ValidationErrors {
    errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_range_u64(mut self, field: &str, value: u64, min: u64, max: u64) -> Self {
        if value < min || value > max {
            self.errors
                .push(format!("{field} must be between {min} and {max}"));
        }
        self
    }

    pub fn require_range_i64(mut self, field: &str, value: i64, min: i64, max: i64) -> Self {
        if value < min || value > max {
            self.errors
                .push(format!("{field} must be between {min} and {max}"));
        }
        self
    }

    pub fn require_positive(mut self, field: &str, value: i64) -> Self {
        if value <= 0 {
            self.errors.push(format!("{field} must be positive"));
        }
        self
    }

    pub fn require_not_blank(mut self, field: &str, value: &str) -> Self {
        if value.trim().is_empty() {
            self.errors.push(format!("{field} cannot be blank"));
        }
        self
    }

    pub fn require_one_of(mut self, field: &str, value: &str, allowed: &[&str]) -> Self {
        if !allowed.contains(&value) {
            self.errors
                .push(format!("{field} must be one of {allowed:?}"));
        }
        self
    }

    pub fn check(mut self, message: &str, ok: bool) -> Self {
        if !ok {
            self.errors.push(message.to_string());
        }
        self
    }

    pub fn build(self) -> Vec<String> {
        self.errors
    }
}

/// Runtime-level configuration, registered by the lifecycle under `"core"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Global per-tick budget in milliseconds.
    pub tick_budget_ms: u64,
    /// Default per-unit per-tick budget in milliseconds.
    pub default_unit_budget_ms: u64,
    pub metrics_enabled: bool,
    pub metrics_export_interval_seconds: u64,
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: 45,
            default_unit_budget_ms: 10,
            metrics_enabled: true,
            metrics_export_interval_seconds: 60,
            log_level: "info".to_string(),
        }
    }
}

impl ConfigData for CoreConfig {
    fn load(&mut self, props: &Properties) {
        self.tick_budget_ms = props.get_u64("tick_budget_ms", 45);
        self.default_unit_budget_ms = props.get_u64("default_unit_budget_ms", 10);
        self.metrics_enabled = props.get_bool("metrics_enabled", true);
        self.metrics_export_interval_seconds =
            props.get_u64("metrics_export_interval_seconds", 60);
        self.log_level = props.get_string("log_level", "info");
    }

    fn save(&self, props: &mut Properties) {
        props.set_u64("tick_budget_ms", self.tick_budget_ms);
        props.set_u64("default_unit_budget_ms", self.default_unit_budget_ms);
        props.set_bool("metrics_enabled", self.metrics_enabled);
        props.set_u64(
            "metrics_export_interval_seconds",
            self.metrics_export_interval_seconds,
        );
        props.set_string("log_level", &self.log_level);
    }

    fn validate(&self) -> Vec<String> {
        ValidationErrors::new()
            .require_range_u64("tick_budget_ms", self.tick_budget_ms, 1, 100)
            .require_range_u64(
                "default_unit_budget_ms",
                self.default_unit_budget_ms,
                1,
                50,
            )
            .require_range_u64(
                "metrics_export_interval_seconds",
                self.metrics_export_interval_seconds,
                1,
                3600,
            )
            .require_one_of(
                "log_level",
                &self.log_level,
                &["trace", "debug", "info", "warn", "error"],
            )
            .build()
    }
}
