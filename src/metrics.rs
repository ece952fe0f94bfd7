//! Central registry for runtime metrics and tick instrumentation.
//!
//! Counters and gauges are plain atomics so recording is wait-free;
//! histograms and timers take a small lock because count/sum/min/max must
//! stay jointly consistent. The tick ring keeps the last minute of tick
//! durations (1200 samples at 20 Hz) for rolling statistics.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tracing::{debug, warn};

use crate::error::BoxedError;

/// Number of tick durations retained for rolling statistics.
const TICK_HISTORY_SIZE: usize = 1200;
/// Memory gauges are refreshed every this many recorded ticks.
const MEMORY_SAMPLE_INTERVAL_TICKS: u64 = 20;
/// Bounded window of retained overrun records.
const MAX_OVERRUN_RECORDS: usize = 100;

/// Monotonically non-decreasing 64-bit counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Latest-value gauge storing a double.
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
struct HistogramInner {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// Value distribution tracking count, mean, min and max.
#[derive(Debug, Default)]
pub struct Histogram {
    inner: Mutex<HistogramInner>,
}

impl Histogram {
    pub fn record(&self, value: f64) {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            inner.min = value;
            inner.max = value;
        } else {
            inner.min = inner.min.min(value);
            inner.max = inner.max.max(value);
        }
        inner.count += 1;
        inner.sum += value;
    }

    pub fn stats(&self) -> HistogramStats {
        let inner = self.inner.lock();
        HistogramStats {
            count: inner.count,
            mean: if inner.count > 0 {
                inner.sum / inner.count as f64
            } else {
                0.0
            },
            min: inner.min,
            max: inner.max,
        }
    }
}

#[derive(Debug, Default)]
struct TimerInner {
    count: u64,
    total_nanos: u64,
    min_nanos: u64,
    max_nanos: u64,
}

/// Duration distribution in nanoseconds.
#[derive(Debug, Default)]
pub struct Timer {
    inner: Mutex<TimerInner>,
}

impl Timer {
    pub fn record(&self, nanos: u64) {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            inner.min_nanos = nanos;
            inner.max_nanos = nanos;
        } else {
            inner.min_nanos = inner.min_nanos.min(nanos);
            inner.max_nanos = inner.max_nanos.max(nanos);
        }
        inner.count += 1;
        inner.total_nanos += nanos;
    }

    pub fn stats(&self) -> TimerStats {
        let inner = self.inner.lock();
        TimerStats {
            count: inner.count,
            mean_nanos: if inner.count > 0 {
                inner.total_nanos as f64 / inner.count as f64
            } else {
                0.0
            },
            min_nanos: inner.min_nanos,
            max_nanos: inner.max_nanos,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramStats {
    pub count: u64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimerStats {
    pub count: u64,
    pub mean_nanos: f64,
    pub min_nanos: u64,
    pub max_nanos: u64,
}

/// Rolling tick-duration statistics over the valid prefix of the ring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickStats {
    pub mean_nanos: f64,
    pub min_nanos: u64,
    pub max_nanos: u64,
    pub p99_nanos: u64,
    pub total_ticks: u64,
}

/// One tick whose wall duration exceeded the tick period.
#[derive(Debug, Clone, Serialize)]
pub struct OverrunRecord {
    pub tick: u64,
    pub duration_nanos: u64,
    pub at: DateTime<Utc>,
}

/// Point-in-time memory usage sample.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemorySnapshot {
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub max_bytes: u64,
}

/// Serializable snapshot of every registered metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub at: DateTime<Utc>,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramStats>,
    pub timers: BTreeMap<String, TimerStats>,
}

/// Sink receiving metric snapshots from [`MetricsRegistry::export_to_all`].
pub trait MetricsExporter: Send + Sync {
    fn name(&self) -> &str;

    fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), BoxedError>;
}

/// Exporter that logs a one-line summary of the snapshot.
pub struct LogExporter;

impl MetricsExporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), BoxedError> {
        debug!(
            counters = snapshot.counters.len(),
            gauges = snapshot.gauges.len(),
            histograms = snapshot.histograms.len(),
            timers = snapshot.timers.len(),
            "metrics export"
        );
        Ok(())
    }
}

/// Exporter that writes the snapshot as pretty JSON to a fixed path.
pub struct JsonFileExporter {
    path: PathBuf,
}

impl JsonFileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetricsExporter for JsonFileExporter {
    fn name(&self) -> &str {
        "json-file"
    }

    fn export(&self, snapshot: &MetricsSnapshot) -> Result<(), BoxedError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Registry of named metrics plus tick instrumentation.
///
/// Factories return the same handle on repeated calls for the same name;
/// handles are created on first reference. All recording paths are
/// infallible.
pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    timers: RwLock<HashMap<String, Arc<Timer>>>,

    tick_ring: Vec<AtomicU64>,
    tick_index: AtomicU64,
    total_ticks: AtomicU64,

    overruns: Mutex<VecDeque<OverrunRecord>>,
    exporters: Mutex<Vec<Box<dyn MetricsExporter>>>,
    system: Mutex<System>,
    last_memory: Mutex<Option<MemorySnapshot>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut tick_ring = Vec::with_capacity(TICK_HISTORY_SIZE);
        tick_ring.resize_with(TICK_HISTORY_SIZE, AtomicU64::default);
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            timers: RwLock::new(HashMap::new()),
            tick_ring,
            tick_index: AtomicU64::new(0),
            total_ticks: AtomicU64::new(0),
            overruns: Mutex::new(VecDeque::with_capacity(MAX_OVERRUN_RECORDS)),
            exporters: Mutex::new(Vec::new()),
            system: Mutex::new(System::new()),
            last_memory: Mutex::new(None),
        }
    }

    /// Prime the memory gauges with an initial sample.
    pub fn initialize(&self) {
        self.sample_memory();
    }

    /// Drop all handles and exporters.
    pub fn shutdown(&self) {
        self.counters.write().clear();
        self.gauges.write().clear();
        self.histograms.write().clear();
        self.timers.write().clear();
        self.exporters.lock().clear();
    }

    pub fn counter(&self, name: &str) -> Arc<Counter> {
        if let Some(c) = self.counters.read().get(name) {
            return c.clone();
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        if let Some(g) = self.gauges.read().get(name) {
            return g.clone();
        }
        self.gauges
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        if let Some(h) = self.histograms.read().get(name) {
            return h.clone();
        }
        self.histograms
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn timer(&self, name: &str) -> Arc<Timer> {
        if let Some(t) = self.timers.read().get(name) {
            return t.clone();
        }
        self.timers
            .write()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Record one tick's wall duration into the ring and the
    /// `tick.duration` histogram (milliseconds).
    pub fn record_tick_duration(&self, nanos: u64) {
        let index = self.tick_index.fetch_add(1, Ordering::Relaxed) as usize % TICK_HISTORY_SIZE;
        self.tick_ring[index].store(nanos, Ordering::Relaxed);
        let total = self.total_ticks.fetch_add(1, Ordering::Relaxed) + 1;

        self.histogram("tick.duration").record(nanos as f64 / 1_000_000.0);

        if total % MEMORY_SAMPLE_INTERVAL_TICKS == 0 {
            self.sample_memory();
        }
    }

    /// Record an overrun; the window keeps the most recent 100 records.
    pub fn record_tick_overrun(&self, tick: u64, duration_nanos: u64) {
        let mut overruns = self.overruns.lock();
        overruns.push_back(OverrunRecord {
            tick,
            duration_nanos,
            at: Utc::now(),
        });
        while overruns.len() > MAX_OVERRUN_RECORDS {
            overruns.pop_front();
        }
        drop(overruns);
        self.counter("tick.overruns").increment();
    }

    /// Record a task execution against its owner's timer (`task.<owner>`).
    pub fn record_task_execution(&self, owner: &str, nanos: u64) {
        self.timer(&format!("task.{owner}")).record(nanos);
    }

    /// Record unit execution time against `unit.<id>`.
    pub fn record_unit_execution(&self, unit_id: &str, nanos: u64) {
        self.timer(&format!("unit.{unit_id}")).record(nanos);
    }

    /// Refresh the memory gauges from the OS.
    pub fn sample_memory(&self) {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let pid = Pid::from_u32(std::process::id());
        sys.refresh_process(pid);

        let snapshot = MemorySnapshot {
            used_bytes: sys.process(pid).map(|p| p.memory()).unwrap_or(0),
            free_bytes: sys.available_memory(),
            max_bytes: sys.total_memory(),
        };
        drop(sys);

        self.gauge("memory.used").set(snapshot.used_bytes as f64);
        self.gauge("memory.free").set(snapshot.free_bytes as f64);
        self.gauge("memory.max").set(snapshot.max_bytes as f64);
        *self.last_memory.lock() = Some(snapshot);
    }

    pub fn memory_snapshot(&self) -> Option<MemorySnapshot> {
        *self.last_memory.lock()
    }

    /// Statistics over the valid prefix of the tick ring. The p99 comes
    /// from a full sort of that prefix: at 1,200 samples simplicity wins.
    pub fn tick_stats(&self) -> TickStats {
        let total = self.total_ticks.load(Ordering::Relaxed);
        let count = total.min(TICK_HISTORY_SIZE as u64) as usize;
        if count == 0 {
            return TickStats {
                mean_nanos: 0.0,
                min_nanos: 0,
                max_nanos: 0,
                p99_nanos: 0,
                total_ticks: 0,
            };
        }

        let mut samples = Vec::with_capacity(count);
        let mut sum: u128 = 0;
        let mut min = u64::MAX;
        let mut max = 0_u64;
        for slot in self.tick_ring.iter().take(count) {
            let value = slot.load(Ordering::Relaxed);
            sum += u128::from(value);
            min = min.min(value);
            max = max.max(value);
            samples.push(value);
        }

        samples.sort_unstable();
        let p99 = samples[(count as f64 * 0.99) as usize];

        TickStats {
            mean_nanos: sum as f64 / count as f64,
            min_nanos: min,
            max_nanos: max,
            p99_nanos: p99,
            total_ticks: total,
        }
    }

    pub fn recent_overruns(&self) -> Vec<OverrunRecord> {
        self.overruns.lock().iter().cloned().collect()
    }

    /// Snapshot every metric for export.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.get()))
            .collect();
        let gauges = self
            .gauges
            .read()
            .iter()
            .map(|(name, g)| (name.clone(), g.get()))
            .collect();
        let histograms = self
            .histograms
            .read()
            .iter()
            .map(|(name, h)| (name.clone(), h.stats()))
            .collect();
        let timers = self
            .timers
            .read()
            .iter()
            .map(|(name, t)| (name.clone(), t.stats()))
            .collect();

        MetricsSnapshot {
            at: Utc::now(),
            counters,
            gauges,
            histograms,
            timers,
        }
    }

    pub fn add_exporter(&self, exporter: Box<dyn MetricsExporter>) {
        self.exporters.lock().push(exporter);
    }

    /// Snapshot once and feed every registered exporter. A failing sink is
    /// logged and does not stop the others.
    pub fn export_to_all(&self) {
        let snapshot = self.snapshot();
        for exporter in self.exporters.lock().iter() {
            if let Err(e) = exporter.export(&snapshot) {
                warn!(exporter = exporter.name(), error = %e, "metrics exporter failed");
            }
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
