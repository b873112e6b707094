//! # Resource Monitor
//!
//! Samples host CPU, memory and disk usage on an interval and keeps a bounded
//! rolling history. Advisory only: nothing here throttles the scheduler. Job
//! bodies and the model manager consult it to decide whether to proceed,
//! degrade or defer.
//!
//! ## Key Features:
//! - Point-in-time [`ResourceSnapshot`] via `sample()`
//! - Periodic sampling loop (`start()` / `stop()`) with a fixed-size history
//! - Windowed min/avg/max via `statistics()`
//! - Callbacks invoked with every recorded snapshot
//! - Logs once whenever CPU or memory crosses into a new warning/critical band

use crate::config::MonitorConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use sysinfo::{Disks, System};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One measurement of the host.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_used: u64,
    pub memory_total: u64,
    pub memory_available: u64,
    pub disk_percent: f32,
    /// Not sampled on hosts without a supported GPU query
    pub gpu_memory_percent: Option<f32>,
    pub gpu_utilization: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct Aggregate {
    pub min: f32,
    pub avg: f32,
    pub max: f32,
}

impl Aggregate {
    fn of(values: impl Iterator<Item = f32>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0f32;
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (count > 0).then(|| Aggregate {
            min,
            avg: sum / count as f32,
            max,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceStatistics {
    pub window_secs: u64,
    pub samples: usize,
    pub cpu: Aggregate,
    pub memory: Aggregate,
    pub disk: Aggregate,
}

pub type SnapshotCallback = Arc<dyn Fn(&ResourceSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

impl PressureLevel {
    pub fn classify(value: f32, warning: f32, critical: f32) -> Self {
        if value >= critical {
            PressureLevel::Critical
        } else if value >= warning {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
    history_size: usize,
    interval: Duration,
    config: MonitorConfig,
    callbacks: RwLock<Vec<SnapshotCallback>>,
    /// Last reported (cpu, memory) bands, so each crossing is logged once
    levels: Mutex<(PressureLevel, PressureLevel)>,
    running: Mutex<Option<CancellationToken>>,
}

impl ResourceMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            system: Mutex::new(System::new()),
            history: Mutex::new(VecDeque::with_capacity(config.history_size)),
            history_size: config.history_size.max(1),
            interval: Duration::from_secs(config.sample_interval_secs.max(1)),
            config: config.clone(),
            callbacks: RwLock::new(Vec::new()),
            levels: Mutex::new((PressureLevel::Normal, PressureLevel::Normal)),
            running: Mutex::new(None),
        }
    }

    /// Override the sampling interval (sub-second intervals are handy in tests).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Measure the host right now. Does not touch the history.
    ///
    /// CPU usage is the delta since the previous call, so the very first sample
    /// after startup usually reads 0.
    pub fn sample(&self) -> ResourceSnapshot {
        let (cpu_percent, memory_total, memory_used, memory_available) = {
            let mut sys = lock(&self.system);
            sys.refresh_cpu_usage();
            sys.refresh_memory();
            (
                sys.global_cpu_usage(),
                sys.total_memory(),
                sys.used_memory(),
                sys.available_memory(),
            )
        };

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));

        ResourceSnapshot {
            timestamp: Utc::now(),
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_percent: percent(memory_used, memory_total),
            memory_used,
            memory_total,
            memory_available,
            disk_percent: percent(disk_total.saturating_sub(disk_available), disk_total),
            gpu_memory_percent: None,
            gpu_utilization: None,
        }
    }

    /// Start the periodic sampling loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut running = lock(&self.running);
        if running.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = monitor.sample();
                        monitor.record(snapshot);
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!("Resource sampling loop stopped");
        });
        info!(interval_ms = self.interval.as_millis() as u64, "Resource monitor started");
    }

    pub fn stop(&self) {
        if let Some(token) = lock(&self.running).take() {
            token.cancel();
            info!("Resource monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Append a snapshot to the history, fire callbacks and check thresholds.
    pub fn record(&self, snapshot: ResourceSnapshot) {
        {
            let mut history = lock(&self.history);
            while history.len() >= self.history_size {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }

        self.check_thresholds(&snapshot);

        let callbacks = self.callbacks.read().unwrap_or_else(|p| p.into_inner()).clone();
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    pub fn register_callback(&self, callback: SnapshotCallback) {
        self.callbacks
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(callback);
    }

    pub fn latest(&self) -> Option<ResourceSnapshot> {
        lock(&self.history).back().cloned()
    }

    pub fn history_len(&self) -> usize {
        lock(&self.history).len()
    }

    /// Min/avg/max over the snapshots recorded within `window`.
    ///
    /// `None` when no snapshot falls inside the window.
    pub fn statistics(&self, window: Duration) -> Option<ResourceStatistics> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or(chrono::Duration::days(3650));
        let history = lock(&self.history);
        let recent: Vec<&ResourceSnapshot> = history.iter().filter(|s| s.timestamp >= cutoff).collect();

        Some(ResourceStatistics {
            window_secs: window.as_secs(),
            samples: recent.len(),
            cpu: Aggregate::of(recent.iter().map(|s| s.cpu_percent))?,
            memory: Aggregate::of(recent.iter().map(|s| s.memory_percent))?,
            disk: Aggregate::of(recent.iter().map(|s| s.disk_percent))?,
        })
    }

    /// Whether the latest sample puts memory at or above the critical threshold.
    pub fn under_memory_pressure(&self) -> bool {
        self.latest()
            .map(|s| s.memory_percent >= self.config.memory_critical_percent)
            .unwrap_or(false)
    }

    fn check_thresholds(&self, snapshot: &ResourceSnapshot) {
        let cpu = PressureLevel::classify(
            snapshot.cpu_percent,
            self.config.cpu_warning_percent,
            self.config.cpu_critical_percent,
        );
        let memory = PressureLevel::classify(
            snapshot.memory_percent,
            self.config.memory_warning_percent,
            self.config.memory_critical_percent,
        );

        let mut levels = lock(&self.levels);
        if cpu != levels.0 {
            report("cpu", cpu, snapshot.cpu_percent);
        }
        if memory != levels.1 {
            report("memory", memory, snapshot.memory_percent);
        }
        *levels = (cpu, memory);
    }
}

fn report(resource: &str, level: PressureLevel, value: f32) {
    match level {
        PressureLevel::Critical => error!(resource, percent = value, "Resource usage critical"),
        PressureLevel::Warning => warn!(resource, percent = value, "Resource usage high"),
        PressureLevel::Normal => info!(resource, percent = value, "Resource usage back to normal"),
    }
}

fn percent(part: u64, whole: u64) -> f32 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64 * 100.0) as f32
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
