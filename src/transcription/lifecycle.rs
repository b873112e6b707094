//! # Model Lifecycle Manager
//!
//! Lazily loads one heavyweight model, shares it between concurrent jobs under
//! a reference count, and unloads it after it has sat unused for a while.
//!
//! ## State Machine:
//! ```text
//! Unloaded ──acquire──▶ Loading ──ok──▶ Loaded ──idle timeout, 0 refs──▶ Unloaded
//!                          └──error──▶ Unloaded
//! ```
//!
//! ## Key Rust Concepts:
//! - **Scoped acquisition**: `acquire()` returns a [`ModelLease`]; dropping it
//!   releases the reference. This covers every exit path, including a job being
//!   cancelled mid-`await`.
//! - **One lock for count and state**: the reference count and the
//!   loaded/unloaded state share one mutex, so the reaper can never unload a
//!   model between an `acquire` bumping the count and using the model.
//! - **Weak reaper**: the background reaper holds a `Weak` reference and stops
//!   on its own once the model is unloaded or the manager is dropped.

use crate::device::{DeviceManager, DevicePreference};
use crate::error::{AppError, AppResult};
use crate::monitor::ResourceMonitor;
use candle_core::Device;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Knows how to build the model on a given device.
pub trait ModelLoader: Send + Sync {
    type Model: Send + Sync + 'static;

    fn name(&self) -> String;

    fn load(&self, device: Device) -> BoxFuture<'_, anyhow::Result<Self::Model>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub state: ModelState,
    pub loaded: bool,
    pub reference_count: usize,
    pub idle_seconds: f64,
    pub device: Option<&'static str>,
    pub load_count: u64,
    pub last_error: Option<String>,
}

struct Slot<M> {
    state: ModelState,
    model: Option<Arc<M>>,
    device: Option<Device>,
    ref_count: usize,
    last_used: Instant,
    /// Bumped by force_release so leases from before it stop counting
    generation: u64,
    reaper_running: bool,
    load_count: u64,
    last_error: Option<String>,
}

type SharedSlot<M> = Arc<Mutex<Slot<M>>>;

fn lock<M>(slot: &Mutex<Slot<M>>) -> MutexGuard<'_, Slot<M>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Holds one reference; releases it on drop.
struct RefGuard<M> {
    slot: SharedSlot<M>,
    generation: u64,
}

impl<M> RefGuard<M> {
    /// Count this reference again if a force release happened since it was
    /// taken. Call with the slot locked.
    fn revalidate(&mut self, slot: &mut Slot<M>) {
        if self.generation != slot.generation {
            slot.ref_count += 1;
            slot.last_used = Instant::now();
            self.generation = slot.generation;
        }
    }
}

impl<M> Drop for RefGuard<M> {
    fn drop(&mut self) {
        let mut slot = lock(&self.slot);
        if slot.generation == self.generation {
            slot.ref_count = slot.ref_count.saturating_sub(1);
            slot.last_used = Instant::now();
        }
    }
}

/// A counted handle to the loaded model. Dereferences to the model.
pub struct ModelLease<M> {
    model: Arc<M>,
    _guard: RefGuard<M>,
}

impl<M> ModelLease<M> {
    /// A plain `Arc` to the model, for moving into `spawn_blocking`.
    ///
    /// The reference count is tied to the lease, not to this `Arc`; keep the
    /// lease alive until the work is done.
    pub fn shared(&self) -> Arc<M> {
        Arc::clone(&self.model)
    }

    /// Give the reference back now rather than at end of scope.
    pub fn release(self) {}
}

impl<M> Deref for ModelLease<M> {
    type Target = M;

    fn deref(&self) -> &M {
        &self.model
    }
}

pub struct ModelLifecycleManager<M: Send + Sync + 'static> {
    loader: Box<dyn ModelLoader<Model = M>>,
    preference: DevicePreference,
    idle_timeout: Duration,
    reaper_interval: Duration,
    monitor: Option<Arc<ResourceMonitor>>,
    slot: SharedSlot<M>,
    load_gate: tokio::sync::Mutex<()>,
}

impl<M: Send + Sync + 'static> ModelLifecycleManager<M> {
    pub fn new(
        loader: Box<dyn ModelLoader<Model = M>>,
        preference: DevicePreference,
        idle_timeout: Duration,
        reaper_interval: Duration,
    ) -> Self {
        Self {
            loader,
            preference,
            idle_timeout,
            reaper_interval,
            monitor: None,
            slot: Arc::new(Mutex::new(Slot {
                state: ModelState::Unloaded,
                model: None,
                device: None,
                ref_count: 0,
                last_used: Instant::now(),
                generation: 0,
                reaper_running: false,
                load_count: 0,
                last_error: None,
            })),
            load_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Consult this monitor before loading onto an accelerator.
    pub fn with_monitor(mut self, monitor: Arc<ResourceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Take a reference to the model, loading it first if needed.
    ///
    /// ## What this does:
    /// 1. Bumps the reference count (so the reaper keeps its hands off)
    /// 2. Returns straight away if the model is loaded
    /// 3. Otherwise loads it, one loader at a time: accelerated device first
    ///    unless memory is under pressure, CPU if that fails
    /// 4. Makes sure the idle reaper is running
    ///
    /// ## Returns:
    /// `AppError::ResourceExhausted` if the model cannot be loaded on any device.
    pub async fn acquire(self: &Arc<Self>) -> AppResult<ModelLease<M>> {
        let mut guard = {
            let mut slot = lock(&self.slot);
            slot.ref_count += 1;
            slot.last_used = Instant::now();
            RefGuard {
                slot: Arc::clone(&self.slot),
                generation: slot.generation,
            }
        };

        if let Some(model) = self.loaded_model() {
            self.ensure_reaper();
            return Ok(ModelLease { model, _guard: guard });
        }

        let _gate = self.load_gate.lock().await;
        {
            let mut slot = lock(&self.slot);
            if let Some(model) = slot.model.clone() {
                guard.revalidate(&mut slot);
                return Ok(ModelLease { model, _guard: guard });
            }
        }

        lock(&self.slot).state = ModelState::Loading;
        let name = self.loader.name();
        let allow_accelerated = !self
            .monitor
            .as_ref()
            .map(|m| m.under_memory_pressure())
            .unwrap_or(false);
        if !allow_accelerated {
            warn!(model = %name, "Memory pressure high, loading on CPU");
        }

        let device = DeviceManager::select(self.preference, allow_accelerated);
        info!(model = %name, device = DeviceManager::describe(&device), "Loading model");
        let started = Instant::now();

        let loaded = match self.loader.load(device.clone()).await {
            Ok(model) => Ok((model, device)),
            Err(e) if DeviceManager::is_accelerated(&device) => {
                warn!(model = %name, "Accelerated load failed ({:#}), retrying on CPU", e);
                self.loader.load(Device::Cpu).await.map(|model| (model, Device::Cpu))
            }
            Err(e) => Err(e),
        };

        let mut slot = lock(&self.slot);
        match loaded {
            Ok((model, device)) => {
                let model = Arc::new(model);
                info!(
                    model = %name,
                    device = DeviceManager::describe(&device),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Model loaded"
                );
                slot.model = Some(Arc::clone(&model));
                slot.device = Some(device);
                slot.state = ModelState::Loaded;
                slot.load_count += 1;
                slot.last_used = Instant::now();
                slot.last_error = None;
                guard.revalidate(&mut slot);
                drop(slot);
                self.ensure_reaper();
                Ok(ModelLease { model, _guard: guard })
            }
            Err(e) => {
                let message = format!("Failed to load model {}: {:#}", name, e);
                warn!("{}", message);
                slot.state = ModelState::Unloaded;
                slot.last_error = Some(message.clone());
                Err(AppError::ResourceExhausted(message))
            }
        }
    }

    /// Unload now, whatever the reference count.
    ///
    /// Outstanding leases keep their `Arc` to the old model alive until they
    /// drop, but no longer count. A load already in flight still completes and
    /// the lease it returns is counted against the new model.
    pub fn force_release(&self) -> bool {
        let mut slot = lock(&self.slot);
        let was_loaded = slot.model.is_some();
        slot.generation += 1;
        slot.ref_count = 0;
        slot.model = None;
        slot.device = None;
        if slot.state == ModelState::Loaded {
            slot.state = ModelState::Unloaded;
        }
        if was_loaded {
            info!(model = %self.loader.name(), "Model force-released");
        }
        was_loaded
    }

    pub fn status(&self) -> ModelStatus {
        let slot = lock(&self.slot);
        ModelStatus {
            name: self.loader.name(),
            state: slot.state,
            loaded: slot.model.is_some(),
            reference_count: slot.ref_count,
            idle_seconds: slot.last_used.elapsed().as_secs_f64(),
            device: slot.device.as_ref().map(DeviceManager::describe),
            load_count: slot.load_count,
            last_error: slot.last_error.clone(),
        }
    }

    fn loaded_model(&self) -> Option<Arc<M>> {
        lock(&self.slot).model.clone()
    }

    fn ensure_reaper(self: &Arc<Self>) {
        {
            let mut slot = lock(&self.slot);
            if slot.reaper_running || slot.state != ModelState::Loaded {
                return;
            }
            slot.reaper_running = true;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.reaper_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                if manager.reap_if_idle() {
                    break;
                }
            }
        });
        debug!(model = %self.loader.name(), "Idle reaper started");
    }

    /// One reaper tick. Returns `true` when the reaper should stop.
    fn reap_if_idle(&self) -> bool {
        let mut slot = lock(&self.slot);
        if slot.state != ModelState::Loaded {
            slot.reaper_running = false;
            return true;
        }
        if slot.ref_count == 0 && slot.last_used.elapsed() >= self.idle_timeout {
            slot.model = None;
            slot.device = None;
            slot.state = ModelState::Unloaded;
            slot.reaper_running = false;
            info!(
                model = %self.loader.name(),
                idle_secs = slot.last_used.elapsed().as_secs(),
                "Unloaded idle model"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::monitor::ResourceSnapshot;
    use futures_util::future::{join_all, FutureExt};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct FakeLoader {
        loads: Arc<AtomicU64>,
        fail: Arc<AtomicBool>,
        delay: Duration,
    }

    impl ModelLoader for FakeLoader {
        type Model = String;

        fn name(&self) -> String {
            "fake".to_string()
        }

        fn load(&self, device: Device) -> BoxFuture<'_, anyhow::Result<String>> {
            async move {
                tokio::time::sleep(self.delay).await;
                if self.fail.load(Ordering::SeqCst) {
                    anyhow::bail!("weights missing");
                }
                let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(format!("model#{} on {}", n, DeviceManager::describe(&device)))
            }
            .boxed()
        }
    }

    fn manager(idle: Duration) -> (Arc<ModelLifecycleManager<String>>, Arc<AtomicU64>, Arc<AtomicBool>) {
        let loads = Arc::new(AtomicU64::new(0));
        let fail = Arc::new(AtomicBool::new(false));
        let loader = FakeLoader {
            loads: loads.clone(),
            fail: fail.clone(),
            delay: Duration::from_millis(20),
        };
        let mgr = ModelLifecycleManager::new(
            Box::new(loader),
            DevicePreference::Cpu,
            idle,
            Duration::from_millis(10),
        );
        (Arc::new(mgr), loads, fail)
    }

    #[tokio::test]
    async fn test_lazy_load_and_sharing() {
        let (mgr, loads, _) = manager(Duration::from_secs(60));
        assert!(!mgr.status().loaded);

        let a = mgr.acquire().await.unwrap();
        let b = mgr.acquire().await.unwrap();
        assert_eq!(*a, "model#1 on cpu");
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.status().reference_count, 2);

        drop(a);
        b.release();
        assert_eq!(mgr.status().reference_count, 0);
        assert!(mgr.status().loaded);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_load_once() {
        let (mgr, loads, _) = manager(Duration::from_secs(60));
        let leases = join_all((0..5).map(|_| mgr.acquire())).await;
        assert!(leases.iter().all(|l| l.is_ok()));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(mgr.status().reference_count, 5);
        drop(leases);
        assert_eq!(mgr.status().reference_count, 0);
    }

    #[tokio::test]
    async fn test_idle_eviction_waits_for_timeout() {
        let (mgr, loads, _) = manager(Duration::from_millis(200));
        let leases: Vec<_> = join_all((0..3).map(|_| mgr.acquire()))
            .await
            .into_iter()
            .map(|l| l.unwrap())
            .collect();
        drop(leases);
        assert_eq!(mgr.status().reference_count, 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(mgr.status().loaded, "unloaded before the idle timeout");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let status = mgr.status();
        assert!(!status.loaded);
        assert_eq!(status.state, ModelState::Unloaded);

        let again = mgr.acquire().await.unwrap();
        assert_eq!(*again, "model#2 on cpu");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_held_lease_blocks_eviction() {
        let (mgr, _, _) = manager(Duration::from_millis(30));
        let lease = mgr.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(mgr.status().loaded);
        drop(lease);
    }

    #[tokio::test]
    async fn test_load_failure_is_resource_exhausted() {
        let (mgr, _, fail) = manager(Duration::from_secs(60));
        fail.store(true, Ordering::SeqCst);
        let err = mgr.acquire().await.err().unwrap();
        assert!(matches!(err, AppError::ResourceExhausted(_)));

        let status = mgr.status();
        assert_eq!(status.reference_count, 0);
        assert_eq!(status.state, ModelState::Unloaded);
        assert!(status.last_error.is_some());

        fail.store(false, Ordering::SeqCst);
        assert!(mgr.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_force_release_ignores_outstanding_leases() {
        let (mgr, _, _) = manager(Duration::from_secs(60));
        let lease = mgr.acquire().await.unwrap();
        assert!(mgr.force_release());
        assert!(!mgr.status().loaded);
        assert_eq!(mgr.status().reference_count, 0);

        // The stale lease still works and its drop does not underflow the new count.
        assert_eq!(*lease, "model#1 on cpu");
        let fresh = mgr.acquire().await.unwrap();
        drop(lease);
        assert_eq!(mgr.status().reference_count, 1);
        drop(fresh);
        assert_eq!(mgr.status().reference_count, 0);
    }

    #[tokio::test]
    async fn test_force_release_during_load_keeps_new_lease_counted() {
        let (mgr, _, _) = manager(Duration::from_millis(30));
        let loading = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(mgr.status().state, ModelState::Loading);
        assert!(!mgr.force_release());

        let lease = loading.await.unwrap().unwrap();
        assert_eq!(mgr.status().reference_count, 1);

        // Well past the idle timeout: the reaper must leave a leased model alone.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(mgr.status().loaded);
        drop(lease);
        assert_eq!(mgr.status().reference_count, 0);
    }

    #[tokio::test]
    async fn test_memory_pressure_forces_cpu() {
        let monitor = Arc::new(ResourceMonitor::new(&MonitorConfig {
            sample_interval_secs: 1,
            history_size: 4,
            cpu_warning_percent: 80.0,
            cpu_critical_percent: 95.0,
            memory_warning_percent: 80.0,
            memory_critical_percent: 90.0,
        }));
        monitor.record(ResourceSnapshot {
            timestamp: chrono::Utc::now(),
            cpu_percent: 10.0,
            memory_percent: 97.0,
            memory_used: 97,
            memory_total: 100,
            memory_available: 3,
            disk_percent: 10.0,
            gpu_memory_percent: None,
            gpu_utilization: None,
        });

        let loader = FakeLoader {
            loads: Arc::new(AtomicU64::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            delay: Duration::from_millis(1),
        };
        let mgr = Arc::new(
            ModelLifecycleManager::new(
                Box::new(loader),
                DevicePreference::Auto,
                Duration::from_secs(60),
                Duration::from_secs(1),
            )
            .with_monitor(monitor),
        );
        let lease = mgr.acquire().await.unwrap();
        assert!(lease.ends_with("on cpu"));
        assert_eq!(mgr.status().device, Some("cpu"));
    }
}
