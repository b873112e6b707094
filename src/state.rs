//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - The effective configuration (read-only after startup)
//! - Per-endpoint request metrics, updated by the metrics middleware
//! - The orchestration components, each behind an `Arc` so handlers,
//!   background loops and jobs share one instance
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference at once
//! - **RwLock**: many readers or one writer
//!
//! Locks are taken poison-tolerant: a panicking request must not take the
//! metrics (and with them every later request) down.

use crate::config::AppConfig;
use crate::jobs::JobCatalog;
use crate::monitor::ResourceMonitor;
use crate::progress::{ProgressRegistry, RetentionPolicy};
use crate::scheduler::TaskScheduler;
use crate::transcription::{self, SpeechModelManager};
use crate::upload::ChunkedUploadAssembler;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,

    pub progress: Arc<ProgressRegistry>,
    pub uploads: Arc<ChunkedUploadAssembler>,
    pub models: Arc<SpeechModelManager>,
    pub monitor: Arc<ResourceMonitor>,
    pub jobs: Arc<JobCatalog>,

    /// Stops the maintenance loops on shutdown
    background: CancellationToken,
}

/// Request metrics collected by the middleware.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Key: "METHOD /route/pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build every component from configuration with the Whisper model manager.
    ///
    /// Nothing is spawned yet; call [`start`](Self::start) from inside the runtime.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let monitor = Arc::new(ResourceMonitor::new(&config.monitor));
        let models = Arc::new(transcription::whisper_manager(&config.models)?.with_monitor(monitor.clone()));
        Ok(Self::with_components(config, models, monitor))
    }

    /// Build with an already constructed model manager (tests plug fakes in here).
    pub fn with_components(
        config: AppConfig,
        models: Arc<SpeechModelManager>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        let progress = Arc::new(ProgressRegistry::new(RetentionPolicy::from(&config.progress)));
        let uploads = Arc::new(ChunkedUploadAssembler::new(config.uploads.clone(), progress.clone()));
        let jobs = Arc::new(JobCatalog::new(
            TaskScheduler::from_config(&config.scheduler),
            progress.clone(),
            models.clone(),
            config.models.default_language.clone(),
            config.scheduler.default_max_retries,
        ));
        uploads.set_completion_hook(jobs.completion_hook());

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            progress,
            uploads,
            models,
            monitor,
            jobs,
            background: CancellationToken::new(),
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        self.jobs.scheduler()
    }

    /// Start the worker pool, the resource monitor and the maintenance loops.
    ///
    /// ## Maintenance loops:
    /// - progress cleanup (retention, cap, stale expiry of records no queued or
    ///   running job owns) every `cleanup_interval_secs`
    /// - upload sweep (sessions idle past `session_timeout_secs`) every `sweep_interval_secs`
    pub fn start(&self) {
        let config = self.get_config();
        self.scheduler().start();
        self.monitor.start();

        let jobs = self.jobs.clone();
        spawn_periodic(
            "progress-cleanup",
            Duration::from_secs(config.progress.cleanup_interval_secs.max(1)),
            self.background.clone(),
            move || {
                let jobs = jobs.clone();
                async move {
                    jobs.cleanup_progress();
                }
            },
        );

        let uploads = self.uploads.clone();
        spawn_periodic(
            "upload-sweep",
            Duration::from_secs(config.uploads.sweep_interval_secs.max(1)),
            self.background.clone(),
            move || {
                let uploads = uploads.clone();
                async move {
                    uploads.sweep_expired().await;
                }
            },
        );
    }

    /// Stop background work and cancel in-flight jobs.
    pub async fn shutdown(&self) {
        self.background.cancel();
        self.monitor.stop();
        self.scheduler().shutdown().await;
        self.models.force_release();
    }

    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    pub fn increment_request_count(&self) {
        write(&self.metrics).request_count += 1;
    }

    pub fn increment_error_count(&self) {
        write(&self.metrics).error_count += 1;
    }

    /// Record one request against an endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: "METHOD /route/pattern", e.g. "GET /api/v1/jobs/{id}"
    /// - **duration_ms**: time spent in the handler chain
    /// - **is_error**: 4xx or 5xx response
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = write(&self.metrics);
        let metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        if is_error {
            metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        read(&self.metrics).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Share of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

/// Run `tick` every `period` until `stop` fires. The first run happens after one period.
fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, stop: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = stop.cancelled() => break,
            }
        }
        debug!(loop_name = name, "Maintenance loop stopped");
    });
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::DevicePreference;
    use crate::transcription::{ModelLifecycleManager, ModelLoader, SpeechModel};
    use candle_core::Device;
    use futures_util::future::{BoxFuture, FutureExt};

    struct SilentModel;

    impl SpeechModel for SilentModel {
        fn transcribe(&self, _pcm: &[f32], _language: Option<&str>) -> anyhow::Result<String> {
            Ok("hello".to_string())
        }
    }

    struct SilentLoader;

    impl ModelLoader for SilentLoader {
        type Model = Box<dyn SpeechModel>;

        fn name(&self) -> String {
            "silent".to_string()
        }

        fn load(&self, _device: Device) -> BoxFuture<'_, anyhow::Result<Self::Model>> {
            async { Ok(Box::new(SilentModel) as Box<dyn SpeechModel>) }.boxed()
        }
    }

    /// State with a fake model and scratch directories under `dir`.
    pub(crate) fn test_state(dir: &std::path::Path) -> AppState {
        let mut config = AppConfig::default();
        config.uploads.upload_dir = dir.join("uploads");
        config.uploads.temp_dir = dir.join("tmp");
        config.scheduler.workers = 1;

        let monitor = Arc::new(ResourceMonitor::new(&config.monitor));
        let models = Arc::new(ModelLifecycleManager::new(
            Box::new(SilentLoader) as Box<dyn ModelLoader<Model = Box<dyn SpeechModel>>>,
            DevicePreference::Cpu,
            Duration::from_secs(60),
            Duration::from_secs(60),
        ));
        AppState::with_components(config, models, monitor)
    }

    #[test]
    fn test_endpoint_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);
        state.increment_request_count();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 1);
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state.start();
        assert!(state.monitor.is_running());
        state.shutdown().await;
        assert!(!state.monitor.is_running());
        assert!(state
            .scheduler()
            .submit("late", crate::scheduler::job_fn(|_| async { Ok(serde_json::Value::Null) }), Default::default(), 0)
            .is_err());
    }
}
