//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with `APP__` prefix, `__` between levels)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP__SCHEDULER__WORKERS=4`, `APP__UPLOADS__MAX_SESSIONS=20`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why a double underscore:
//! Several keys contain underscores themselves (`max_queue_size`), so a single
//! `_` separator could not tell `scheduler.max_queue_size` from
//! `scheduler.max.queue.size`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration, grouped by component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub scheduler: SchedulerConfig,
    pub uploads: UploadConfig,
    pub progress: ProgressConfig,
    pub monitor: MonitorConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech model lifecycle settings.
///
/// ## Fields:
/// - `whisper_model`: Whisper size to lazily load ("tiny", "base", "small", "medium", "large")
/// - `device`: Preferred device ("auto", "cpu", "cuda", "metal"); falls back to CPU
/// - `idle_timeout_secs`: How long an unused model stays in memory
/// - `reaper_interval_secs`: How often the idle reaper checks
/// - `default_language`: Language hint passed to the decoder when a job gives none
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub whisper_model: String,
    pub device: String,
    pub idle_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub default_language: Option<String>,
}

/// Task scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrently executing jobs
    pub workers: usize,
    /// Upper bound on pending + running tasks
    pub max_queue_size: usize,
    /// Retry budget applied when a submission does not specify one
    pub default_max_retries: u32,
}

/// Chunked upload settings.
///
/// ## Directory layout:
/// - `temp_dir/<session_id>/chunk_00000`: scratch storage, one file per chunk
/// - `upload_dir/<session_id>_<file_name>`: reassembled, verified files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub upload_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub max_sessions: usize,
    /// Largest file a session may declare
    pub max_file_size: u64,
    /// Upper bound on `ceil(file_size / chunk_size)` for one session
    pub max_chunks: u32,
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub session_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Progress registry retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Terminal records older than this are removed by cleanup
    pub retention_secs: u64,
    /// Hard cap on terminal records kept, newest first
    pub max_terminal_records: usize,
    /// Non-terminal records untouched for this long are cancelled
    pub stale_after_secs: u64,
    pub cleanup_interval_secs: u64,
}

/// Resource monitor settings. Percentages are 0-100.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub sample_interval_secs: u64,
    pub history_size: usize,
    pub cpu_warning_percent: f32,
    pub cpu_critical_percent: f32,
    pub memory_warning_percent: f32,
    pub memory_critical_percent: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            models: ModelsConfig {
                whisper_model: "base".to_string(),
                device: "auto".to_string(),
                idle_timeout_secs: 300,
                reaper_interval_secs: 30,
                default_language: Some("en".to_string()),
            },
            scheduler: SchedulerConfig {
                workers: 2,
                max_queue_size: 100,
                default_max_retries: 1,
            },
            uploads: UploadConfig {
                upload_dir: PathBuf::from("data/uploads"),
                temp_dir: PathBuf::from("data/tmp"),
                max_sessions: 10,
                max_file_size: 4 * 1024 * 1024 * 1024, // 4 GiB
                max_chunks: 100_000,
                default_chunk_size: 1024 * 1024,    // 1 MiB
                max_chunk_size: 16 * 1024 * 1024,   // 16 MiB
                session_timeout_secs: 3600,
                sweep_interval_secs: 60,
            },
            progress: ProgressConfig {
                retention_secs: 3600,
                max_terminal_records: 1000,
                stale_after_secs: 6 * 3600,
                cleanup_interval_secs: 300,
            },
            monitor: MonitorConfig {
                sample_interval_secs: 5,
                history_size: 720, // one hour at the default interval
                cpu_warning_percent: 80.0,
                cpu_critical_percent: 95.0,
                memory_warning_percent: 80.0,
                memory_critical_percent: 92.0,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`
    /// - `APP__MODELS__WHISPER_MODEL=small`
    /// - `APP__UPLOADS__UPLOAD_DIR=/var/lib/media/uploads`
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching these at startup gives a clear message instead of a worker pool
    /// with zero workers that silently never runs anything.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.scheduler.workers == 0 {
            return Err(anyhow::anyhow!("Scheduler needs at least one worker"));
        }

        if self.scheduler.max_queue_size == 0 {
            return Err(anyhow::anyhow!("Scheduler max_queue_size must be greater than 0"));
        }

        if self.uploads.max_sessions == 0 {
            return Err(anyhow::anyhow!("Max upload sessions must be greater than 0"));
        }

        if self.uploads.max_file_size == 0 || self.uploads.max_chunks == 0 {
            return Err(anyhow::anyhow!("Upload max_file_size and max_chunks must be greater than 0"));
        }

        if self.uploads.default_chunk_size == 0 {
            return Err(anyhow::anyhow!("Default chunk size must be greater than 0"));
        }

        if self.uploads.default_chunk_size > self.uploads.max_chunk_size {
            return Err(anyhow::anyhow!(
                "Default chunk size ({}) exceeds max chunk size ({})",
                self.uploads.default_chunk_size,
                self.uploads.max_chunk_size
            ));
        }

        if self.models.idle_timeout_secs == 0 || self.models.reaper_interval_secs == 0 {
            return Err(anyhow::anyhow!("Model idle timeout and reaper interval must be greater than 0"));
        }

        if self.monitor.sample_interval_secs == 0 || self.monitor.history_size == 0 {
            return Err(anyhow::anyhow!("Monitor interval and history size must be greater than 0"));
        }

        if self.monitor.cpu_warning_percent > self.monitor.cpu_critical_percent
            || self.monitor.memory_warning_percent > self.monitor.memory_critical_percent
        {
            return Err(anyhow::anyhow!("Warning thresholds must not exceed critical thresholds"));
        }

        Ok(())
    }
}

impl ModelsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl UploadConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

impl ProgressConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.uploads.default_chunk_size, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.uploads.default_chunk_size = config.uploads.max_chunk_size + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.uploads.max_chunks = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.monitor.memory_warning_percent = 99.0;
        config.monitor.memory_critical_percent = 90.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.models.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.progress.retention(), Duration::from_secs(3600));
    }
}
