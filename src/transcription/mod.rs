//! # Transcription Module
//!
//! Speech-to-text with Whisper via the Candle framework, plus the lifecycle
//! manager that loads the model on first use and unloads it when idle.
//!
//! ## Key Components:
//! - **ModelLifecycleManager**: lazy loading, leases, idle eviction, device fallback
//! - **WhisperLoader / WhisperModel**: hub download and greedy decoding
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod lifecycle; // Lazy load, leases, idle reaper
pub mod model; // Whisper loading and decoding

pub use lifecycle::{ModelLease, ModelLifecycleManager, ModelLoader, ModelState, ModelStatus};
pub use model::{ModelSize, WhisperLoader};

use crate::config::ModelsConfig;
use crate::device::DevicePreference;

/// A loaded speech model. Called from the blocking pool.
pub trait SpeechModel: Send + Sync {
    /// Transcribe up to 30 seconds of 16 kHz mono audio.
    fn transcribe(&self, pcm: &[f32], language: Option<&str>) -> anyhow::Result<String>;
}

pub type SpeechModelManager = ModelLifecycleManager<Box<dyn SpeechModel>>;

/// Build the Whisper manager described by the models config.
pub fn whisper_manager(config: &ModelsConfig) -> anyhow::Result<SpeechModelManager> {
    let size: ModelSize = config.whisper_model.parse()?;
    Ok(ModelLifecycleManager::new(
        Box::new(WhisperLoader::new(size)),
        DevicePreference::from_config(&config.device),
        config.idle_timeout(),
        config.reaper_interval(),
    ))
}
