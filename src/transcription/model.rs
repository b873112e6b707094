//! # Whisper Model
//!
//! Loads Whisper through Candle and runs greedy decoding on 30 second segments
//! of 16 kHz mono audio.
//!
//! ## Model Loading Process:
//! 1. Fetch `config.json`, `tokenizer.json` and `model.safetensors` from the
//!    HuggingFace hub (cached locally after the first download)
//! 2. Build the mel filter bank for the model's number of mel bins
//! 3. Memory-map the weights and build the model on the requested device
//!
//! Steps 2-3 are CPU heavy and run on the blocking pool.

use super::lifecycle::ModelLoader;
use super::SpeechModel;
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use futures_util::future::{BoxFuture, FutureExt};
use hf_hub::api::tokio::ApiBuilder;
use std::sync::Mutex;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Whisper checkpoints we know how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Approximate weight size, for logs.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// [`ModelLoader`] for Whisper checkpoints on the HuggingFace hub.
pub struct WhisperLoader {
    size: ModelSize,
}

impl WhisperLoader {
    pub fn new(size: ModelSize) -> Self {
        Self { size }
    }
}

impl ModelLoader for WhisperLoader {
    type Model = Box<dyn SpeechModel>;

    fn name(&self) -> String {
        format!("whisper-{}", self.size)
    }

    fn load(&self, device: Device) -> BoxFuture<'_, Result<Self::Model>> {
        async move {
            let model = WhisperModel::load(self.size, device).await?;
            Ok(Box::new(model) as Box<dyn SpeechModel>)
        }
        .boxed()
    }
}

pub struct WhisperModel {
    /// Decoder keeps a KV cache, so forward passes need `&mut`
    model: Mutex<m::model::Whisper>,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,
}

impl WhisperModel {
    /// Download (or reuse cached) weights and build the model on `device`.
    ///
    /// ## Environment Variables:
    /// - `HF_TOKEN`: token for gated or rate-limited downloads
    /// - `HF_HUB_CACHE`: cache directory override
    pub async fn load(size: ModelSize, device: Device) -> Result<Self> {
        info!("Fetching Whisper {} (~{} MB) from {}", size, size.size_mb(), size.repo_name());

        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(std::env::var("HF_TOKEN").ok());
        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        }
        let api = builder.build().context("Failed to create HuggingFace API client")?;
        let repo = api.model(size.repo_name().to_string());

        let config_file = repo
            .get("config.json")
            .await
            .with_context(|| format!("Failed to download config.json from {}", size.repo_name()))?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("Failed to download tokenizer.json from {}", size.repo_name()))?;
        let weights_file = repo
            .get("model.safetensors")
            .await
            .with_context(|| format!("Failed to download model.safetensors from {}", size.repo_name()))?;

        tokio::task::spawn_blocking(move || -> Result<Self> {
            let config: Config = serde_json::from_reader(std::fs::File::open(config_file)?)?;
            let tokenizer = Tokenizer::from_file(tokenizer_file).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
            let mel_filters = mel_filter_bank(config.num_mel_bins);

            // SAFETY: the weights file is owned by the hub cache and not modified while mapped.
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_file], m::DTYPE, &device)? };
            let model = m::model::Whisper::load(&vb, config.clone())?;

            Ok(Self {
                model: Mutex::new(model),
                config,
                tokenizer,
                mel_filters,
                device,
            })
        })
        .await
        .context("Model loading task failed")?
    }

    fn token_id(&self, token: &str) -> Result<u32> {
        self.tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow!("Tokenizer has no {} token", token))
    }

    /// Greedy decode of up to 30 seconds of audio.
    fn decode_segment(&self, pcm: &[f32], language: Option<&str>) -> Result<String> {
        let mut padded = pcm[..pcm.len().min(m::N_SAMPLES)].to_vec();
        padded.resize(m::N_SAMPLES, 0.0);

        let mel = m::audio::pcm_to_mel(&self.config, &padded, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        let mel = mel.narrow(2, 0, frames.min(m::N_FRAMES))?;

        let sot = self.token_id(m::SOT_TOKEN)?;
        let transcribe = self.token_id(m::TRANSCRIBE_TOKEN)?;
        let eot = self.token_id(m::EOT_TOKEN)?;
        let no_timestamps = self.token_id(m::NO_TIMESTAMPS_TOKEN)?;

        let mut tokens = vec![sot];
        if let Some(lang) = language {
            match self.tokenizer.token_to_id(&format!("<|{}|>", lang.to_lowercase())) {
                Some(id) => tokens.push(id),
                None => warn!(language = lang, "Unknown language hint, letting the model decide"),
            }
        }
        tokens.push(transcribe);
        tokens.push(no_timestamps);
        let prefix_len = tokens.len();

        let mut model = self.model.lock().map_err(|_| anyhow!("Whisper model lock poisoned"))?;
        let features = model.encoder.forward(&mel, true)?;

        let max_len = self.config.max_target_positions / 2;
        for i in 0..max_len {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = model.decoder.forward(&input, &features, i == 0)?;
            let (_, seq_len, _) = ys.dims3()?;
            let logits = model
                .decoder
                .final_linear(&ys.i(..1)?)?
                .i(0)?
                .i(seq_len - 1)?
                .to_dtype(DType::F32)?;
            let logits: Vec<f32> = logits.to_vec1()?;

            let next = logits
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(idx, _)| idx as u32)
                .unwrap_or(eot);
            if next == eot || tokens.len() >= self.config.max_target_positions {
                break;
            }
            tokens.push(next);
        }
        drop(model);

        let text = self
            .tokenizer
            .decode(&tokens[prefix_len..], true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))?;
        Ok(text.trim().to_string())
    }
}

impl SpeechModel for WhisperModel {
    fn transcribe(&self, pcm: &[f32], language: Option<&str>) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }
        let started = std::time::Instant::now();
        let text = self.decode_segment(pcm, language)?;
        debug!(
            audio_secs = pcm.len() as f64 / m::SAMPLE_RATE as f64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Segment transcribed"
        );
        Ok(text)
    }
}

/// Slaney-style mel filter bank for 16 kHz audio and a 400-point FFT,
/// laid out as `n_mels` rows of 201 weights.
pub fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    const N_FFT_BINS: usize = m::N_FFT / 2 + 1;
    let sample_rate = m::SAMPLE_RATE as f64;

    let fft_freqs: Vec<f64> = (0..N_FFT_BINS)
        .map(|k| k as f64 * sample_rate / m::N_FFT as f64)
        .collect();
    let min_mel = hz_to_mel(0.0);
    let max_mel = hz_to_mel(sample_rate / 2.0);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(min_mel + (max_mel - min_mel) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * N_FFT_BINS];
    for i in 0..n_mels {
        let (left, center, right) = (mel_points[i], mel_points[i + 1], mel_points[i + 2]);
        let norm = 2.0 / (right - left);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[i * N_FFT_BINS + k] = (weight * norm) as f32;
        }
    }
    filters
}

const MEL_F_SP: f64 = 200.0 / 3.0;
const MEL_MIN_LOG_HZ: f64 = 1000.0;
const MEL_MIN_LOG_MEL: f64 = MEL_MIN_LOG_HZ / MEL_F_SP;

fn mel_log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MEL_MIN_LOG_HZ {
        hz / MEL_F_SP
    } else {
        MEL_MIN_LOG_MEL + (hz / MEL_MIN_LOG_HZ).ln() / mel_log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < MEL_MIN_LOG_MEL {
        mel * MEL_F_SP
    } else {
        MEL_MIN_LOG_HZ * (mel_log_step() * (mel - MEL_MIN_LOG_MEL)).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("huge".parse::<ModelSize>().is_err());
        assert_eq!(WhisperLoader::new(ModelSize::Base).name(), "whisper-base");
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mel_filter_bank_shape() {
        let filters = mel_filter_bank(80);
        assert_eq!(filters.len(), 80 * 201);
        assert!(filters.iter().all(|w| *w >= 0.0));
        // Every filter picks up some energy.
        for row in filters.chunks(201) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }
}
