//! # Audio Decoding
//!
//! Turns an uploaded file into the 16 kHz mono `f32` samples Whisper expects.
//!
//! ## Supported Inputs:
//! - **WAV**: 8/16/24-bit integer or 32-bit float, any channel count
//!   (downmixed to mono), sample rate must be 16 kHz
//! - **Raw PCM** (`.pcm`, `.raw`): 16-bit signed little-endian mono at 16 kHz
//!
//! Resampling is out of scope; files at other rates are rejected with a clear
//! error so the job fails instead of producing garbage text.

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::path::Path;

pub const SAMPLE_RATE: u32 = 16_000;

/// Samples per transcription segment (30 seconds).
pub const SEGMENT_SAMPLES: usize = SAMPLE_RATE as usize * 30;

/// Decoded mono audio.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Split into consecutive 30 second segments; the last one may be shorter.
    pub fn segments(&self) -> std::slice::Chunks<'_, f32> {
        self.samples.chunks(SEGMENT_SAMPLES)
    }

    pub fn segment_count(&self) -> usize {
        self.samples.len().div_ceil(SEGMENT_SAMPLES)
    }
}

/// Read and decode an audio file. Blocking; call from `spawn_blocking`.
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read audio file {}", path.display()))?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pcm" | "raw" => decode_pcm16(&bytes),
        "wav" | "wave" => decode_wav(&bytes),
        // Sniff the RIFF header before giving up on unknown extensions.
        _ if bytes.starts_with(b"RIFF") => decode_wav(&bytes),
        other => bail!("Unsupported audio format: .{}", other),
    }
}

/// 16-bit signed little-endian mono PCM at 16 kHz.
pub fn decode_pcm16(bytes: &[u8]) -> Result<DecodedAudio> {
    if bytes.len() % 2 != 0 {
        bail!("PCM data length must be even for 16-bit samples");
    }
    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / i16::MAX as f32);
    }
    Ok(DecodedAudio {
        samples,
        sample_rate: SAMPLE_RATE,
    })
}

pub fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut reader = Cursor::new(bytes);
    let (header, data) = wav::read(&mut reader).map_err(|e| anyhow!("Invalid WAV file: {}", e))?;

    if header.sampling_rate != SAMPLE_RATE {
        bail!(
            "Unsupported sample rate: {} Hz (expected {} Hz)",
            header.sampling_rate,
            SAMPLE_RATE
        );
    }
    let channels = header.channel_count.max(1) as usize;

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(v) => v.into_iter().map(|s| (s as f32 - 128.0) / 128.0).collect(),
        wav::BitDepth::Sixteen(v) => v.into_iter().map(|s| s as f32 / i16::MAX as f32).collect(),
        wav::BitDepth::TwentyFour(v) => v.into_iter().map(|s| s as f32 / 8_388_607.0).collect(),
        wav::BitDepth::ThirtyTwoFloat(v) => v,
        wav::BitDepth::Empty => bail!("WAV file contains no audio data"),
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, channels),
        sample_rate: SAMPLE_RATE,
    })
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
