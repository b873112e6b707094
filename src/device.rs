//! # Device Selection
//!
//! Picks the compute device a model is loaded onto. Accelerated devices (CUDA,
//! Metal) are preferred; CPU is always available as the plain fallback.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached result of accelerator detection; probing CUDA/Metal is not free.
static ACCELERATOR: OnceLock<Option<Device>> = OnceLock::new();

/// Device preference from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Best available accelerator, else CPU
    #[default]
    Auto,
    Cpu,
    /// CUDA GPU 0, else CPU
    Cuda,
    /// Metal GPU 0, else CPU
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Parse a config value, falling back to `Auto` with a warning.
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|e| {
            warn!("{}, using auto", e);
            DevicePreference::Auto
        })
    }
}

pub struct DeviceManager;

impl DeviceManager {
    /// Resolve a preference to a device.
    ///
    /// ## Parameters:
    /// - **preference**: configured preference
    /// - **allow_accelerated**: `false` forces CPU (e.g. under memory pressure)
    pub fn select(preference: DevicePreference, allow_accelerated: bool) -> Device {
        if !allow_accelerated {
            return Device::Cpu;
        }
        match preference {
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Auto => Self::best_accelerator().unwrap_or(Device::Cpu),
            DevicePreference::Cuda => Self::cuda().unwrap_or_else(|| {
                warn!("CUDA requested but unavailable, using CPU");
                Device::Cpu
            }),
            DevicePreference::Metal => Self::metal().unwrap_or_else(|| {
                warn!("Metal requested but unavailable, using CPU");
                Device::Cpu
            }),
        }
    }

    pub fn best_accelerator() -> Option<Device> {
        ACCELERATOR
            .get_or_init(|| {
                let found = Self::cuda().or_else(Self::metal);
                match &found {
                    Some(device) => info!("Accelerator available: {}", Self::describe(device)),
                    None => info!("No GPU acceleration available"),
                }
                found
            })
            .clone()
    }

    fn cuda() -> Option<Device> {
        Device::new_cuda(0)
            .map_err(|e| debug!("CUDA not available: {}", e))
            .ok()
    }

    fn metal() -> Option<Device> {
        Device::new_metal(0)
            .map_err(|e| debug!("Metal not available: {}", e))
            .ok()
    }

    pub fn is_accelerated(device: &Device) -> bool {
        !matches!(device, Device::Cpu)
    }

    pub fn describe(device: &Device) -> &'static str {
        match device {
            Device::Cpu => "cpu",
            Device::Cuda(_) => "cuda",
            Device::Metal(_) => "metal",
        }
    }
}
