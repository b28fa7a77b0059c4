use std::fmt;
use std::str::FromStr;

use ort::execution_providers::{CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{info, warn};
use unmosaic_core::Error;

/// Compute backend used for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    #[serde(alias = "mps", alias = "metal")]
    CoreMl,
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cuda => write!(f, "CUDA"),
            Device::CoreMl => write!(f, "CoreML"),
            Device::Cpu => write!(f, "CPU"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "mps" | "coreml" | "metal" => Ok(Device::CoreMl),
            "cpu" => Ok(Device::Cpu),
            _ => Err(Error::UnknownDevice(s.to_string())),
        }
    }
}

impl Device {
    /// Pick the device to run on. Never fails: an unavailable accelerator
    /// falls back to the CPU.
    pub fn resolve(preferred: Device) -> Device {
        match preferred {
            Device::Cuda if cuda_is_available() => {
                info!("Using CUDA device: {}", cuda_device_name());
                Device::Cuda
            }
            Device::CoreMl if coreml_is_available() => {
                info!("Using CoreML (Apple Silicon) device");
                Device::CoreMl
            }
            Device::Cpu => {
                info!("Using CPU device");
                Device::Cpu
            }
            unavailable => {
                warn!("{unavailable} not available, falling back to CPU");
                Device::Cpu
            }
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            Device::Cuda => cuda_is_available(),
            Device::CoreMl => coreml_is_available(),
            Device::Cpu => true,
        }
    }

    /// Rough throughput used for progress estimates.
    pub fn seconds_per_megapixel(self) -> f64 {
        match self {
            Device::Cuda => 0.5,
            Device::CoreMl => 1.5,
            Device::Cpu => 15.0,
        }
    }
}

pub fn cuda_is_available() -> bool {
    cfg!(feature = "cuda")
        && cuda_driver_present()
        && CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
}

fn cuda_driver_present() -> bool {
    let candidates: &[&str] = if cfg!(target_os = "windows") {
        &["nvcuda.dll"]
    } else {
        &["libcuda.so.1", "libcuda.so"]
    };
    candidates
        .iter()
        .any(|name| unsafe { libloading::Library::new(name).is_ok() })
}

pub fn coreml_is_available() -> bool {
    cfg!(all(feature = "coreml", target_vendor = "apple"))
        && CoreMLExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
}

#[cfg(feature = "cuda")]
fn cuda_device_name() -> String {
    cudarc::driver::CudaContext::new(0)
        .and_then(|ctx| ctx.name())
        .unwrap_or_else(|_| "device 0".to_string())
}

#[cfg(not(feature = "cuda"))]
fn cuda_device_name() -> String {
    "device 0".to_string()
}

/// Memory snapshot reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemoryUsage {
    /// Bytes in use and total on the accelerator.
    Device {
        device: Device,
        used_bytes: u64,
        total_bytes: u64,
    },
    /// Resident set size of this process.
    Process { device: Device, resident_bytes: u64 },
}

impl MemoryUsage {
    pub fn current(device: Device) -> Self {
        match device {
            Device::Cuda => match cuda_memory() {
                Some((used_bytes, total_bytes)) => MemoryUsage::Device {
                    device,
                    used_bytes,
                    total_bytes,
                },
                None => MemoryUsage::Process {
                    device,
                    resident_bytes: resident_bytes(),
                },
            },
            Device::CoreMl | Device::Cpu => MemoryUsage::Process {
                device,
                resident_bytes: resident_bytes(),
            },
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_memory() -> Option<(u64, u64)> {
    let ctx = cudarc::driver::CudaContext::new(0).ok()?;
    ctx.bind_to_thread().ok()?;
    let (free, total) = cudarc::driver::result::mem_get_info().ok()?;
    Some(((total - free) as u64, total as u64))
}

#[cfg(not(feature = "cuda"))]
fn cuda_memory() -> Option<(u64, u64)> {
    None
}

fn resident_bytes() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory()).unwrap_or(0)
}
