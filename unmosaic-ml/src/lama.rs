use std::path::Path;

use image::{GrayImage, Rgb, RgbImage};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{RunOptions, Session};
use ort::{inputs, value::TensorRef};
use tracing::{debug, info};
use unmosaic_core::{BoxError, Error, ModelSource, ModelStore, Result};

use crate::engine::{InpaintModel, ModelLoader};
use crate::model::ModelKind;
use crate::{Device, RuntimeConfig};

/// LaMa expects spatial dimensions divisible by this.
const PAD_MULTIPLE: u32 = 8;

const ARENA_SHRINKAGE: &str = "memory.enable_memory_arena_shrinkage";

/// Substrings of ONNX Runtime errors that point at the execution provider
/// rather than the weights file.
const PROVIDER_MARKERS: [&str; 6] = [
    "NOT_IMPLEMENTED",
    "CUDA",
    "cuDNN",
    "CoreML",
    "execution provider",
    "ExecutionProvider",
];

const REMEDIATION: &str = "Solutions:
  1. Build with `--features cuda` and install the CUDA 12 runtime with cuDNN 9
  2. Run with `--device cpu` (optionally pointing `model_url` at CPU-compatible weights)
  3. Use a machine with a supported GPU";

/// Fetches LaMa weights into the model cache and opens an ONNX session.
#[derive(Debug, Clone)]
pub struct LamaLoader {
    store: ModelStore,
    source: ModelSource,
}

impl LamaLoader {
    pub fn new(store: ModelStore, source: ModelSource) -> Self {
        Self { store, source }
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }
}

impl ModelLoader for LamaLoader {
    type Model = Lama;

    fn kind(&self) -> ModelKind {
        ModelKind::Lama
    }

    fn load(&self, runtime: &RuntimeConfig) -> Result<Lama> {
        let path = self.store.fetch(&self.source)?;
        Lama::from_file(&path, runtime)
    }
}

pub struct Lama {
    session: Session,
    /// Run options that hand arena memory back after the run.
    shrink: Option<RunOptions>,
    release_pending: bool,
}

impl Lama {
    pub fn from_file(path: &Path, runtime: &RuntimeConfig) -> Result<Self> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let device = runtime.device;

        let builder = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(runtime.intra_threads))
            .and_then(|b| b.with_inter_threads(runtime.inter_threads))
            .and_then(|b| b.with_memory_pattern(runtime.memory_pattern))
            .map_err(|err| Error::load(&name, err))?;

        let builder = builder
            .with_execution_providers([runtime.execution_provider()])
            .map_err(|err| incompatible(device, err.to_string()))?;

        let session = builder.commit_from_file(path).map_err(|err| {
            let detail = err.to_string();
            if is_provider_failure(device, &detail) {
                incompatible(device, detail)
            } else {
                Error::load(&name, err)
            }
        })?;

        let shrink = match runtime.arena_shrinkage() {
            Some(devices) => Some(shrink_options(devices).map_err(|err| Error::load(&name, err))?),
            None => None,
        };

        info!("loaded {name} with {device} execution provider");
        Ok(Self {
            session,
            shrink,
            release_pending: false,
        })
    }
}

fn shrink_options(devices: &str) -> ort::Result<RunOptions> {
    let mut options = RunOptions::new()?;
    options.add_config_entry(ARENA_SHRINKAGE, devices)?;
    Ok(options)
}

/// Unsupported operators surface as `NOT_IMPLEMENTED` even on the CPU; every
/// other provider message only counts on an accelerator.
fn is_provider_failure(device: Device, detail: &str) -> bool {
    match device {
        Device::Cpu => detail.contains("NOT_IMPLEMENTED"),
        Device::Cuda | Device::CoreMl => PROVIDER_MARKERS
            .iter()
            .any(|marker| detail.contains(marker)),
    }
}

fn incompatible(device: Device, detail: String) -> Error {
    Error::DeviceCompatibility {
        device: device.to_string(),
        detail,
        remediation: REMEDIATION,
    }
}

impl InpaintModel for Lama {
    fn inpaint(
        &mut self,
        image: &RgbImage,
        mask: &GrayImage,
    ) -> std::result::Result<RgbImage, BoxError> {
        let (w, h) = image.dimensions();
        let padded_w = w.next_multiple_of(PAD_MULTIPLE);
        let padded_h = h.next_multiple_of(PAD_MULTIPLE);
        debug!(w, h, padded_w, padded_h, "preparing LaMa tensors");

        let (pw, ph) = (padded_w as usize, padded_h as usize);
        let mut image_data = ndarray::Array::zeros((1, 3, ph, pw));
        let mut mask_data = ndarray::Array::zeros((1, 1, ph, pw));
        for y in 0..padded_h {
            let sy = reflect(y, h);
            for x in 0..padded_w {
                let sx = reflect(x, w);
                let p = image.get_pixel(sx, sy);
                let (fx, fy) = (x as usize, y as usize);
                image_data[[0, 0, fy, fx]] = f32::from(p[0]) / 255.0;
                image_data[[0, 1, fy, fx]] = f32::from(p[1]) / 255.0;
                image_data[[0, 2, fy, fx]] = f32::from(p[2]) / 255.0;
                mask_data[[0, 0, fy, fx]] = if mask.get_pixel(sx, sy)[0] > 0 {
                    1.0f32
                } else {
                    0.0f32
                };
            }
        }

        let inputs = inputs![
            "image" => TensorRef::from_array_view(image_data.view())?,
            "mask" => TensorRef::from_array_view(mask_data.view())?,
        ];
        let release = std::mem::take(&mut self.release_pending);
        let outputs = match &self.shrink {
            Some(options) if release => self.session.run_with_options(inputs, options)?,
            _ => self.session.run(inputs)?,
        };
        let output = outputs["output"].try_extract_array::<f32>()?;

        let mut out = RgbImage::new(w, h);
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            let (fx, fy) = (x as usize, y as usize);
            let channel = |c: usize| (output[[0, c, fy, fx]] * 255.0).clamp(0.0, 255.0) as u8;
            *pixel = Rgb([channel(0), channel(1), channel(2)]);
        }
        Ok(out)
    }

    /// Arena memory can only be handed back at the end of a run, so this arms
    /// the shrink for the next one.
    fn release_cache(&mut self) {
        if self.shrink.is_some() {
            self.release_pending = true;
        }
    }
}

/// Mirror index `i` back into `0..len` without repeating the edge pixel.
fn reflect(i: u32, len: u32) -> u32 {
    if i < len {
        i
    } else if len == 1 {
        0
    } else {
        (2 * len - 2).saturating_sub(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflect_mirrors_past_the_edge() {
        assert_eq!(reflect(3, 10), 3);
        assert_eq!(reflect(10, 10), 8);
        assert_eq!(reflect(13, 10), 5);
        assert_eq!(reflect(5, 1), 0);
    }

    #[test]
    fn only_provider_errors_blame_the_device() {
        let corrupt = "Load model from lama.onnx failed: Protobuf parsing failed.";
        assert!(!is_provider_failure(Device::Cuda, corrupt));
        assert!(!is_provider_failure(Device::Cpu, corrupt));

        let cuda = "CUDA failure 100: no CUDA-capable device is detected";
        assert!(is_provider_failure(Device::Cuda, cuda));
        assert!(!is_provider_failure(Device::Cpu, cuda));

        let op = "[ONNXRuntimeError] : 9 : NOT_IMPLEMENTED : Could not find an implementation for FFT";
        assert!(is_provider_failure(Device::Cpu, op));
        assert!(is_provider_failure(Device::CoreMl, op));
    }

    #[test]
    fn shrink_option_accepts_every_arena_device() -> ort::Result<()> {
        for device in [Device::Cpu, Device::Cuda, Device::CoreMl] {
            let runtime = RuntimeConfig::high_memory(device, Some(1));
            let devices = runtime.arena_shrinkage().expect("high memory enables an arena");
            shrink_options(devices)?;
        }
        Ok(())
    }

    #[test]
    fn missing_weights_are_a_load_error() {
        let runtime = RuntimeConfig::for_device(Device::Cpu, Some(1));
        let err = Lama::from_file(Path::new("/nonexistent/lama.onnx"), &runtime)
            .err()
            .expect("missing file must fail");
        assert!(err.is_unrecoverable(), "unexpected error: {err}");
    }
}
