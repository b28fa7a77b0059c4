use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayImage, RgbImage};
use imageproc::contrast::{ThresholdType, threshold};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use unmosaic_core::{BoxError, Error, Result};

use crate::device::MemoryUsage;
use crate::model::{MemoryEstimate, ModelKind};
use crate::{Device, RuntimeConfig};

/// Pixel value at or below which a mask pixel is left untouched.
pub const MASK_THRESHOLD: u8 = 127;

/// A loaded inpainting network.
pub trait InpaintModel {
    /// Fill the pixels where `mask` is 255. `image` and `mask` share
    /// dimensions and the output must have them too.
    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> std::result::Result<RgbImage, BoxError>;

    /// Return cached allocator memory to the device.
    fn release_cache(&mut self) {}
}

/// Produces an [`InpaintModel`] for a resolved device.
pub trait ModelLoader {
    type Model: InpaintModel;

    fn kind(&self) -> ModelKind;

    fn load(&self, runtime: &RuntimeConfig) -> Result<Self::Model>;
}

/// Longest side the model is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum MaxResolution {
    Limited(u32),
    Unbounded,
}

impl Default for MaxResolution {
    fn default() -> Self {
        MaxResolution::Limited(2048)
    }
}

impl MaxResolution {
    /// Target size when `(width, height)` exceeds the cap.
    pub fn fit(self, width: u32, height: u32) -> Option<(u32, u32)> {
        let MaxResolution::Limited(cap) = self else {
            return None;
        };
        let longest = width.max(height);
        if longest <= cap {
            return None;
        }
        let scale = f64::from(cap) / f64::from(longest);
        let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, cap);
        Some((scaled(width), scaled(height)))
    }
}

impl From<u32> for MaxResolution {
    fn from(value: u32) -> Self {
        match value {
            0 => MaxResolution::Unbounded,
            cap => MaxResolution::Limited(cap),
        }
    }
}

impl From<MaxResolution> for u32 {
    fn from(value: MaxResolution) -> Self {
        match value {
            MaxResolution::Limited(cap) => cap,
            MaxResolution::Unbounded => 0,
        }
    }
}

impl FromStr for MaxResolution {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unbounded" | "none" | "unlimited" => Ok(MaxResolution::Unbounded),
            value => value.parse::<u32>().map(MaxResolution::from),
        }
    }
}

impl fmt::Display for MaxResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaxResolution::Limited(cap) => write!(f, "{cap}"),
            MaxResolution::Unbounded => write!(f, "unbounded"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub device: Device,
    pub max_resolution: MaxResolution,
    pub threads: Option<usize>,
    pub high_memory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Unloaded,
    Loading,
    Loaded,
    Unavailable,
}

enum Slot<M> {
    Unloaded,
    Loading,
    Loaded { model: M, device: Device },
    Unavailable(String),
}

/// Owns the inpainting model and keeps memory bounded around each call.
pub struct InpaintEngine<L: ModelLoader> {
    loader: L,
    options: EngineOptions,
    slot: Slot<L::Model>,
}

impl<L: ModelLoader> InpaintEngine<L> {
    pub fn new(loader: L, options: EngineOptions) -> Self {
        Self {
            loader,
            options,
            slot: Slot::Unloaded,
        }
    }

    pub fn state(&self) -> EngineState {
        match self.slot {
            Slot::Unloaded => EngineState::Unloaded,
            Slot::Loading => EngineState::Loading,
            Slot::Loaded { .. } => EngineState::Loaded,
            Slot::Unavailable(_) => EngineState::Unavailable,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.loader.kind()
    }

    pub fn max_resolution(&self) -> MaxResolution {
        self.options.max_resolution
    }

    /// Device of the loaded model, if any.
    pub fn device(&self) -> Option<Device> {
        match self.slot {
            Slot::Loaded { device, .. } => Some(device),
            _ => None,
        }
    }

    fn runtime_for(&self, device: Device) -> RuntimeConfig {
        if self.options.high_memory {
            RuntimeConfig::high_memory(device, self.options.threads)
        } else {
            RuntimeConfig::for_device(device, self.options.threads)
        }
    }

    /// Load the model once. A no-op when already loaded.
    #[instrument(level = "info", skip_all)]
    pub fn load(&mut self) -> Result<()> {
        match &self.slot {
            Slot::Loaded { .. } => return Ok(()),
            Slot::Unavailable(reason) => return Err(Error::EngineUnavailable(reason.clone())),
            Slot::Unloaded | Slot::Loading => {}
        }

        self.slot = Slot::Loading;
        let device = Device::resolve(self.options.device);
        let runtime = self.runtime_for(device);
        info!(
            model = %self.loader.kind(),
            %device,
            threads = runtime.intra_threads,
            "loading inpainting model"
        );

        match self.loader.load(&runtime) {
            Ok(model) => {
                self.slot = Slot::Loaded { model, device };
                info!("inpainting model loaded on {device}");
                Ok(())
            }
            Err(err) if err.is_unrecoverable() => {
                error!("model unusable on {device}: {err}");
                self.slot = Slot::Unavailable(err.to_string());
                Err(err)
            }
            Err(err) => {
                warn!("model load failed, will retry on next call: {err}");
                self.slot = Slot::Unloaded;
                Err(err)
            }
        }
    }

    /// Inpaint `image` where `mask` is set. Output has the input dimensions.
    #[instrument(level = "info", skip_all, fields(width = image.width(), height = image.height()))]
    pub fn inpaint(&mut self, image: &DynamicImage, mask: &GrayImage) -> Result<DynamicImage> {
        let (width, height) = image.dimensions();
        if mask.dimensions() != (width, height) {
            return Err(Error::MaskMismatch {
                image: (width, height),
                mask: mask.dimensions(),
            });
        }

        self.load()?;
        let max_resolution = self.options.max_resolution;
        let Slot::Loaded { model, .. } = &mut self.slot else {
            return Err(Error::EngineUnavailable("model is not loaded".to_string()));
        };

        model.release_cache();

        let original = image.to_rgb8();
        let full_mask = binarize(mask);
        let target = max_resolution.fit(width, height);

        let (work_image, work_mask): (Cow<RgbImage>, Cow<GrayImage>) = match target {
            Some((w, h)) => {
                info!("resizing {width}x{height} to {w}x{h} to bound memory");
                let resized_image = imageops::resize(&original, w, h, FilterType::Lanczos3);
                let resized_mask = imageops::resize(mask, w, h, FilterType::Lanczos3);
                (Cow::Owned(resized_image), Cow::Owned(binarize(&resized_mask)))
            }
            None => (Cow::Borrowed(&original), Cow::Borrowed(&full_mask)),
        };

        debug!(size = ?work_image.dimensions(), "running inference");
        let inferred = model.inpaint(&work_image, &work_mask);
        let expected = work_image.dimensions();
        drop(work_image);
        drop(work_mask);
        model.release_cache();

        let inferred = inferred.map_err(Error::inpaint)?;
        if inferred.dimensions() != expected {
            let (w, h) = inferred.dimensions();
            return Err(Error::inpaint(format!(
                "model returned {w}x{h} for a {}x{} input",
                expected.0, expected.1
            )));
        }

        let restored = match target {
            Some(_) => {
                debug!("restoring original size {width}x{height}");
                imageops::resize(&inferred, width, height, FilterType::Lanczos3)
            }
            None => inferred,
        };

        Ok(DynamicImage::ImageRgb8(composite(
            &original, &restored, &full_mask,
        )))
    }

    /// Expected wall time in seconds for a `width` x `height` image.
    pub fn estimate_processing_time(&self, width: u32, height: u32) -> f64 {
        let device = self.device().unwrap_or(self.options.device);
        let megapixels = f64::from(width) * f64::from(height) / 1_000_000.0;
        megapixels * device.seconds_per_megapixel()
    }

    pub fn estimate_memory(&self) -> MemoryEstimate {
        let device = self.device().unwrap_or(self.options.device);
        self.loader.kind().memory_estimate(device)
    }

    /// Current memory usage, only while a model is loaded.
    pub fn memory_usage(&self) -> Option<MemoryUsage> {
        self.device().map(MemoryUsage::current)
    }

    /// Drop the model and free its memory. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        if !matches!(self.slot, Slot::Loaded { .. }) {
            return;
        }
        if let Slot::Loaded { mut model, device } =
            std::mem::replace(&mut self.slot, Slot::Unloaded)
        {
            model.release_cache();
            drop(model);
            info!("inpainting model on {device} released");
        }
    }
}

impl<L: ModelLoader> Drop for InpaintEngine<L> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn binarize(mask: &GrayImage) -> GrayImage {
    threshold(mask, MASK_THRESHOLD, ThresholdType::Binary)
}

/// Take inpainted pixels under `mask`, original pixels elsewhere.
fn composite(original: &RgbImage, inpainted: &RgbImage, mask: &GrayImage) -> RgbImage {
    let mut out = original.clone();
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        if mask.get_pixel(x, y)[0] > 0 {
            *pixel = *inpainted.get_pixel(x, y);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use image::Luma;

    use super::*;

    #[test]
    fn fit_preserves_aspect_ratio() {
        let cap = MaxResolution::Limited(1024);
        assert_eq!(cap.fit(4096, 2048), Some((1024, 512)));
        assert_eq!(cap.fit(1000, 3000), Some((341, 1024)));
        assert_eq!(cap.fit(1024, 1024), None);
        assert_eq!(MaxResolution::Unbounded.fit(10_000, 10_000), None);
    }

    #[test]
    fn max_resolution_parses() {
        assert_eq!("unbounded".parse::<MaxResolution>().unwrap(), MaxResolution::Unbounded);
        assert_eq!("0".parse::<MaxResolution>().unwrap(), MaxResolution::Unbounded);
        assert_eq!("1536".parse::<MaxResolution>().unwrap(), MaxResolution::Limited(1536));
        assert!("big".parse::<MaxResolution>().is_err());
    }

    #[test]
    fn binarize_splits_at_threshold() {
        let mask = GrayImage::from_fn(4, 1, |x, _| Luma([[0, 127, 128, 255][x as usize]]));
        let binary = binarize(&mask);
        let values: Vec<u8> = binary.pixels().map(|p| p[0]).collect();
        assert_eq!(values, vec![0, 0, 255, 255]);
    }
}
