use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageError};
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};
use tracing::{debug, info, instrument, warn};
use unmosaic_core::progress::batch_bar;
use unmosaic_core::{Error, ModelSource, ModelStore, Result};
use unmosaic_ml::{
    Device, EngineOptions, InpaintEngine, LamaLoader, MaxResolution, MemoryUsage, ModelKind,
    ModelLoader, Sensitivity, detect,
};

/// Extensions tried, in order, when looking up `{stem}_mask.{ext}`.
pub const MASK_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "bmp"];

const JPEG_QUALITY: u8 = 95;

/// Cache root used when none is configured.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("unmosaic")
        .join("models")
}

#[derive(Debug, Clone)]
pub struct UncensorOptions {
    pub device: Device,
    pub model: ModelKind,
    /// Direct download URL overriding the model's published weights.
    pub model_url: Option<String>,
    pub auto_detect: bool,
    pub sensitivity: Sensitivity,
    pub max_resolution: MaxResolution,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub hf_endpoint: Option<String>,
    pub threads: Option<usize>,
    pub high_memory: bool,
}

impl Default for UncensorOptions {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            model: ModelKind::default(),
            model_url: None,
            auto_detect: true,
            sensitivity: Sensitivity::DEFAULT,
            max_resolution: MaxResolution::default(),
            output_dir: PathBuf::from("uncensored"),
            cache_dir: default_cache_dir(),
            hf_endpoint: None,
            threads: None,
            high_memory: false,
        }
    }
}

impl UncensorOptions {
    fn model_source(&self) -> ModelSource {
        match &self.model_url {
            Some(url) => ModelSource::url(url, filename_from_url(url)),
            None => self.model.default_source(),
        }
    }
}

fn filename_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => "model.onnx".to_string(),
    }
}

/// Outcome for a single image.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingResult {
    Completed { output: PathBuf, elapsed: Duration },
    /// Auto-detection found nothing to repair.
    NoDetection,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Output paths, in input order.
    pub succeeded: Vec<PathBuf>,
    /// Input paths, in input order.
    pub failed: Vec<PathBuf>,
    /// Inputs where auto-detection found nothing.
    pub skipped: Vec<PathBuf>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

impl Serialize for BatchResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("BatchResult", 7)?;
        state.serialize_field("total", &self.total())?;
        state.serialize_field("succeeded_count", &self.succeeded.len())?;
        state.serialize_field("failed_count", &self.failed.len())?;
        state.serialize_field("skipped_count", &self.skipped.len())?;
        state.serialize_field("succeeded", &self.succeeded)?;
        state.serialize_field("failed", &self.failed)?;
        state.serialize_field("skipped", &self.skipped)?;
        state.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub device: Device,
    pub model: ModelKind,
    pub auto_detect: bool,
    pub sensitivity: Sensitivity,
    pub max_resolution: MaxResolution,
    pub output_dir: PathBuf,
    pub memory: Option<MemoryUsage>,
    pub cache_size_bytes: u64,
}

/// Detects censored regions and inpaints them, one image at a time.
pub struct Uncensor<L: ModelLoader = LamaLoader> {
    engine: InpaintEngine<L>,
    store: ModelStore,
    device: Device,
    auto_detect: bool,
    sensitivity: Sensitivity,
    output_dir: PathBuf,
}

impl Uncensor<LamaLoader> {
    pub fn new(options: UncensorOptions) -> Result<Self> {
        let store = ModelStore::new(&options.cache_dir)?.with_hf_endpoint(options.hf_endpoint.clone());
        let loader = LamaLoader::new(store.clone(), options.model_source());
        Self::with_loader(loader, store, options)
    }
}

impl<L: ModelLoader> Uncensor<L> {
    pub fn with_loader(loader: L, store: ModelStore, options: UncensorOptions) -> Result<Self> {
        fs::create_dir_all(&options.output_dir)?;
        info!(
            output_dir = %options.output_dir.display(),
            auto_detect = options.auto_detect,
            sensitivity = %options.sensitivity,
            max_resolution = %options.max_resolution,
            "uncensor pipeline ready"
        );

        let engine = InpaintEngine::new(
            loader,
            EngineOptions {
                device: options.device,
                max_resolution: options.max_resolution,
                threads: options.threads,
                high_memory: options.high_memory,
            },
        );

        Ok(Self {
            engine,
            store,
            device: options.device,
            auto_detect: options.auto_detect,
            sensitivity: options.sensitivity,
            output_dir: options.output_dir,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `{output_dir}/{stem}_uncensored{.ext}`
    pub fn output_path_for(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        let name = match input.extension() {
            Some(ext) => format!("{stem}_uncensored.{}", ext.to_string_lossy()),
            None => format!("{stem}_uncensored"),
        };
        self.output_dir.join(name)
    }

    /// Process the image at `path`. Only a model load failure is returned as
    /// `Err`; everything about the image itself is reported in the result.
    #[instrument(level = "info", skip_all, fields(image = %path.display()))]
    pub fn process_one(
        &mut self,
        path: &Path,
        mask: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<ProcessingResult> {
        self.engine.load()?;
        let output = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.output_path_for(path));

        let started = Instant::now();
        let outcome = open_image(path).and_then(|image| self.repair(&image, mask, &output));
        Ok(settle(outcome, output, started))
    }

    /// Same as [`process_one`](Self::process_one) for an image already in
    /// memory.
    pub fn process_image(
        &mut self,
        image: &DynamicImage,
        mask: Option<&Path>,
        output: &Path,
    ) -> Result<ProcessingResult> {
        self.engine.load()?;
        let started = Instant::now();
        let outcome = self.repair(image, mask, output);
        Ok(settle(outcome, output.to_path_buf(), started))
    }

    /// `Ok(false)` when auto-detection found nothing.
    fn repair(&mut self, image: &DynamicImage, mask: Option<&Path>, output: &Path) -> Result<bool> {
        let mask = match mask {
            Some(path) => {
                debug!("using mask {}", path.display());
                open_image(path)?.to_luma8()
            }
            None if self.auto_detect => match detect(image, self.sensitivity, None)? {
                Some(detection) => detection.mask,
                None => return Ok(false),
            },
            None => return Err(Error::InvalidMaskConfiguration),
        };

        let (width, height) = image.dimensions();
        info!(
            "estimated processing time: {:.1}s",
            self.engine.estimate_processing_time(width, height)
        );

        let repaired = self.engine.inpaint(image, &mask)?;
        save(&repaired, output)?;
        Ok(true)
    }

    /// Process `paths` in order. Masks are looked up in `mask_dir` as
    /// `{stem}_mask.{ext}`; images without one fall back to auto-detection.
    #[instrument(level = "info", skip_all, fields(count = paths.len()))]
    pub fn process_batch<P: AsRef<Path>>(
        &mut self,
        paths: &[P],
        mask_dir: Option<&Path>,
    ) -> Result<BatchResult> {
        self.engine.load()?;
        info!("processing {} images", paths.len());

        let pb = batch_bar(paths.len());
        let mut batch = BatchResult::default();
        for path in paths {
            let path = path.as_ref();
            pb.set_message(path.display().to_string());
            let mask = mask_dir.and_then(|dir| find_mask(dir, path));

            match self.process_one(path, mask.as_deref(), None)? {
                ProcessingResult::Completed { output, .. } => batch.succeeded.push(output),
                ProcessingResult::NoDetection => batch.skipped.push(path.to_path_buf()),
                ProcessingResult::Failed { .. } => batch.failed.push(path.to_path_buf()),
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            "batch complete: {} succeeded, {} failed, {} skipped",
            batch.succeeded.len(),
            batch.failed.len(),
            batch.skipped.len()
        );
        Ok(batch)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            device: self.engine.device().unwrap_or(self.device),
            model: self.engine.kind(),
            auto_detect: self.auto_detect,
            sensitivity: self.sensitivity,
            max_resolution: self.engine.max_resolution(),
            output_dir: self.output_dir.clone(),
            memory: self.engine.memory_usage(),
            cache_size_bytes: self.store.size(),
        }
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.store.clear()
    }

    /// Release the model. The pipeline reloads it on the next call.
    pub fn close(&mut self) {
        self.engine.cleanup();
    }
}

impl<L: ModelLoader> Drop for Uncensor<L> {
    fn drop(&mut self) {
        self.close();
    }
}

fn settle(outcome: Result<bool>, output: PathBuf, started: Instant) -> ProcessingResult {
    match outcome {
        Ok(true) => {
            let elapsed = started.elapsed();
            info!("saved {} in {:.2}s", output.display(), elapsed.as_secs_f64());
            ProcessingResult::Completed { output, elapsed }
        }
        Ok(false) => {
            info!("no censorship detected, skipping");
            ProcessingResult::NoDetection
        }
        Err(err) => {
            warn!("failed: {err}");
            ProcessingResult::Failed {
                reason: err.to_string(),
            }
        }
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|source| Error::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

/// First existing `{stem}_mask.{ext}` in `dir`.
pub(crate) fn find_mask(dir: &Path, image: &Path) -> Option<PathBuf> {
    let stem = image.file_stem()?.to_string_lossy();
    MASK_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}_mask.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn save(image: &DynamicImage, path: &Path) -> Result<()> {
    let wrap = |source: ImageError| Error::ImageSave {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let is_jpeg = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false);

    if is_jpeg {
        let file = File::create(path).map_err(|err| wrap(ImageError::IoError(err)))?;
        let encoder = JpegEncoder::new_with_quality(BufWriter::new(file), JPEG_QUALITY);
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(encoder)
            .map_err(wrap)
    } else {
        image.save(path).map_err(wrap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_filename_ignores_query() {
        assert_eq!(
            filename_from_url("https://example.com/m/big-lama.onnx?download=1"),
            "big-lama.onnx"
        );
        assert_eq!(filename_from_url("https://example.com/"), "model.onnx");
    }

    #[test]
    fn masks_are_found_by_stem() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("page01_mask.webp"), b"")?;
        fs::write(dir.path().join("page01_mask.png"), b"")?;

        let found = find_mask(dir.path(), Path::new("/in/page01.jpg"));

        assert_eq!(found, Some(dir.path().join("page01_mask.png")));
        assert_eq!(find_mask(dir.path(), Path::new("/in/page02.jpg")), None);
        Ok(())
    }

    #[test]
    fn custom_url_overrides_published_weights() {
        let options = UncensorOptions {
            model_url: Some("https://mirror.example/lama/lama.onnx".to_string()),
            ..UncensorOptions::default()
        };
        assert_eq!(
            options.model_source(),
            ModelSource::url("https://mirror.example/lama/lama.onnx", "lama.onnx")
        );
        assert_eq!(
            UncensorOptions::default().model_source(),
            ModelKind::Lama.default_source()
        );
    }
}
