use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use tempfile::TempDir;
use unmosaic_core::{BoxError, Error, ModelStore, Result};
use unmosaic_ml::{
    Device, InpaintModel, MaxResolution, ModelKind, ModelLoader, RuntimeConfig, Sensitivity,
};
use unmosaic_pipeline::{ProcessingResult, Uncensor, UncensorOptions};

const FILL: Rgb<u8> = Rgb([0, 255, 0]);

struct FillModel;

impl InpaintModel for FillModel {
    fn inpaint(&mut self, image: &RgbImage, mask: &GrayImage) -> std::result::Result<RgbImage, BoxError> {
        let mut out = image.clone();
        for (x, y, pixel) in out.enumerate_pixels_mut() {
            if mask.get_pixel(x, y)[0] > 0 {
                *pixel = FILL;
            }
        }
        Ok(out)
    }
}

struct FillLoader {
    broken: bool,
}

impl ModelLoader for FillLoader {
    type Model = FillModel;

    fn kind(&self) -> ModelKind {
        ModelKind::Lama
    }

    fn load(&self, runtime: &RuntimeConfig) -> Result<FillModel> {
        if self.broken {
            return Err(Error::DeviceCompatibility {
                device: runtime.device.to_string(),
                detail: "provider registration failed".to_string(),
                remediation: "run with --device cpu",
            });
        }
        Ok(FillModel)
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("in"))?;
        fs::create_dir_all(dir.path().join("masks"))?;
        fs::create_dir_all(dir.path().join("cache"))?;
        Ok(Self { dir })
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    fn options(&self, auto_detect: bool) -> UncensorOptions {
        UncensorOptions {
            device: Device::Cpu,
            auto_detect,
            sensitivity: Sensitivity::DEFAULT,
            max_resolution: MaxResolution::Limited(512),
            output_dir: self.path("out"),
            cache_dir: self.path("cache"),
            threads: Some(1),
            ..UncensorOptions::default()
        }
    }

    fn pipeline(&self, auto_detect: bool) -> anyhow::Result<Uncensor<FillLoader>> {
        let store = ModelStore::new(self.path("cache"))?;
        Ok(Uncensor::with_loader(
            FillLoader { broken: false },
            store,
            self.options(auto_detect),
        )?)
    }

    fn image(&self, name: &str, image: &RgbImage) -> anyhow::Result<PathBuf> {
        let path = self.path(&format!("in/{name}"));
        image.save(&path)?;
        Ok(path)
    }

    fn corrupt(&self, name: &str) -> anyhow::Result<PathBuf> {
        let path = self.path(&format!("in/{name}"));
        fs::write(&path, b"\x89PNG\r\n\x1a\nthis is not a png")?;
        Ok(path)
    }

    fn mask(&self, stem: &str, width: u32, height: u32) -> anyhow::Result<PathBuf> {
        let path = self.path(&format!("masks/{stem}_mask.png"));
        GrayImage::from_fn(width, height, |x, y| {
            Luma([if x < width / 2 && y < height / 2 { 255 } else { 0 }])
        })
        .save(&path)?;
        Ok(path)
    }
}

fn flat(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb([128, 128, 128]))
}

fn mosaic(size: u32) -> RgbImage {
    let mut image = flat(size, size);
    let (start, end) = (size * 3 / 8, size * 5 / 8);
    for y in start..end {
        for x in start..end {
            let v = if ((x - start) / 8 + (y - start) / 8) % 2 == 0 { 40 } else { 200 };
            image.put_pixel(x, y, Rgb([v, v, v]));
        }
    }
    image
}

#[test]
fn corrupt_inputs_do_not_stop_the_batch() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let mut paths = Vec::new();
    for i in 0..5 {
        let name = format!("page{i}.png");
        if i % 2 == 1 {
            paths.push(fixture.corrupt(&name)?);
        } else {
            paths.push(fixture.image(&name, &flat(64, 48))?);
        }
        fixture.mask(&format!("page{i}"), 64, 48)?;
    }

    let mut pipeline = fixture.pipeline(false)?;
    let batch = pipeline.process_batch(&paths, Some(&fixture.path("masks")))?;

    assert_eq!(batch.succeeded.len(), 3);
    assert_eq!(batch.failed, vec![paths[1].clone(), paths[3].clone()]);
    assert!(batch.skipped.is_empty());
    assert_eq!(batch.total(), 5);

    let json = serde_json::to_value(&batch)?;
    assert_eq!(json["total"], 5);
    assert_eq!(json["succeeded_count"], 3);
    assert_eq!(json["failed_count"], 2);
    assert_eq!(json["skipped_count"], 0);
    assert_eq!(json["failed"].as_array().map(Vec::len), Some(2));
    Ok(())
}

#[test]
fn successes_keep_input_order() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let paths = vec![
        fixture.image("a.png", &flat(32, 32))?,
        fixture.corrupt("b.png")?,
        fixture.image("c.png", &flat(32, 32))?,
    ];
    for stem in ["a", "b", "c"] {
        fixture.mask(stem, 32, 32)?;
    }

    let mut pipeline = fixture.pipeline(false)?;
    let batch = pipeline.process_batch(&paths, Some(&fixture.path("masks")))?;

    assert_eq!(
        batch.succeeded,
        vec![
            fixture.path("out/a_uncensored.png"),
            fixture.path("out/c_uncensored.png"),
        ]
    );
    assert_eq!(batch.failed, vec![paths[1].clone()]);

    let repaired = image::open(&batch.succeeded[0])?.to_rgb8();
    assert_eq!(*repaired.get_pixel(0, 0), FILL);
    assert_eq!(*repaired.get_pixel(31, 31), Rgb([128, 128, 128]));
    Ok(())
}

#[test]
fn missing_mask_without_auto_detect_fails_the_item() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let path = fixture.image("lonely.png", &flat(16, 16))?;
    let mut pipeline = fixture.pipeline(false)?;

    let result = pipeline.process_one(&path, None, None)?;

    match result {
        ProcessingResult::Failed { reason } => assert!(reason.contains("auto-detect disabled")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!fixture.path("out/lonely_uncensored.png").exists());
    Ok(())
}

#[test]
fn clean_images_are_skipped() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let paths = vec![fixture.image("clean.png", &flat(128, 128))?];
    let mut pipeline = fixture.pipeline(true)?;

    let batch = pipeline.process_batch(&paths, None)?;

    assert_eq!(batch.skipped, paths);
    assert!(batch.succeeded.is_empty() && batch.failed.is_empty());
    Ok(())
}

#[test]
fn auto_detect_repairs_mosaic() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let path = fixture.image("censored.png", &mosaic(256))?;
    let mut pipeline = fixture.pipeline(true)?;

    let result = pipeline.process_one(&path, None, None)?;

    let output = match result {
        ProcessingResult::Completed { output, .. } => output,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(output, fixture.path("out/censored_uncensored.png"));
    let repaired = image::open(&output)?.to_rgb8();
    assert_eq!(*repaired.get_pixel(128, 128), FILL);
    assert_eq!(*repaired.get_pixel(2, 2), Rgb([128, 128, 128]));
    Ok(())
}

#[test]
fn mismatched_mask_fails_the_item() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let path = fixture.image("page.png", &flat(40, 40))?;
    let mask = fixture.mask("page", 20, 20)?;
    let mut pipeline = fixture.pipeline(false)?;

    let result = pipeline.process_one(&path, Some(&mask), None)?;

    assert!(matches!(result, ProcessingResult::Failed { .. }));
    Ok(())
}

#[test]
fn jpeg_output_keeps_dimensions() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let path = fixture.image("photo.png", &flat(700, 300))?;
    let mask = fixture.mask("photo", 700, 300)?;
    let output = fixture.path("elsewhere/photo.jpg");
    let mut pipeline = fixture.pipeline(false)?;

    let result = pipeline.process_one(&path, Some(&mask), Some(&output))?;

    assert!(matches!(result, ProcessingResult::Completed { .. }));
    let saved = image::open(&output)?;
    assert_eq!((saved.width(), saved.height()), (700, 300));
    Ok(())
}

#[test]
fn in_memory_images_are_supported() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let mask = fixture.mask("memory", 24, 24)?;
    let output = fixture.path("out/memory.png");
    let mut pipeline = fixture.pipeline(false)?;

    let image = DynamicImage::ImageRgb8(flat(24, 24));
    let result = pipeline.process_image(&image, Some(&mask), &output)?;

    assert!(matches!(result, ProcessingResult::Completed { .. }));
    assert!(output.is_file());
    Ok(())
}

#[test]
fn load_failure_aborts_before_any_image() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let paths = vec![fixture.image("a.png", &flat(16, 16))?];
    let store = ModelStore::new(fixture.path("cache"))?;
    let mut pipeline =
        Uncensor::with_loader(FillLoader { broken: true }, store, fixture.options(true))?;

    let err = pipeline
        .process_batch(&paths, None)
        .expect_err("load failure must propagate");

    assert!(matches!(err, Error::DeviceCompatibility { .. }));
    assert!(fs::read_dir(fixture.path("out"))?.next().is_none());
    Ok(())
}

#[test]
fn stats_describe_the_pipeline() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    fs::write(fixture.path("cache/lama-manga.onnx"), vec![0u8; 64])?;
    let mut pipeline = fixture.pipeline(true)?;

    let before = pipeline.stats();
    assert!(before.memory.is_none());
    assert_eq!(before.cache_size_bytes, 64);

    pipeline.process_image(
        &DynamicImage::ImageRgb8(flat(8, 8)),
        None,
        &fixture.path("out/x.png"),
    )?;
    let after = pipeline.stats();
    assert_eq!(after.device, Device::Cpu);
    assert!(after.memory.is_some());

    let json = serde_json::to_value(&after)?;
    assert_eq!(json["auto_detect"], true);
    assert_eq!(json["max_resolution"], 512);
    assert_eq!(json["model"], "lama");

    pipeline.close();
    assert!(pipeline.stats().memory.is_none());
    Ok(())
}

#[test]
fn output_names_follow_input_stem() -> anyhow::Result<()> {
    let fixture = Fixture::new()?;
    let pipeline = fixture.pipeline(true)?;

    assert_eq!(
        pipeline.output_path_for(Path::new("/somewhere/scan 03.jpeg")),
        fixture.path("out/scan 03_uncensored.jpeg")
    );
    Ok(())
}
