//! Mosaic (pixelation) detection.
//!
//! A mosaic block is flat inside and bounded by sharp, regularly spaced
//! seams. The detector looks for areas dense in edges whose interiors are
//! nevertheless uniform, cleans the candidates up with morphology, drops
//! small components and grows the rest into an inpainting mask.
//!
//! Candidates are collected at every rung of the sensitivity ladder up to
//! the requested value, so raising sensitivity never shrinks the mask.

mod params;

use image::{DynamicImage, GenericImageView, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::{box_filter, laplacian_filter};
use imageproc::morphology::{close, dilate, open};
use imageproc::region_labelling::{Connectivity, connected_components};
use tracing::{debug, info};
use unmosaic_core::{Error, Result};

pub use params::{
    DetectionParameters, MIN_AREA_CEILING, MIN_AREA_FLOOR, SENSITIVITY_STEPS, Sensitivity,
};

/// Lowest variance cutoff. Keeps perfectly flat blocks (zero variance)
/// eligible even when most of the image is flat too.
const VARIANCE_FLOOR: u8 = 12;
/// Laplacian responses this close to an edge belong to the seam, not to the
/// block interior.
const SEAM_MARGIN: u8 = 2;

#[derive(Debug, Clone)]
pub struct Detection {
    /// 255 where inpainting should happen, 0 elsewhere.
    pub mask: GrayImage,
    /// Number of connected regions that survived filtering.
    pub regions: usize,
    /// Share of the image covered by the mask, in percent.
    pub coverage: f32,
}

impl Detection {
    pub fn flagged_pixels(&self) -> u64 {
        self.mask.pixels().filter(|p| p[0] > 0).count() as u64
    }
}

/// Find mosaic-censored regions in `image`.
///
/// Returns `Ok(None)` when nothing is flagged. `min_area` overrides the
/// minimum region size derived from the image dimensions.
pub fn detect(
    image: &DynamicImage,
    sensitivity: Sensitivity,
    min_area: Option<u32>,
) -> Result<Option<Detection>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::Detection(format!(
            "cannot analyse a {width}x{height} image"
        )));
    }

    let params = sensitivity.parameters();
    debug!(%sensitivity, label = sensitivity.label(), ?params, "detecting censored regions");

    let gray = image.to_luma8();
    let laplacian = laplacian_magnitude(&gray);
    let mut candidates = GrayImage::new(width, height);
    for rung in sensitivity.ladder() {
        let found = candidate_regions(&gray, &laplacian, &rung.parameters());
        for (merged, pixel) in candidates.pixels_mut().zip(found.pixels()) {
            merged[0] = merged[0].max(pixel[0]);
        }
    }

    let min_area = min_area.unwrap_or_else(|| params.min_area(width, height));
    let (mut mask, regions) = keep_large_regions(&candidates, min_area);
    if regions == 0 {
        info!("no censored regions detected");
        return Ok(None);
    }

    for _ in 0..params.dilation_iterations {
        mask = dilate(&mask, Norm::LInf, params.dilation_radius);
    }

    let flagged = mask.pixels().filter(|p| p[0] > 0).count();
    let coverage = (flagged as f64 * 100.0 / (f64::from(width) * f64::from(height))) as f32;
    info!(
        regions,
        min_area,
        "detected censored area: {flagged} pixels ({coverage:.2}%)"
    );

    Ok(Some(Detection {
        mask,
        regions,
        coverage,
    }))
}

/// Edge-dense, internally uniform pixels for one parameter set, after
/// close/open cleanup.
fn candidate_regions(
    gray: &GrayImage,
    laplacian: &GrayImage,
    params: &DetectionParameters,
) -> GrayImage {
    let edges = canny(gray, params.canny_low, params.canny_high);
    let radius = params.window_radius;
    let density = box_filter(&edges, radius, radius);
    let variance = interior_variance(laplacian, &edges, radius);
    let variance_cutoff = percentile(&variance, params.variance_percentile).max(VARIANCE_FLOOR);

    let candidates = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let dense = f32::from(density.get_pixel(x, y)[0]) / 255.0 > params.density_threshold;
        let uniform = variance.get_pixel(x, y)[0] <= variance_cutoff;
        Luma([if dense && uniform { 255 } else { 0 }])
    });

    let k = params.kernel_radius;
    open(&close(&candidates, Norm::LInf, k), Norm::LInf, k)
}

/// Absolute Laplacian response, saturated to `u8`.
fn laplacian_magnitude(gray: &GrayImage) -> GrayImage {
    let laplacian = laplacian_filter(gray);
    GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([laplacian.get_pixel(x, y)[0].unsigned_abs().min(255) as u8])
    })
}

/// Local mean of the Laplacian magnitude with seam pixels suppressed, so a
/// mosaic block reads as flat even though its borders are sharp.
fn interior_variance(laplacian: &GrayImage, edges: &GrayImage, radius: u32) -> GrayImage {
    let seams = dilate(edges, Norm::LInf, SEAM_MARGIN);
    let interior = GrayImage::from_fn(laplacian.width(), laplacian.height(), |x, y| {
        if seams.get_pixel(x, y)[0] > 0 {
            Luma([0])
        } else {
            *laplacian.get_pixel(x, y)
        }
    });
    box_filter(&interior, radius, radius)
}

/// Value at fraction `p` of the sorted pixel intensities.
fn percentile(map: &GrayImage, p: f32) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in map.pixels() {
        histogram[usize::from(pixel[0])] += 1;
    }

    let total = u64::from(map.width()) * u64::from(map.height());
    let rank = ((f64::from(p.clamp(0.0, 1.0)) * total as f64).ceil() as u64).max(1);
    let mut seen = 0;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= rank {
            return value as u8;
        }
    }
    u8::MAX
}

/// Drop 8-connected foreground components smaller than `min_area`.
fn keep_large_regions(binary: &GrayImage, min_area: u32) -> (GrayImage, usize) {
    let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));
    let label_count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;

    let mut areas = vec![0u32; label_count + 1];
    for pixel in labels.pixels() {
        areas[pixel[0] as usize] += 1;
    }

    let keep: Vec<bool> = areas
        .iter()
        .enumerate()
        .map(|(label, &area)| label != 0 && area >= min_area)
        .collect();
    let regions = keep.iter().filter(|&&kept| kept).count();

    let mask = GrayImage::from_fn(binary.width(), binary.height(), |x, y| {
        let label = labels.get_pixel(x, y)[0] as usize;
        Luma([if keep[label] { 255 } else { 0 }])
    });
    (mask, regions)
}
