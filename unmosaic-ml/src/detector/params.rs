use std::fmt;

use serde::{Deserialize, Serialize};

/// Smallest accepted region area, in pixels.
pub const MIN_AREA_FLOOR: u32 = 25;
/// Upper bound on the derived minimum area so huge images still report
/// medium-sized censored regions.
pub const MIN_AREA_CEILING: u32 = 5_000;
/// Rungs per unit on the sensitivity ladder the detector accumulates over.
pub const SENSITIVITY_STEPS: u32 = 20;

/// Detection aggressiveness in `[0, 1]`. Higher values flag more pixels.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(from = "f32", into = "f32")]
pub struct Sensitivity(f32);

impl Sensitivity {
    pub const DEFAULT: Sensitivity = Sensitivity(0.5);

    /// Out-of-range values are clamped; NaN becomes the default.
    pub fn new(value: f32) -> Self {
        if value.is_nan() {
            Self::DEFAULT
        } else {
            Sensitivity(value.clamp(0.0, 1.0))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            s if s < 0.4 => "low",
            s if s < 0.7 => "medium",
            s if s < 0.9 => "high",
            _ => "very high",
        }
    }

    pub fn parameters(self) -> DetectionParameters {
        DetectionParameters::for_sensitivity(self)
    }

    /// Grid values from 0 up to this sensitivity, rounded down to the nearest
    /// `1 / SENSITIVITY_STEPS`.
    pub fn ladder(self) -> impl Iterator<Item = Sensitivity> {
        let steps = SENSITIVITY_STEPS as f32;
        // tolerance keeps 0.55 * 20 from flooring to 10
        let top = (self.0 * steps + 1e-3).floor() as u32;
        (0..=top).map(move |rung| Sensitivity(rung as f32 / steps))
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<f32> for Sensitivity {
    fn from(value: f32) -> Self {
        Sensitivity::new(value)
    }
}

impl From<Sensitivity> for f32 {
    fn from(value: Sensitivity) -> Self {
        value.0
    }
}

impl fmt::Display for Sensitivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Thresholds derived from a [`Sensitivity`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParameters {
    pub canny_low: f32,
    pub canny_high: f32,
    /// Radius of the box window used for edge density and local variance.
    pub window_radius: u32,
    /// Minimum fraction of edge pixels in the window.
    pub density_threshold: f32,
    /// Percentile of the variance map below which a pixel counts as uniform.
    pub variance_percentile: f32,
    pub kernel_radius: u8,
    pub min_area_fraction: f32,
    pub dilation_radius: u8,
    pub dilation_iterations: u32,
}

fn lerp(from: f32, to: f32, t: f32) -> f32 {
    from + (to - from) * t
}

impl DetectionParameters {
    pub fn for_sensitivity(sensitivity: Sensitivity) -> Self {
        let s = sensitivity.value();
        Self {
            canny_low: lerp(80.0, 20.0, s),
            canny_high: lerp(230.0, 70.0, s),
            window_radius: lerp(7.0, 4.0, s).round() as u32,
            density_threshold: lerp(0.20, 0.05, s),
            variance_percentile: lerp(0.50, 0.95, s),
            kernel_radius: lerp(3.0, 1.0, s).round() as u8,
            min_area_fraction: lerp(0.002, 0.0001, s),
            dilation_radius: lerp(3.0, 7.0, s).round() as u8,
            dilation_iterations: 1 + (2.0 * s).round() as u32,
        }
    }

    /// Minimum region area for a `width` x `height` image.
    pub fn min_area(&self, width: u32, height: u32) -> u32 {
        let area = f64::from(width) * f64::from(height);
        let scaled = (area * f64::from(self.min_area_fraction)).round() as u32;
        scaled.clamp(MIN_AREA_FLOOR, MIN_AREA_CEILING)
    }

    /// Pixels the final mask grows by on each side.
    pub fn expansion(&self) -> u32 {
        u32::from(self.dilation_radius) * self.dilation_iterations
    }
}
