use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumProperty, EnumString};
use unmosaic_core::{Error, ModelSource, Result};

use crate::Device;

/// Supported inpainting architectures.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Display,
    EnumString,
    EnumIter,
    EnumProperty,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    #[default]
    #[strum(props(repo = "mayocream/lama-manga-onnx", filename = "lama-manga.onnx"))]
    Lama,
}

impl ModelKind {
    pub fn parse(name: &str) -> Result<Self> {
        name.parse()
            .map_err(|_| Error::UnknownModel(name.to_string()))
    }

    /// Published weights for this architecture.
    pub fn default_source(self) -> ModelSource {
        let repo = self.get_str("repo").expect("repo property");
        let filename = self.get_str("filename").expect("filename property");
        ModelSource::hf_hub(repo, filename)
    }

    /// Expected footprint in megabytes on `device`.
    pub fn memory_estimate(self, device: Device) -> MemoryEstimate {
        match (self, device) {
            (ModelKind::Lama, Device::Cuda | Device::CoreMl) => MemoryEstimate {
                model_mb: 2048,
                inference_mb: 2048,
            },
            (ModelKind::Lama, Device::Cpu) => MemoryEstimate {
                model_mb: 1024,
                inference_mb: 4096,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryEstimate {
    pub model_mb: u64,
    pub inference_mb: u64,
}

impl MemoryEstimate {
    pub fn total_mb(&self) -> u64 {
        self.model_mb + self.inference_mb
    }
}
