use std::path::PathBuf;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Network or cache failure while acquiring model weights. Retryable.
    #[error("failed to fetch model {name}: {source}")]
    ModelFetch {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to load model {name}: {source}")]
    ModelLoad {
        name: String,
        #[source]
        source: BoxError,
    },

    /// The model cannot run on the resolved device.
    #[error("model cannot run on {device}: {detail}\n{remediation}")]
    DeviceCompatibility {
        device: String,
        detail: String,
        remediation: &'static str,
    },

    #[error("censorship detection failed: {0}")]
    Detection(String),

    #[error("inpainting failed: {source}")]
    Inpaint {
        #[source]
        source: BoxError,
    },

    #[error("no mask provided and auto-detect disabled")]
    InvalidMaskConfiguration,

    #[error("mask is {}x{} but image is {}x{}", mask.0, mask.1, image.0, image.1)]
    MaskMismatch { image: (u32, u32), mask: (u32, u32) },

    #[error("failed to load image from {path}: {source}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to save image to {path}: {source}")]
    ImageSave {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// The engine hit an unrecoverable load error earlier and refuses new work.
    #[error("inpainting engine is unavailable: {0}")]
    EngineUnavailable(String),

    #[error("unknown device `{0}` (expected cuda, mps or cpu)")]
    UnknownDevice(String),

    #[error("unknown model `{0}` (expected lama)")]
    UnknownModel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn fetch(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::ModelFetch {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn load(name: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::ModelLoad {
            name: name.into(),
            source: source.into(),
        }
    }

    pub fn inpaint(source: impl Into<BoxError>) -> Self {
        Error::Inpaint {
            source: source.into(),
        }
    }

    /// Load failures that leave the engine permanently unusable.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Error::ModelLoad { .. } | Error::DeviceCompatibility { .. }
        )
    }
}
