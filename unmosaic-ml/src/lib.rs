pub mod detector;
pub mod device;
pub mod engine;
pub mod lama;
pub mod model;
pub mod runtime;

pub use detector::{Detection, DetectionParameters, SENSITIVITY_STEPS, Sensitivity, detect};
pub use device::{Device, MemoryUsage};
pub use engine::{EngineOptions, EngineState, InpaintEngine, InpaintModel, MaxResolution, ModelLoader};
pub use lama::{Lama, LamaLoader};
pub use model::{MemoryEstimate, ModelKind};
pub use runtime::RuntimeConfig;
