pub mod error;
pub mod hf_hub;
pub mod http;
pub mod progress;
pub mod store;

pub use error::{BoxError, Error, Result};
pub use store::{ModelSource, ModelStore};
