mod pipeline;

pub use pipeline::{
    BatchResult, MASK_EXTENSIONS, ProcessingResult, Stats, Uncensor, UncensorOptions,
    default_cache_dir,
};
