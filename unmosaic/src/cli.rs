use std::path::PathBuf;

use clap::Parser;
use unmosaic_ml::{Device, MaxResolution, ModelKind};

#[derive(Debug, Parser)]
#[command(version, about = "Detect mosaic censorship and inpaint it away")]
pub struct Cli {
    #[arg(short, long, value_name = "FILE", help = "Image to process")]
    pub input: Option<PathBuf>,

    #[arg(
        short,
        long,
        value_name = "FILE",
        requires = "input",
        help = "Output path for --input (default: <output-dir>/<stem>_uncensored.<ext>)"
    )]
    pub output: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        conflicts_with = "input",
        help = "Process every image in a directory (not recursive)"
    )]
    pub input_dir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Directory for processed images")]
    pub output_dir: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE", requires = "input", help = "Mask for --input")]
    pub mask: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Directory holding <stem>_mask.<ext> files for batch runs"
    )]
    pub mask_dir: Option<PathBuf>,

    #[arg(long, help = "Require explicit masks instead of detecting censorship")]
    pub no_auto_detect: bool,

    #[arg(short, long, value_name = "0.0-1.0", help = "Detection sensitivity")]
    pub sensitivity: Option<f32>,

    #[arg(
        long,
        value_name = "PIXELS",
        help = "Longest side fed to the model, or `unbounded`"
    )]
    pub max_resolution: Option<MaxResolution>,

    #[arg(long, value_name = "DEVICE", help = "cpu (default), cuda or mps")]
    pub device: Option<Device>,

    #[arg(long, value_name = "MODEL", help = "Inpainting model")]
    pub model: Option<ModelKind>,

    #[arg(long, value_name = "URL", help = "Download weights from this URL instead")]
    pub model_url: Option<String>,

    #[arg(long, value_name = "DIR", help = "Model cache directory")]
    pub cache_dir: Option<PathBuf>,

    #[arg(long, value_name = "URL", help = "Hugging Face mirror endpoint")]
    pub hf_endpoint: Option<String>,

    #[arg(long, value_name = "N", help = "Inference threads")]
    pub threads: Option<usize>,

    #[arg(long, help = "Favor speed over memory: arenas, memory patterns, all cores")]
    pub high_memory: bool,

    #[arg(short, long, value_name = "FILE", help = "TOML configuration file")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable debug logging")]
    pub verbose: bool,

    #[arg(long, help = "Print pipeline statistics as JSON")]
    pub stats: bool,

    #[arg(long, help = "Delete cached model weights")]
    pub clear_cache: bool,
}
