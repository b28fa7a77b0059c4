use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use unmosaic_core::ModelStore;
use unmosaic_pipeline::{ProcessingResult, Uncensor};
use walkdir::WalkDir;

use crate::cli::Cli;
use crate::config::Config;

/// Raster formats picked up by `--input-dir`.
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "bmp"];

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();
}

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    }
    .with_overrides(&cli);

    if cli.clear_cache {
        let store = ModelStore::new(config.cache_dir())?;
        store.clear()?;
        info!("cleared model cache at {}", store.root().display());
        if cli.input.is_none() && cli.input_dir.is_none() && !cli.stats {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let mut uncensor = Uncensor::new(config.into_options())?;

    let succeeded = match (&cli.input, &cli.input_dir) {
        (Some(input), _) => {
            match uncensor.process_one(input, cli.mask.as_deref(), cli.output.as_deref())? {
                ProcessingResult::Completed { output, elapsed } => {
                    info!(
                        "wrote {} in {:.1}s",
                        output.display(),
                        elapsed.as_secs_f64()
                    );
                    true
                }
                ProcessingResult::NoDetection => {
                    info!("nothing to repair in {}", input.display());
                    true
                }
                ProcessingResult::Failed { reason } => {
                    warn!("{}: {reason}", input.display());
                    false
                }
            }
        }
        (None, Some(dir)) => {
            let paths = collect_images(dir)?;
            if paths.is_empty() {
                warn!("no images found in {}", dir.display());
            }
            let batch = uncensor.process_batch(&paths, cli.mask_dir.as_deref())?;
            for path in &batch.failed {
                warn!("failed: {}", path.display());
            }
            if cli.stats {
                println!("{}", serde_json::to_string_pretty(&batch)?);
            }
            batch.failed.is_empty()
        }
        (None, None) if cli.stats => true,
        (None, None) => bail!("nothing to do: pass --input, --input-dir or --stats"),
    };

    if cli.stats {
        println!("{}", serde_json::to_string_pretty(&uncensor.stats())?);
    }
    uncensor.close();

    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Images directly inside `dir`, sorted by file name.
fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}
