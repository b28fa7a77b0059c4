use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::hf_hub::hf_download;
use crate::http::{download_to, partial_path};
use crate::{Error, Result};

/// Where a weights file comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSource {
    Url { url: String, filename: String },
    HfHub { repo: String, filename: String },
}

impl ModelSource {
    pub fn url(url: impl Into<String>, filename: impl Into<String>) -> Self {
        ModelSource::Url {
            url: url.into(),
            filename: filename.into(),
        }
    }

    pub fn hf_hub(repo: impl Into<String>, filename: impl Into<String>) -> Self {
        ModelSource::HfHub {
            repo: repo.into(),
            filename: filename.into(),
        }
    }

    /// Name of the file inside the cache root.
    pub fn filename(&self) -> &str {
        match self {
            ModelSource::Url { filename, .. } | ModelSource::HfHub { filename, .. } => filename,
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Url { url, .. } => write!(f, "{url}"),
            ModelSource::HfHub { repo, filename } => write!(f, "{repo}/{filename}"),
        }
    }
}

/// Flat on-disk cache of model weights.
///
/// A file already present under the root is returned as is, so weights are
/// downloaded at most once per cache directory.
#[derive(Debug, Clone)]
pub struct ModelStore {
    root: PathBuf,
    hf_endpoint: Option<String>,
}

impl ModelStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            hf_endpoint: None,
        })
    }

    /// Use a Hugging Face mirror instead of the official endpoint.
    pub fn with_hf_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.hf_endpoint = endpoint;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn fetch(&self, source: &ModelSource) -> Result<PathBuf> {
        let dest = self.path_for(source.filename());
        if dest.exists() {
            info!("model already cached: {}", dest.display());
            return Ok(dest);
        }

        fs::create_dir_all(&self.root)?;
        info!("downloading model from {source}");

        match source {
            ModelSource::Url { url, filename } => {
                download_to(url, &dest).map_err(|err| Error::fetch(filename, err))?;
            }
            ModelSource::HfHub { repo, filename } => {
                let downloaded = hf_download(
                    &self.root.join("hub"),
                    self.hf_endpoint.as_deref(),
                    repo,
                    filename,
                )
                .map_err(|err| Error::fetch(filename, err))?;
                self.install(&downloaded, &dest)
                    .map_err(|err| Error::fetch(filename, err))?;
            }
        }

        info!("model downloaded: {}", dest.display());
        Ok(dest)
    }

    /// Copy a file into the flat cache layout without exposing a half-written
    /// destination.
    fn install(&self, from: &Path, dest: &Path) -> std::io::Result<()> {
        let partial = partial_path(dest);
        if let Err(err) = fs::copy(from, &partial).and_then(|_| fs::rename(&partial, dest)) {
            let _ = fs::remove_file(&partial);
            return Err(err);
        }
        Ok(())
    }

    /// Total bytes of regular files under the cache root.
    pub fn size(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        } else {
            warn!("cache root {} did not exist", self.root.display());
        }
        fs::create_dir_all(&self.root)?;
        info!("model cache cleared");
        Ok(())
    }
}
