use std::path::{Path, PathBuf};

use hf_hub::{Cache, Repo, api::sync::ApiBuilder};

/// Download `filename` from a Hugging Face model repo into the hf-hub cache
/// layout under `cache_dir`, returning the snapshot path.
pub fn hf_download(
    cache_dir: &Path,
    endpoint: Option<&str>,
    repo: &str,
    filename: &str,
) -> anyhow::Result<PathBuf> {
    let hf_repo = Repo::model(repo.to_string());

    // hit the cache first
    if let Some(path) = Cache::new(cache_dir.to_path_buf())
        .repo(hf_repo.clone())
        .get(filename)
    {
        return Ok(path);
    }

    let span = tracing::info_span!("hf_download", repo, filename);
    let _enter = span.enter();

    let mut builder = ApiBuilder::new()
        .with_cache_dir(cache_dir.to_path_buf())
        .with_progress(true);
    if let Some(endpoint) = endpoint {
        builder = builder.with_endpoint(endpoint.to_string());
    }

    let path = builder.build()?.repo(hf_repo).get(filename)?;
    Ok(path)
}
