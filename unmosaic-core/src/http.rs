use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::progress::download_bar;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

static HTTP_CLIENT: Lazy<reqwest::blocking::Client> = Lazy::new(|| {
    reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .expect("build reqwest client")
});

pub fn http_client() -> &'static reqwest::blocking::Client {
    &HTTP_CLIENT
}

/// Path used while a download is in flight.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Stream `url` into `dest`, going through a `.part` file so that `dest` only
/// ever holds a complete body. The partial file is removed on failure.
#[tracing::instrument(level = "info", skip(dest), fields(dest = %dest.display()))]
pub fn download_to(url: &str, dest: &Path) -> anyhow::Result<u64> {
    let partial = partial_path(dest);
    match stream_into(url, &partial) {
        Ok(bytes) => {
            fs::rename(&partial, dest)?;
            Ok(bytes)
        }
        Err(err) => {
            if partial.exists() {
                let _ = fs::remove_file(&partial);
            }
            Err(err)
        }
    }
}

fn stream_into(url: &str, partial: &Path) -> anyhow::Result<u64> {
    let mut response = http_client().get(url).send()?.error_for_status()?;
    let total = response.content_length();

    let filename = url.split('/').next_back().unwrap_or(url);
    let pb = download_bar(filename, total);

    debug!(%url, ?total, "streaming model weights");

    let file = File::create(partial)?;
    let mut writer = pb.wrap_write(BufWriter::new(file));
    let written = io::copy(&mut response, &mut writer)?;
    writer.flush()?;
    pb.finish_and_clear();

    if let Some(total) = total {
        anyhow::ensure!(
            written == total,
            "connection closed after {written} of {total} bytes"
        );
    }

    Ok(written)
}
