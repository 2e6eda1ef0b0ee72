//! Utility functions
//!
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use reqwest::{header, Client};
use tokio::{fs::File, io::AsyncWriteExt};
use unicode_normalization::UnicodeNormalization;

/// Download a file from a URL to a given filepath.
///
/// The content is written to `<filepath>.part` first and moved into place once complete, so an
/// interrupted download never leaves a truncated file at `filepath`.
pub async fn download_file(client: &Client, url: &str, filepath: impl AsRef<Path>) -> Result<()> {
    let filepath = filepath.as_ref();
    let temp_path = part_path(filepath);

    let res = fetch_into(client, url, &temp_path).await;
    if res.is_err() {
        tokio::fs::remove_file(&temp_path).await.ok();
        return res;
    }

    tokio::fs::rename(&temp_path, filepath)
        .await
        .with_context(|| format!("failed to move download to {}", filepath.display()))?;

    Ok(())
}

/// `filepath` with `.part` appended to its file name.
fn part_path(filepath: &Path) -> PathBuf {
    let mut name = filepath
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(".part");
    filepath.with_file_name(name)
}

async fn fetch_into(client: &Client, url: &str, filepath: &Path) -> Result<()> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("failed to request {url}"))?
        .error_for_status()?;

    // File hosts answer with an HTML page instead of the file for some errors
    let is_html = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("text/html"))
        .unwrap_or(false);
    if is_html {
        bail!("{url} returned an HTML page instead of a file");
    }

    let total = resp.content_length();
    let mut file = File::create(filepath)
        .await
        .with_context(|| format!("failed to create {}", filepath.display()))?;

    let mut downloaded: u64 = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
    }
    file.flush().await?;

    log::info!(
        "Downloaded {} bytes{}",
        downloaded,
        total.map(|t| format!(" of {t}")).unwrap_or_default()
    );

    Ok(())
}

/// Turn a client supplied filename into one that is safe to use on the local file system.
///
/// Accented letters are decomposed to their ASCII base letter (NFKD), other non-ASCII characters
/// are dropped. Path separators become spaces, whitespace runs become `_`, everything besides
/// ASCII alphanumerics, `_`, `.` and `-` is dropped, as are leading and trailing dots and
/// underscores. The result may be empty.
pub fn secure_filename(filename: &str) -> String {
    let filename: String = filename.nfkd().filter(char::is_ascii).collect();
    let filename = filename.replace(&['/', '\\'][..], " ");
    let joined = filename
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");

    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c: char| c == '.' || c == '_')
        .to_owned()
}

/// MIME type of a file served from the static directory.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match extension.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("html") => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}
