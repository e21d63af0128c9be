//! Input resolution: turn user-supplied files, URLs or uploaded bytes into
//! [`Upload`]s whose kind is known.
//!
//! The kind is decided from magic bytes, never from the file name or the
//! multipart content type, both of which browsers and users get wrong. An
//! upload that is neither a PDF nor a PNG/JPEG is rejected here, before any
//! rendering or model call happens.

use crate::error::ExtractError;
use std::path::PathBuf;
use tracing::{debug, info};

/// What an upload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Pdf,
    Png,
    Jpeg,
}

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    /// Classify the upload by its leading bytes.
    pub fn kind(&self) -> Result<UploadKind, ExtractError> {
        sniff(&self.name, &self.bytes)
    }
}

/// Classify bytes as PDF, PNG or JPEG.
pub fn sniff(name: &str, bytes: &[u8]) -> Result<UploadKind, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::EmptyUpload {
            detail: format!("'{name}' has no content"),
        });
    }
    if bytes.starts_with(b"%PDF") {
        return Ok(UploadKind::Pdf);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Ok(UploadKind::Png);
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Ok(UploadKind::Jpeg);
    }
    Err(ExtractError::UnsupportedUpload {
        name: name.to_string(),
        magic: bytes.iter().take(4).copied().collect(),
    })
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve a path or URL into an [`Upload`], validating its kind.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<Upload, ExtractError> {
    let upload = if is_url(input) {
        download_url(input, timeout_secs).await?
    } else {
        read_local(input).await?
    };
    upload.kind()?;
    Ok(upload)
}

async fn read_local(path_str: &str) -> Result<Upload, ExtractError> {
    let path = PathBuf::from(path_str);
    if path_str.trim().is_empty() {
        return Err(ExtractError::InvalidInput {
            input: path_str.to_string(),
        });
    }

    let bytes = tokio::fs::read(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => ExtractError::PermissionDenied { path: path.clone() },
        _ => ExtractError::FileNotFound { path: path.clone() },
    })?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path_str.to_string());
    debug!("Read local input: {} ({} bytes)", path.display(), bytes.len());
    Ok(Upload::new(name, bytes))
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<Upload, ExtractError> {
    info!("Downloading invoice from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ExtractError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            ExtractError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ExtractError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    info!("Downloaded {} bytes", bytes.len());
    Ok(Upload::new(filename_from_url(url), bytes.to_vec()))
}

/// Last path segment of the URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded".to_string()
}
