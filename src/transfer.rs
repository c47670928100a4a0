use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::BROWSER_USER_AGENT;
use crate::scrape::filename_from_uri;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "webm", "mov", "m4v"];

/// Percent boundaries forwarded to the user-facing progress callback.
const CALLBACK_BOUNDARIES: [u8; 3] = [25, 50, 75];

/// Without a content-length there is no percent; log raw byte marks instead.
const BYTE_MARK_STEP: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("staging i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// A completed download sitting in the staging area. Ownership moves to the
/// caller, who must remove the file once it has been forwarded.
#[derive(Debug)]
pub struct StagedFile {
    pub path: PathBuf,
    pub filename: String,
    pub bytes_total: u64,
}

pub struct TransferPipeline {
    http: reqwest::Client,
    staging_dir: PathBuf,
}

impl TransferPipeline {
    pub fn new(staging_dir: PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        // The upstream file hosts present broken certificate chains; cert
        // validation stays off for this client only. A whole-request
        // timeout would kill multi-gigabyte downloads, so only the connect
        // and per-chunk read phases are bounded.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .user_agent(BROWSER_USER_AGENT)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self { http, staging_dir })
    }

    /// Stream `uri` into a uniquely named staging file. `on_progress` fires
    /// at most once per 25% boundary and must not block; it is invoked
    /// inline on the data path.
    pub async fn download(
        &self,
        uri: &str,
        label: &str,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<StagedFile, TransferError> {
        fs::create_dir_all(&self.staging_dir).await?;
        let filename = staging_filename(uri, label);
        let path = self
            .staging_dir
            .join(format!("{}-{}", Utc::now().timestamp_millis(), filename));
        info!(uri, file = %filename, "transfer started");

        match self.stream_to(uri, &path, on_progress).await {
            Ok(bytes_total) => {
                info!(bytes_total, file = %filename, "transfer complete");
                Ok(StagedFile {
                    path,
                    filename,
                    bytes_total,
                })
            }
            Err(e) => {
                // Never leak a partial staging file.
                if let Err(cleanup) = fs::remove_file(&path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %cleanup, "failed to remove partial staging file");
                    }
                }
                Err(e)
            }
        }
    }

    async fn stream_to(
        &self,
        uri: &str,
        path: &Path,
        on_progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<u64, TransferError> {
        let resp = self.http.get(uri).send().await?.error_for_status()?;
        let mut gate = ProgressGate::new(resp.content_length());
        let mut file = fs::File::create(path).await?;
        let mut stream = resp.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            for boundary in gate.advance(downloaded) {
                on_progress(boundary);
            }
        }
        file.flush().await?;
        Ok(downloaded)
    }
}

/// Throttle for progress reporting: each 25% boundary reaches the callback
/// exactly once and in order, deciles go to the log, and with an unknown
/// total only coarse byte marks are logged (the callback never fires, since
/// percent is undefined).
struct ProgressGate {
    total: Option<u64>,
    next_boundary: usize,
    last_decile: u64,
    next_byte_mark: u64,
}

impl ProgressGate {
    fn new(total: Option<u64>) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            next_boundary: 0,
            last_decile: 0,
            next_byte_mark: BYTE_MARK_STEP,
        }
    }

    /// Callback boundaries newly crossed by reaching `downloaded` bytes.
    fn advance(&mut self, downloaded: u64) -> Vec<u8> {
        let Some(total) = self.total else {
            if downloaded >= self.next_byte_mark {
                debug!(downloaded, "download progress");
                while self.next_byte_mark <= downloaded {
                    self.next_byte_mark += BYTE_MARK_STEP;
                }
            }
            return Vec::new();
        };

        let percent = (downloaded.min(total) * 100 / total) as u8;
        let decile = u64::from(percent) / 10;
        if decile > self.last_decile {
            self.last_decile = decile;
            debug!(percent, "download progress");
        }

        let mut crossed = Vec::new();
        while self.next_boundary < CALLBACK_BOUNDARIES.len()
            && percent >= CALLBACK_BOUNDARIES[self.next_boundary]
        {
            crossed.push(CALLBACK_BOUNDARIES[self.next_boundary]);
            self.next_boundary += 1;
        }
        crossed
    }
}

/// Filename for the staged artifact: the URI's path tail with the query
/// dropped, or a sanitized label when the URI has no usable tail, with the
/// extension forced to a known video container.
fn staging_filename(uri: &str, label: &str) -> String {
    let base = filename_from_uri(uri).unwrap_or_else(|| sanitize(label));
    ensure_video_extension(base)
}

fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

fn ensure_video_extension(name: String) -> String {
    let known = name
        .rsplit('.')
        .next()
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    if known {
        name
    } else {
        format!("{name}.mp4")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed a 100 MB transfer through in 1 MB chunks and collect what the
    /// callback would see.
    #[test]
    fn test_progress_boundaries_reported_once_each() {
        let total = 100 * 1024 * 1024u64;
        let chunk = 1024 * 1024u64;
        let mut gate = ProgressGate::new(Some(total));
        let mut reported = Vec::new();
        let mut downloaded = 0;
        while downloaded < total {
            downloaded += chunk;
            reported.extend(gate.advance(downloaded));
        }
        assert_eq!(reported, vec![25, 50, 75]);
    }

    #[test]
    fn test_progress_big_jump_reports_skipped_boundaries_in_order() {
        let mut gate = ProgressGate::new(Some(100));
        assert_eq!(gate.advance(60), vec![25, 50]);
        assert_eq!(gate.advance(60), Vec::<u8>::new());
        assert_eq!(gate.advance(100), vec![75]);
    }

    #[test]
    fn test_progress_unknown_total_never_fires_callback() {
        let mut gate = ProgressGate::new(None);
        assert!(gate.advance(BYTE_MARK_STEP * 3).is_empty());
        assert!(gate.advance(BYTE_MARK_STEP * 30).is_empty());
    }

    #[test]
    fn test_progress_zero_total_treated_as_unknown() {
        let mut gate = ProgressGate::new(Some(0));
        assert!(gate.advance(1024).is_empty());
    }

    #[test]
    fn test_staging_filename_from_uri_tail() {
        let name = staging_filename("https://cdn.example/a/file123.mp4?sig=xyz", "ignored");
        assert_eq!(name, "file123.mp4");
    }

    #[test]
    fn test_staging_filename_normalizes_extension() {
        let name = staging_filename("https://cdn.example/a/file123.part1", "ignored");
        assert_eq!(name, "file123.part1.mp4");
        let name = staging_filename("https://cdn.example/a/Movie.MKV", "ignored");
        assert_eq!(name, "Movie.MKV");
    }

    #[test]
    fn test_staging_filename_falls_back_to_label() {
        let name = staging_filename("https://cdn.example/", "Inception 1080p");
        assert_eq!(name, "Inception_1080p.mp4");
    }
}
