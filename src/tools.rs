use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

static MEDIA_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^https?://(?:www\.|m\.)?(?:youtube\.com|youtu\.be|instagram\.com|tiktok\.com|twitter\.com|x\.com|facebook\.com)/\S+",
    )
    .expect("media url pattern")
});

/// Whether the text is a share link one of the external fetchers understands.
pub fn is_media_url(text: &str) -> bool {
    MEDIA_URL_RE.is_match(text.trim())
}

#[derive(Debug, Error)]
pub enum MediaFetchError {
    #[error("the media fetcher is not installed on this host")]
    NotInstalled,
    #[error("that media is private or protected")]
    Private,
    #[error("that media is unavailable")]
    Unavailable,
    #[error("that media is age-restricted")]
    AgeRestricted,
    #[error("that media is blocked for copyright reasons")]
    CopyrightBlocked,
    #[error("media fetch failed: {0}")]
    Other(String),
}

#[derive(Debug)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub title: String,
}

/// Adapters around the external executables the bot shells out to: yt-dlp
/// for share links, ffmpeg for sticker transcodes, rembg for background
/// removal. Each is an opaque request/response collaborator; all staging
/// artifacts they create are removed by their caller or on their own
/// failure paths.
pub struct ExternalTools {
    staging_dir: PathBuf,
}

impl ExternalTools {
    pub fn new(staging_dir: PathBuf) -> Self {
        Self { staging_dir }
    }

    /// Fetch a share link into the staging area via yt-dlp, returning the
    /// downloaded file and its display title.
    pub async fn fetch_media(
        &self,
        url: &str,
        audio_only: bool,
    ) -> Result<FetchedMedia, MediaFetchError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| MediaFetchError::Other(e.to_string()))?;
        let template = self
            .staging_dir
            .join(format!("{}-%(title)s.%(ext)s", Utc::now().timestamp_millis()));

        let mut cmd = Command::new("yt-dlp");
        cmd.arg("--no-playlist")
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--print")
            .arg("title")
            .arg("-o")
            .arg(&template);
        if audio_only {
            cmd.arg("-x").arg("--audio-format").arg("mp3");
        }
        cmd.arg(url);

        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MediaFetchError::NotInstalled
                } else {
                    MediaFetchError::Other(e.to_string())
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(url, stderr = %stderr, "media fetch failed");
            return Err(classify_fetch_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
        let path = lines
            .next()
            .map(PathBuf::from)
            .ok_or_else(|| MediaFetchError::Other("fetcher reported no output file".into()))?;
        let title = lines.next().unwrap_or("media").to_string();
        info!(url, title = %title, "media fetched");
        Ok(FetchedMedia { path, title })
    }

    /// Transcode an image or short clip into a webp sticker.
    pub async fn make_sticker(&self, input: &[u8], animated: bool) -> Result<Vec<u8>> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let stamp = Utc::now().timestamp_millis();
        let in_path = self.staging_dir.join(format!("{stamp}-sticker-in"));
        let out_path = self.staging_dir.join(format!("{stamp}-sticker.webp"));
        tokio::fs::write(&in_path, input).await?;

        let result = run_ffmpeg_sticker(&in_path, &out_path, animated).await;
        let _ = tokio::fs::remove_file(&in_path).await;
        match result {
            Ok(()) => {
                let bytes = tokio::fs::read(&out_path).await;
                let _ = tokio::fs::remove_file(&out_path).await;
                bytes.context("sticker output unreadable")
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&out_path).await;
                Err(e)
            }
        }
    }

    /// Strip an image's background, falling back to CPU when the GPU path
    /// reports a failure.
    pub async fn remove_background(&self, input: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let out_path = self
            .staging_dir
            .join(format!("{}-nobg.png", Utc::now().timestamp_millis()));

        match run_rembg(input, &out_path, false).await {
            Ok(()) => Ok(out_path),
            Err(stderr) if is_gpu_failure(&stderr) => {
                warn!("background removal hit a GPU failure; retrying on CPU");
                run_rembg(input, &out_path, true)
                    .await
                    .map_err(|e| anyhow::anyhow!("background removal failed: {e}"))?;
                Ok(out_path)
            }
            Err(stderr) => Err(anyhow::anyhow!("background removal failed: {stderr}")),
        }
    }
}

async fn run_ffmpeg_sticker(input: &Path, output: &Path, animated: bool) -> Result<()> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-y").arg("-i").arg(input);
    if animated {
        cmd.args([
            "-vcodec",
            "libwebp",
            "-vf",
            "scale=512:512:force_original_aspect_ratio=decrease,fps=15",
            "-loop",
            "0",
            "-an",
        ]);
    } else {
        cmd.args([
            "-vcodec",
            "libwebp",
            "-vf",
            "scale=512:512:force_original_aspect_ratio=decrease",
            "-frames:v",
            "1",
            "-an",
        ]);
    }
    cmd.arg(output);

    let out = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to launch ffmpeg")?;
    if !out.status.success() {
        anyhow::bail!(
            "ffmpeg exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr)
        );
    }
    Ok(())
}

/// Returns stderr text on failure so the caller can classify it.
async fn run_rembg(input: &Path, output: &Path, force_cpu: bool) -> Result<(), String> {
    let mut cmd = Command::new("rembg");
    cmd.arg("i").arg(input).arg(output);
    if force_cpu {
        cmd.env("CUDA_VISIBLE_DEVICES", "-1");
    }
    let out = cmd
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if out.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&out.stderr).into_owned())
    }
}

fn classify_fetch_failure(stderr: &str) -> MediaFetchError {
    let s = stderr.to_lowercase();
    if s.contains("private video") || s.contains("this video is private") || s.contains("login required")
    {
        MediaFetchError::Private
    } else if s.contains("sign in to confirm your age") || s.contains("age-restricted") {
        MediaFetchError::AgeRestricted
    } else if s.contains("copyright") {
        MediaFetchError::CopyrightBlocked
    } else if s.contains("video unavailable") || s.contains("is not available") {
        MediaFetchError::Unavailable
    } else {
        let last_line = stderr
            .trim()
            .lines()
            .last()
            .unwrap_or("unknown failure")
            .to_string();
        MediaFetchError::Other(last_line)
    }
}

fn is_gpu_failure(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("cuda") || s.contains("cudnn") || s.contains("gpu") || s.contains("onnxruntime")
}
