use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::media::{Dimensions, MediaAsset};
use crate::process::{CommandRunner, SystemCommandRunner};

use super::{tail, CollaboratorError, CollaboratorResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// `best`, `high`, `medium` or `low`.
    pub quality: String,
    pub dest_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub asset: MediaAsset,
    pub title: Option<String>,
    pub duration_seconds: Option<f64>,
    pub uploader: Option<String>,
}

#[async_trait]
pub trait MediaDownloader: Send + Sync {
    async fn download(&self, request: &DownloadRequest) -> CollaboratorResult<DownloadedMedia>;
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    uploader: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(rename = "_filename")]
    filename: Option<String>,
    #[serde(default)]
    requested_downloads: Vec<YtDlpDownload>,
}

#[derive(Debug, Deserialize)]
struct YtDlpDownload {
    filepath: Option<String>,
}

pub struct YtDlpDownloader {
    binary: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for YtDlpDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YtDlpDownloader")
            .field("binary", &self.binary)
            .finish()
    }
}

impl YtDlpDownloader {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
            runner: Arc::new(SystemCommandRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    fn format_selector(quality: &str) -> &'static str {
        match quality {
            "high" => "bestvideo[height<=1080]+bestaudio/best[height<=1080]",
            "medium" => "bestvideo[height<=720]+bestaudio/best[height<=720]",
            "low" => "bestvideo[height<=480]+bestaudio/best[height<=480]",
            _ => "bestvideo+bestaudio/best",
        }
    }

    fn build_args(request: &DownloadRequest) -> Vec<String> {
        let template = request.dest_dir.join("%(id)s.%(ext)s");
        vec![
            "--no-playlist".into(),
            "--no-progress".into(),
            "-f".into(),
            Self::format_selector(&request.quality).into(),
            "--merge-output-format".into(),
            "mp4".into(),
            "-o".into(),
            template.to_string_lossy().into_owned(),
            "--print-json".into(),
            request.url.clone(),
        ]
    }

    fn classify(stderr: &str) -> CollaboratorError {
        let lowered = stderr.to_ascii_lowercase();
        let detail = tail(stderr, 3);
        if lowered.contains("unsupported url") {
            CollaboratorError::UnsupportedUrl(detail)
        } else if lowered.contains("video unavailable")
            || lowered.contains("private video")
            || lowered.contains("not available")
            || lowered.contains("has been removed")
        {
            CollaboratorError::Unavailable(detail)
        } else if lowered.contains("unable to download")
            || lowered.contains("timed out")
            || lowered.contains("connection")
            || lowered.contains("http error 5")
        {
            CollaboratorError::Network(detail)
        } else {
            CollaboratorError::Failed {
                tool: "yt-dlp".into(),
                message: detail,
            }
        }
    }

    fn downloaded_path(info: &YtDlpInfo) -> Option<PathBuf> {
        info.requested_downloads
            .iter()
            .find_map(|entry| entry.filepath.clone())
            .or_else(|| info.filename.clone())
            .map(PathBuf::from)
    }
}

#[async_trait]
impl MediaDownloader for YtDlpDownloader {
    async fn download(&self, request: &DownloadRequest) -> CollaboratorResult<DownloadedMedia> {
        if url::Url::parse(&request.url).is_err() {
            return Err(CollaboratorError::UnsupportedUrl(request.url.clone()));
        }
        tokio::fs::create_dir_all(&request.dest_dir).await?;
        info!(url = %request.url, quality = %request.quality, "downloading source media");
        let output = self
            .runner
            .output(&self.binary, &Self::build_args(request))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    CollaboratorError::ToolUnavailable(self.binary.display().to_string())
                }
                _ => CollaboratorError::Io(err),
            })?;
        if !output.success {
            warn!(url = %request.url, code = ?output.code, "yt-dlp failed");
            return Err(Self::classify(&output.stderr));
        }
        let line = output
            .stdout
            .lines()
            .rev()
            .find(|line| line.trim_start().starts_with('{'))
            .ok_or_else(|| CollaboratorError::MalformedResponse("yt-dlp printed no json".into()))?;
        let info: YtDlpInfo = serde_json::from_str(line)
            .map_err(|err| CollaboratorError::MalformedResponse(err.to_string()))?;
        let path = Self::downloaded_path(&info).ok_or_else(|| {
            CollaboratorError::MalformedResponse("yt-dlp did not report an output file".into())
        })?;
        let mut asset = MediaAsset::from_path(locate_output(&path)).await?;
        asset.duration_seconds = info.duration;
        if let (Some(width), Some(height)) = (info.width, info.height) {
            asset.dimensions = Some(Dimensions { width, height });
        }
        Ok(DownloadedMedia {
            asset,
            title: info.title,
            duration_seconds: info.duration,
            uploader: info.uploader,
        })
    }
}

/// yt-dlp reports the pre-merge name in `_filename`; after `--merge-output-format`
/// the file on disk carries the merged extension.
fn locate_output(path: &Path) -> PathBuf {
    if path.exists() {
        return path.to_path_buf();
    }
    let merged = path.with_extension("mp4");
    if merged.exists() {
        merged
    } else {
        path.to_path_buf()
    }
}
