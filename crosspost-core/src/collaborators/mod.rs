//! Contracts for the external tools the pipeline leans on, plus the stock
//! adapters: `yt-dlp` downloads, an HTTP content generator with a template
//! fallback, and `ffmpeg` transformations.

mod content;
mod downloader;
mod transform;

use thiserror::Error;

pub use content::{
    ContentGenerator, ContentRequest, ContentSubject, HttpContentGenerator,
    TemplateContentGenerator,
};
pub use downloader::{DownloadRequest, DownloadedMedia, MediaDownloader, YtDlpDownloader};
pub use transform::{
    AntiFingerprint, EnhancementLevel, FfmpegTransformer, MediaTransformer, PlatformFormat,
    TransformOp,
};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
    #[error("network failure: {0}")]
    Network(String),
    #[error("content unavailable: {0}")]
    Unavailable(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("content policy rejection: {0}")]
    PolicyRejected(String),
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientDiskSpace { required: u64, available: u64 },
    #[error("{tool} failed: {message}")]
    Failed { tool: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Network(err.to_string())
    }
}

/// Keeps the tail of a tool's stderr, which is where ffmpeg and yt-dlp put the cause.
pub(crate) fn tail(text: &str, lines: usize) -> String {
    let collected: Vec<&str> = text.lines().rev().take(lines).collect();
    collected.into_iter().rev().collect::<Vec<_>>().join("\n")
}
