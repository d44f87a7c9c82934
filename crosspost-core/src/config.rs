use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::platform::PlatformId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CrosspostConfig {
    pub paths: PathsSection,
    pub automation: AutomationSection,
    pub driver: DriverSection,
    pub retry: RetrySection,
    pub pipeline: PipelineSection,
    pub session: SessionSection,
    pub collaborators: CollaboratorsSection,
    pub youtube: YoutubeSection,
    pub platforms: HashMap<String, PlatformOverride>,
}

impl CrosspostConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.sessions_dir)
    }

    pub fn drivers_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.drivers_dir)
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.captures_dir)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.work_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.logs_dir)
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.profiles_dir)
    }

    /// Keys may use any accepted platform alias (`ig`, `fb`, `yt`).
    pub fn platform_override(&self, platform: PlatformId) -> Option<&PlatformOverride> {
        self.platforms.get(platform.as_str()).or_else(|| {
            self.platforms
                .iter()
                .find(|(key, _)| key.parse::<PlatformId>().ok() == Some(platform))
                .map(|(_, value)| value)
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.max_concurrency",
                reason: "must be at least 1".into(),
            });
        }
        if self.youtube.chunk_size_bytes == 0 || self.youtube.chunk_size_bytes % (256 * 1024) != 0
        {
            return Err(ConfigError::Invalid {
                field: "youtube.chunk_size_bytes",
                reason: "must be a positive multiple of 262144".into(),
            });
        }
        if let Some(key) = self
            .platforms
            .keys()
            .find(|key| key.parse::<PlatformId>().is_err())
        {
            return Err(ConfigError::Invalid {
                field: "platforms",
                reason: format!("unknown platform `{key}`"),
            });
        }
        if self.automation.element_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "automation.element_retries",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub base_dir: String,
    pub sessions_dir: String,
    pub drivers_dir: String,
    pub captures_dir: String,
    pub work_dir: String,
    pub logs_dir: String,
    pub profiles_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            base_dir: ".crosspost".into(),
            sessions_dir: "sessions".into(),
            drivers_dir: "drivers".into(),
            captures_dir: "captures".into(),
            work_dir: "work".into(),
            logs_dir: "logs".into(),
            profiles_dir: "profiles".into(),
        }
    }
}

/// Browser automation knobs. The `Option<bool>` flags override the mode the
/// environment probe derives; unset means "follow the host".
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    pub headless: Option<bool>,
    pub single_process: Option<bool>,
    pub no_sandbox: Option<bool>,
    pub disable_gpu: Option<bool>,
    pub window_size: [u32; 2],
    pub user_agent: Option<String>,
    pub lang: Option<String>,
    pub navigation_timeout_seconds: u64,
    pub element_retries: u32,
    pub element_backoff_ms: u64,
    pub interactive_login: bool,
    pub login_timeout_seconds: u64,
    pub login_poll_ms: u64,
    pub confirm_timeout_seconds: u64,
    pub confirm_poll_ms: u64,
    pub profile_ttl_hours: u64,
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            headless: None,
            single_process: None,
            no_sandbox: None,
            disable_gpu: None,
            window_size: [1280, 800],
            user_agent: None,
            lang: None,
            navigation_timeout_seconds: 60,
            element_retries: 4,
            element_backoff_ms: 500,
            interactive_login: true,
            login_timeout_seconds: 180,
            login_poll_ms: 2_000,
            confirm_timeout_seconds: 120,
            confirm_poll_ms: 2_000,
            profile_ttl_hours: 24,
        }
    }
}

impl AutomationSection {
    pub fn element_backoff(&self) -> Duration {
        Duration::from_millis(self.element_backoff_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_seconds)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub override_path: Option<String>,
    pub candidates: Vec<String>,
    pub browser_candidates: Vec<String>,
    pub required_major: Option<u32>,
    pub auto_provision: bool,
    pub release_endpoint: String,
    pub download_base: String,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            override_path: None,
            candidates: vec![
                "chrome-headless-shell".into(),
                "chromium".into(),
                "chromium-browser".into(),
                "google-chrome".into(),
                "google-chrome-stable".into(),
            ],
            browser_candidates: vec![
                "google-chrome".into(),
                "google-chrome-stable".into(),
                "chromium".into(),
                "chromium-browser".into(),
            ],
            required_major: None,
            auto_provision: true,
            release_endpoint: "https://googlechromelabs.github.io/chrome-for-testing".into(),
            download_base: "https://storage.googleapis.com/chrome-for-testing-public".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub backoff_seconds: Vec<u64>,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_seconds: vec![5, 20, 60],
            jitter_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    /// Publish the source asset as-is with template captions.
    Direct,
    /// Generated captions, untouched media.
    Ai,
    /// Platform-optimized media, template captions.
    Optimize,
    #[default]
    Full,
}

impl ProcessingStrategy {
    pub fn generates_content(&self) -> bool {
        matches!(self, ProcessingStrategy::Ai | ProcessingStrategy::Full)
    }

    pub fn transforms_media(&self) -> bool {
        matches!(self, ProcessingStrategy::Optimize | ProcessingStrategy::Full)
    }
}

impl fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessingStrategy::Direct => "direct",
            ProcessingStrategy::Ai => "ai",
            ProcessingStrategy::Optimize => "optimize",
            ProcessingStrategy::Full => "full",
        };
        f.write_str(label)
    }
}

impl FromStr for ProcessingStrategy {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ProcessingStrategy::Direct),
            "ai" => Ok(ProcessingStrategy::Ai),
            "optimize" => Ok(ProcessingStrategy::Optimize),
            "full" => Ok(ProcessingStrategy::Full),
            other => Err(format!("unknown processing strategy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub max_concurrency: usize,
    pub attempt_timeout_seconds: u64,
    pub cancel_grace_seconds: u64,
    pub strategy: ProcessingStrategy,
    pub language: String,
    pub download_quality: String,
    pub enhancement: String,
    pub anti_fingerprint: String,
    /// Run directories under `work_dir` and `captures_dir` older than this are
    /// swept before each publish. 0 disables the sweep.
    pub workspace_ttl_hours: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            attempt_timeout_seconds: 900,
            cancel_grace_seconds: 15,
            strategy: ProcessingStrategy::Full,
            language: "english".into(),
            download_quality: "best".into(),
            enhancement: "medium".into(),
            anti_fingerprint: "light".into(),
            workspace_ttl_hours: 24 * 7,
        }
    }
}

impl PipelineSection {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    pub fn workspace_ttl(&self) -> Option<Duration> {
        (self.workspace_ttl_hours > 0).then(|| Duration::from_secs(self.workspace_ttl_hours * 3600))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackendKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub backend: SessionBackendKind,
    pub max_age_hours: Option<u64>,
    /// Consecutive rejections after which a stored record is deleted. 0 keeps records.
    pub max_rejections: u32,
    /// Name of the environment variable holding a base64 AES-256 key.
    pub encryption_key_env: Option<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backend: SessionBackendKind::File,
            max_age_hours: Some(24 * 30),
            max_rejections: 3,
            encryption_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollaboratorsSection {
    pub ytdlp_binary: String,
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub content_endpoint: Option<String>,
    pub content_timeout_seconds: u64,
    pub min_free_disk_mb: u64,
}

impl Default for CollaboratorsSection {
    fn default() -> Self {
        Self {
            ytdlp_binary: "yt-dlp".into(),
            ffmpeg_binary: "ffmpeg".into(),
            ffprobe_binary: "ffprobe".into(),
            content_endpoint: None,
            content_timeout_seconds: 60,
            min_free_disk_mb: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YoutubeSection {
    pub client_id_env: String,
    pub client_secret_env: String,
    pub token_endpoint: String,
    pub upload_endpoint: String,
    pub videos_endpoint: String,
    pub chunk_size_bytes: u64,
    pub privacy_status: String,
    pub category_id: String,
    pub request_timeout_seconds: u64,
}

impl Default for YoutubeSection {
    fn default() -> Self {
        Self {
            client_id_env: "YOUTUBE_CLIENT_ID".into(),
            client_secret_env: "YOUTUBE_CLIENT_SECRET".into(),
            token_endpoint: "https://oauth2.googleapis.com/token".into(),
            upload_endpoint: "https://www.googleapis.com/upload/youtube/v3/videos".into(),
            videos_endpoint: "https://www.googleapis.com/youtube/v3/videos".into(),
            chunk_size_bytes: 8 * 1024 * 1024,
            privacy_status: "public".into(),
            category_id: "22".into(),
            request_timeout_seconds: 120,
        }
    }
}

/// Per-platform replacements for the built-in browser script.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlatformOverride {
    pub upload_url: Option<String>,
    pub login_url: Option<String>,
    pub login_markers: Option<Vec<String>>,
    pub open_composer: Option<Vec<String>>,
    pub status_composer: Option<Vec<String>>,
    pub file_input: Option<Vec<String>>,
    pub media_ready: Option<Vec<String>>,
    pub after_media: Option<Vec<Vec<String>>>,
    pub caption_input: Option<Vec<String>>,
    pub submit: Option<Vec<String>>,
    pub success_selectors: Option<Vec<String>>,
    pub success_url_markers: Option<Vec<String>>,
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CrosspostConfig> {
    let config: CrosspostConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
