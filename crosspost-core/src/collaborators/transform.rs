use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::media::{Dimensions, MediaAsset, MediaKind, MediaMetadata};
use crate::platform::PlatformId;
use crate::process::{CommandRunner, SystemCommandRunner};

use super::{tail, CollaboratorError, CollaboratorResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnhancementLevel {
    #[default]
    None,
    Light,
    Medium,
    Heavy,
    Professional,
}

impl FromStr for EnhancementLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(EnhancementLevel::None),
            "light" => Ok(EnhancementLevel::Light),
            "medium" => Ok(EnhancementLevel::Medium),
            "heavy" => Ok(EnhancementLevel::Heavy),
            "professional" => Ok(EnhancementLevel::Professional),
            other => Err(format!("unknown enhancement level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AntiFingerprint {
    #[default]
    None,
    Light,
    Medium,
    Heavy,
}

impl FromStr for AntiFingerprint {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AntiFingerprint::None),
            "light" => Ok(AntiFingerprint::Light),
            "medium" => Ok(AntiFingerprint::Medium),
            "heavy" => Ok(AntiFingerprint::Heavy),
            other => Err(format!("unknown anti-fingerprint level `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
}

impl PlatformFormat {
    pub fn for_platform(platform: PlatformId) -> Self {
        match platform {
            PlatformId::TikTok => Self::vertical(2500),
            PlatformId::Instagram => Self::vertical(3000),
            PlatformId::YouTube => Self::vertical(4000),
            PlatformId::Facebook => Self {
                width: 1080,
                height: 1080,
                fps: 30,
                bitrate_kbps: 2000,
            },
        }
    }

    fn vertical(bitrate_kbps: u32) -> Self {
        Self {
            width: 1080,
            height: 1920,
            fps: 30,
            bitrate_kbps,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOp {
    pub enhancement: EnhancementLevel,
    pub anti_fingerprint: AntiFingerprint,
    pub target: Option<PlatformFormat>,
    pub output_path: PathBuf,
}

#[async_trait]
pub trait MediaTransformer: Send + Sync {
    /// Writes a new file at `op.output_path`; the input asset is left untouched.
    async fn transform(&self, asset: &MediaAsset, op: &TransformOp) -> CollaboratorResult<MediaAsset>;

    /// Reads duration and frame size from the container. Adapters without a
    /// metadata reader report nothing.
    async fn describe(&self, _asset: &MediaAsset) -> CollaboratorResult<MediaMetadata> {
        Ok(MediaMetadata::default())
    }
}

#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    duration: Option<String>,
}

/// Parses `ffprobe -print_format json -show_format -show_streams` output.
pub(crate) fn parse_probe_report(json: &str) -> CollaboratorResult<MediaMetadata> {
    let report: ProbeReport = serde_json::from_str(json)
        .map_err(|err| CollaboratorError::MalformedResponse(format!("ffprobe: {err}")))?;
    let video = report
        .streams
        .iter()
        .find(|stream| stream.codec_type.as_deref() == Some("video"));
    let seconds = |value: &Option<String>| {
        value
            .as_deref()
            .and_then(|text| text.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs > 0.0)
    };
    let duration_seconds = report
        .format
        .as_ref()
        .and_then(|format| seconds(&format.duration))
        .or_else(|| video.and_then(|stream| seconds(&stream.duration)));
    let dimensions = video.and_then(|stream| match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => Some(Dimensions { width, height }),
        _ => None,
    });
    Ok(MediaMetadata {
        duration_seconds,
        dimensions,
    })
}

pub struct FfmpegTransformer {
    binary: PathBuf,
    probe_binary: PathBuf,
    min_free_bytes: u64,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for FfmpegTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegTransformer")
            .field("binary", &self.binary)
            .field("probe_binary", &self.probe_binary)
            .field("min_free_bytes", &self.min_free_bytes)
            .finish()
    }
}

impl FfmpegTransformer {
    pub fn new<P: Into<PathBuf>>(binary: P, min_free_mb: u64) -> Self {
        Self {
            binary: binary.into(),
            probe_binary: PathBuf::from("ffprobe"),
            min_free_bytes: min_free_mb * 1024 * 1024,
            runner: Arc::new(SystemCommandRunner),
        }
    }

    pub fn with_probe_binary<P: Into<PathBuf>>(mut self, binary: P) -> Self {
        self.probe_binary = binary.into();
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub(crate) fn filter_chain<R: Rng>(op: &TransformOp, rng: &mut R) -> Vec<String> {
        let mut filters = Vec::new();
        match op.enhancement {
            EnhancementLevel::None => {}
            EnhancementLevel::Light => {
                filters.push("eq=brightness=0.02:contrast=1.05:saturation=1.05".to_string());
                filters.push("hqdn3d=1:1:2:2".to_string());
            }
            EnhancementLevel::Medium => {
                filters.push("eq=brightness=0.04:contrast=1.1:saturation=1.1".to_string());
                filters.push("unsharp=5:5:0.5:5:5:0.5".to_string());
                filters.push("hqdn3d=2:2:3:3".to_string());
            }
            EnhancementLevel::Heavy => {
                filters.push("eq=brightness=0.06:contrast=1.2:saturation=1.2".to_string());
                filters.push("unsharp=5:5:1.0:5:5:1.0".to_string());
                filters.push("hqdn3d=4:4:6:6".to_string());
            }
            EnhancementLevel::Professional => {
                filters.push("eq=brightness=0.03:contrast=1.15:saturation=1.15".to_string());
                filters.push("unsharp=5:5:0.8:5:5:0.8".to_string());
                filters.push("hqdn3d=2:2:3:3".to_string());
            }
        }

        let jitter = |rng: &mut R, spread: f64| rng.gen_range(-spread..=spread);
        match op.anti_fingerprint {
            AntiFingerprint::None => {}
            AntiFingerprint::Light => {
                filters.push(format!(
                    "eq=brightness={:.3}:contrast={:.3}",
                    jitter(rng, 0.02),
                    1.0 + jitter(rng, 0.02)
                ));
                filters.push(format!("hue=h={:.2}", jitter(rng, 2.0)));
            }
            AntiFingerprint::Medium => {
                filters.push(format!(
                    "eq=brightness={:.3}:contrast={:.3}",
                    jitter(rng, 0.05),
                    1.0 + jitter(rng, 0.05)
                ));
                filters.push(format!(
                    "hue=h={:.2}:s={:.3}",
                    jitter(rng, 5.0),
                    1.0 + jitter(rng, 0.05)
                ));
            }
            AntiFingerprint::Heavy => {
                filters.push(format!(
                    "eq=brightness={:.3}:contrast={:.3}",
                    jitter(rng, 0.1),
                    1.0 + jitter(rng, 0.1)
                ));
                filters.push(format!(
                    "hue=h={:.2}:s={:.3}",
                    jitter(rng, 10.0),
                    1.0 + jitter(rng, 0.1)
                ));
                filters.push("noise=alls=1:allf=t".to_string());
            }
        }

        if let Some(target) = op.target {
            filters.push(format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2",
                w = target.width,
                h = target.height
            ));
        }
        filters
    }

    fn build_args(asset: &MediaAsset, op: &TransformOp, filters: &[String]) -> Vec<String> {
        let mut args = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-i".to_string(),
            asset.local_path.to_string_lossy().into_owned(),
        ];
        if !filters.is_empty() {
            args.push("-vf".into());
            args.push(filters.join(","));
        }
        args.extend(["-c:v", "libx264", "-preset", "medium", "-crf", "20"].map(String::from));
        if let Some(target) = op.target {
            args.push("-b:v".into());
            args.push(format!("{}k", target.bitrate_kbps));
            args.push("-r".into());
            args.push(target.fps.to_string());
        }
        args.extend(
            ["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"].map(String::from),
        );
        args.push(op.output_path.to_string_lossy().into_owned());
        args
    }

    fn classify(stderr: &str) -> CollaboratorError {
        let lowered = stderr.to_ascii_lowercase();
        let detail = tail(stderr, 4);
        if lowered.contains("no space left") {
            CollaboratorError::InsufficientDiskSpace {
                required: 0,
                available: 0,
            }
        } else if lowered.contains("invalid data found")
            || lowered.contains("unknown decoder")
            || lowered.contains("decoder not found")
            || lowered.contains("not currently supported")
        {
            CollaboratorError::UnsupportedCodec(detail)
        } else {
            CollaboratorError::Failed {
                tool: "ffmpeg".into(),
                message: detail,
            }
        }
    }

    fn check_disk_space(&self, dir: &Path, input_size: u64) -> CollaboratorResult<()> {
        let Some(available) = available_space(dir) else {
            warn!(dir = %dir.display(), "could not determine free disk space");
            return Ok(());
        };
        let required = input_size.saturating_mul(2).saturating_add(self.min_free_bytes);
        if available < required {
            return Err(CollaboratorError::InsufficientDiskSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}

/// Free bytes on the disk whose mount point is the longest prefix of `path`.
fn available_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[async_trait]
impl MediaTransformer for FfmpegTransformer {
    async fn transform(&self, asset: &MediaAsset, op: &TransformOp) -> CollaboratorResult<MediaAsset> {
        if asset.kind != MediaKind::Video {
            return Err(CollaboratorError::UnsupportedCodec(format!(
                "{:?} assets are published untransformed",
                asset.kind
            )));
        }
        if op.output_path == asset.local_path {
            return Err(CollaboratorError::Failed {
                tool: "ffmpeg".into(),
                message: "refusing to overwrite the source asset".into(),
            });
        }
        let out_dir = op
            .output_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&out_dir).await?;
        self.check_disk_space(&out_dir, asset.size_bytes)?;

        let filters = Self::filter_chain(op, &mut rand::thread_rng());
        let args = Self::build_args(asset, op, &filters);
        info!(
            input = %asset.local_path.display(),
            output = %op.output_path.display(),
            filters = filters.len(),
            "transforming media"
        );
        let output = self
            .runner
            .output(&self.binary, &args)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    CollaboratorError::ToolUnavailable(self.binary.display().to_string())
                }
                _ => CollaboratorError::Io(err),
            })?;
        if !output.success {
            return Err(Self::classify(&output.stderr));
        }

        let mut derived = MediaAsset::from_path(&op.output_path).await?;
        derived.duration_seconds = asset.duration_seconds;
        derived.dimensions = op
            .target
            .map(|target| Dimensions {
                width: target.width,
                height: target.height,
            })
            .or(asset.dimensions);
        derived.derived_from = Some(asset.local_path.clone());
        Ok(derived)
    }

    async fn describe(&self, asset: &MediaAsset) -> CollaboratorResult<MediaMetadata> {
        if asset.kind == MediaKind::Text {
            return Ok(MediaMetadata::default());
        }
        let args = [
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]
        .into_iter()
        .map(String::from)
        .chain(std::iter::once(asset.local_path.to_string_lossy().into_owned()))
        .collect::<Vec<_>>();
        let output = self
            .runner
            .output(&self.probe_binary, &args)
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => {
                    CollaboratorError::ToolUnavailable(self.probe_binary.display().to_string())
                }
                _ => CollaboratorError::Io(err),
            })?;
        if !output.success {
            return Err(CollaboratorError::Failed {
                tool: "ffprobe".into(),
                message: tail(&output.stderr, 4),
            });
        }
        let metadata = parse_probe_report(&output.stdout)?;
        debug!(path = %asset.local_path.display(), ?metadata, "media described");
        Ok(metadata)
    }
}
