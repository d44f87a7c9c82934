use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::platform::PlatformId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Image,
    Text,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "mp4" | "mov" | "m4v" | "webm" | "mkv" | "avi" => Some(MediaKind::Video),
            "jpg" | "jpeg" | "png" | "webp" | "gif" => Some(MediaKind::Image),
            "txt" | "md" => Some(MediaKind::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Image => "image",
            MediaKind::Text => "text",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Stream facts read from a media container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub duration_seconds: Option<f64>,
    pub dimensions: Option<Dimensions>,
}

/// A file on disk the pipeline publishes. Derived assets point back at their
/// source through `derived_from`; the source file is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub local_path: PathBuf,
    pub kind: MediaKind,
    pub duration_seconds: Option<f64>,
    pub dimensions: Option<Dimensions>,
    pub size_bytes: u64,
    pub checksum: String,
    pub derived_from: Option<PathBuf>,
}

impl MediaAsset {
    pub async fn from_path<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }
        let kind = MediaKind::from_path(path).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unsupported media type: {}", path.display()),
            )
        })?;
        Ok(Self {
            local_path: path.to_path_buf(),
            kind,
            duration_seconds: None,
            dimensions: None,
            size_bytes: metadata.len(),
            checksum: checksum_file(path).await?,
            derived_from: None,
        })
    }

    /// Fills in whatever the metadata reader found; known values are kept otherwise.
    pub fn with_metadata(mut self, metadata: MediaMetadata) -> Self {
        self.duration_seconds = metadata.duration_seconds.or(self.duration_seconds);
        self.dimensions = metadata.dimensions.or(self.dimensions);
        self
    }

    /// Short stable reference used in attempt records.
    pub fn reference(&self) -> String {
        let short = self.checksum.get(..12).unwrap_or(&self.checksum);
        format!("sha256:{short}")
    }

    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }
}

pub async fn checksum_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBundle {
    pub title: String,
    pub description: String,
    pub hashtags: Vec<String>,
    pub call_to_action: Option<String>,
    pub target_platform: PlatformId,
    #[serde(default)]
    pub score: Option<f32>,
}

impl ContentBundle {
    /// Text typed into the platform's caption surface.
    pub fn caption(&self) -> String {
        let mut parts = Vec::new();
        if !self.title.trim().is_empty() {
            parts.push(self.title.trim().to_string());
        }
        if !self.description.trim().is_empty() && self.description.trim() != self.title.trim() {
            parts.push(self.description.trim().to_string());
        }
        if let Some(cta) = self.call_to_action.as_deref().filter(|c| !c.trim().is_empty()) {
            parts.push(cta.trim().to_string());
        }
        let tags = self
            .hashtags
            .iter()
            .map(|tag| {
                let tag = tag.trim();
                if tag.starts_with('#') {
                    tag.to_string()
                } else {
                    format!("#{tag}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        if !tags.is_empty() {
            parts.push(tags);
        }
        parts.join("\n\n")
    }

    pub fn reference(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.target_platform.as_str().as_bytes());
        hasher.update(self.caption().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}:{}", self.target_platform, &digest[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn asset_from_path_hashes_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.MP4");
        std::fs::write(&path, b"abc").unwrap();
        let asset = MediaAsset::from_path(&path).await.unwrap();
        assert_eq!(asset.kind, MediaKind::Video);
        assert_eq!(asset.size_bytes, 3);
        assert_eq!(
            asset.checksum,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(asset.reference(), "sha256:ba7816bf8f01");
        assert!(!asset.is_derived());
    }

    #[tokio::test]
    async fn unknown_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("archive.tar");
        std::fs::write(&path, b"x").unwrap();
        assert!(MediaAsset::from_path(&path).await.is_err());
    }

    #[test]
    fn caption_normalizes_hashtags() {
        let bundle = ContentBundle {
            title: "Sunset run".into(),
            description: "Golden hour on the coast".into(),
            hashtags: vec!["fyp".into(), "#viral".into()],
            call_to_action: Some("Follow for more".into()),
            target_platform: PlatformId::TikTok,
            score: None,
        };
        assert_eq!(
            bundle.caption(),
            "Sunset run\n\nGolden hour on the coast\n\nFollow for more\n\n#fyp #viral"
        );
        assert!(bundle.reference().starts_with("tiktok:"));
    }
}
