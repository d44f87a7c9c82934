use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Publishing targets known to the capability table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformId {
    TikTok,
    Facebook,
    Instagram,
    YouTube,
}

impl PlatformId {
    pub const ALL: [PlatformId; 4] = [
        PlatformId::TikTok,
        PlatformId::Facebook,
        PlatformId::Instagram,
        PlatformId::YouTube,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformId::TikTok => "tiktok",
            PlatformId::Facebook => "facebook",
            PlatformId::Instagram => "instagram",
            PlatformId::YouTube => "youtube",
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown platform `{}`", self.0)
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for PlatformId {
    type Err = UnknownPlatform;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tiktok" => Ok(PlatformId::TikTok),
            "facebook" | "fb" => Ok(PlatformId::Facebook),
            "instagram" | "ig" => Ok(PlatformId::Instagram),
            "youtube" | "yt" => Ok(PlatformId::YouTube),
            other => Err(UnknownPlatform(other.to_string())),
        }
    }
}
