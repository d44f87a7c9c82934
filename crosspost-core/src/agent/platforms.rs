use serde::Serialize;

use crate::config::{CrosspostConfig, PlatformOverride};
use crate::media::MediaKind;
use crate::platform::PlatformId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStrategy {
    BrowserDriven,
    NativeApi,
}

/// The selectors and URLs a browser-driven upload walks through. Every list
/// holds alternatives tried in order; the first present element wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserScript {
    pub upload_url: String,
    pub login_url: String,
    pub login_markers: Vec<String>,
    pub open_composer: Vec<String>,
    /// Activates the plain-text status composer. Empty when the platform has
    /// no text-only post surface.
    pub status_composer: Vec<String>,
    pub file_input: Vec<String>,
    /// Optional readiness probe polled after the file is attached.
    pub media_ready: Vec<String>,
    /// Sequential steps between attaching media and the caption, e.g. "Next".
    pub after_media: Vec<Vec<String>>,
    pub caption_input: Vec<String>,
    pub submit: Vec<String>,
    pub success_selectors: Vec<String>,
    pub success_url_markers: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn default_login_markers() -> Vec<String> {
    strings(&["/login", "checkpoint", "passport", "accounts/login"])
}

impl BrowserScript {
    pub fn is_login_url(&self, url: &str) -> bool {
        let lowered = url.to_ascii_lowercase();
        self.login_markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_ascii_lowercase()))
    }

    pub fn matches_success_url(&self, url: &str) -> bool {
        self.success_url_markers
            .iter()
            .any(|marker| url.contains(marker.as_str()))
    }

    fn tiktok() -> Self {
        Self {
            upload_url: "https://www.tiktok.com/tiktokstudio/upload?from=webapp".into(),
            login_url: "https://www.tiktok.com/login".into(),
            login_markers: default_login_markers(),
            open_composer: Vec::new(),
            status_composer: Vec::new(),
            file_input: strings(&[
                "input[type='file']",
                "input[accept*='video']",
                "[data-e2e='upload-btn'] input",
                ".upload-btn input",
            ]),
            media_ready: strings(&[
                ".info-status.success",
                "[data-e2e='upload-success']",
                ".upload-success",
            ]),
            after_media: Vec::new(),
            caption_input: strings(&[
                "div[contenteditable='true']",
                "[data-e2e='caption-input']",
                ".caption-editor",
                "textarea[placeholder*='caption']",
            ]),
            submit: strings(&[
                "button[data-e2e='publish-button']",
                ".publish-button",
                ".btn-post",
                "text=Post",
            ]),
            success_selectors: strings(&[
                ".success-message",
                "[data-e2e='upload-success-message']",
                ".upload-complete",
            ]),
            success_url_markers: strings(&["tiktokstudio/content"]),
        }
    }

    fn facebook() -> Self {
        Self {
            upload_url: "https://www.facebook.com".into(),
            login_url: "https://www.facebook.com/login".into(),
            login_markers: default_login_markers(),
            open_composer: strings(&[
                "div[aria-label='Photo/video']",
                "div[aria-label='Foto/video']",
                "div[role='button'][aria-label*='Photo']",
                "div[role='button'][aria-label*='Foto']",
            ]),
            status_composer: strings(&[
                "div[role='button'][aria-label*='Create a post']",
                "div[role='button'][aria-label*='Buat postingan']",
                "div[data-testid='status-attachment-mentions-input']",
                "div[aria-label*='What\\'s on your mind']",
            ]),
            file_input: strings(&[
                "input[type='file'][accept*='video']",
                "input[type='file']",
            ]),
            media_ready: Vec::new(),
            after_media: Vec::new(),
            caption_input: strings(&[
                "div[contenteditable='true'][role='textbox']",
                "div[aria-label*='What\\'s on your mind']",
                "div[aria-label*='Apa yang Anda pikirkan']",
            ]),
            submit: strings(&[
                "div[aria-label='Post']",
                "div[aria-label='Posting']",
                "div[role='button'][aria-label*='Post']",
            ]),
            success_selectors: strings(&[
                "text=Your post is now published",
                "text=Postingan Anda sekarang sudah dipublikasikan",
            ]),
            success_url_markers: Vec::new(),
        }
    }

    fn instagram() -> Self {
        Self {
            upload_url: "https://www.instagram.com/create/select/".into(),
            login_url: "https://www.instagram.com/accounts/login/".into(),
            login_markers: default_login_markers(),
            open_composer: strings(&["svg[aria-label='New post']", "a[href='/create/select/']"]),
            status_composer: Vec::new(),
            file_input: strings(&[
                "input[type='file']",
                "input[accept*='video']",
                "input[accept*='image']",
            ]),
            media_ready: Vec::new(),
            after_media: vec![strings(&["text=Next"]), strings(&["text=Next"])],
            caption_input: strings(&[
                "textarea[aria-label='Write a caption...']",
                "div[aria-label='Write a caption...']",
                "div[contenteditable='true']",
            ]),
            submit: strings(&["text=Share"]),
            success_selectors: strings(&[
                "img[alt='Animated checkmark']",
                "text=Your reel has been shared.",
                "text=Your post has been shared.",
            ]),
            success_url_markers: Vec::new(),
        }
    }

    pub fn apply(&mut self, overrides: &PlatformOverride) {
        fn replace<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(value) = value {
                *target = value.clone();
            }
        }
        replace(&mut self.upload_url, &overrides.upload_url);
        replace(&mut self.login_url, &overrides.login_url);
        replace(&mut self.login_markers, &overrides.login_markers);
        replace(&mut self.open_composer, &overrides.open_composer);
        replace(&mut self.status_composer, &overrides.status_composer);
        replace(&mut self.file_input, &overrides.file_input);
        replace(&mut self.media_ready, &overrides.media_ready);
        replace(&mut self.after_media, &overrides.after_media);
        replace(&mut self.caption_input, &overrides.caption_input);
        replace(&mut self.submit, &overrides.submit);
        replace(&mut self.success_selectors, &overrides.success_selectors);
        replace(&mut self.success_url_markers, &overrides.success_url_markers);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformProfile {
    pub platform: PlatformId,
    pub strategy: AgentStrategy,
    /// Present for browser-driven platforms only.
    pub script: Option<BrowserScript>,
    pub media_kinds: Vec<MediaKind>,
}

impl PlatformProfile {
    pub fn builtin(platform: PlatformId) -> Self {
        let script = match platform {
            PlatformId::TikTok => Some(BrowserScript::tiktok()),
            PlatformId::Facebook => Some(BrowserScript::facebook()),
            PlatformId::Instagram => Some(BrowserScript::instagram()),
            PlatformId::YouTube => None,
        };
        let strategy = if script.is_some() {
            AgentStrategy::BrowserDriven
        } else {
            AgentStrategy::NativeApi
        };
        let media_kinds = match platform {
            PlatformId::Facebook => vec![MediaKind::Video, MediaKind::Image, MediaKind::Text],
            PlatformId::Instagram => vec![MediaKind::Video, MediaKind::Image],
            PlatformId::TikTok | PlatformId::YouTube => vec![MediaKind::Video],
        };
        Self {
            platform,
            strategy,
            script,
            media_kinds,
        }
    }

    pub fn supports(&self, kind: MediaKind) -> bool {
        self.media_kinds.contains(&kind)
    }
}

/// Built-in platform profiles with config overrides applied.
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    profiles: Vec<PlatformProfile>,
}

impl CapabilityTable {
    pub fn builtin() -> Self {
        Self {
            profiles: PlatformId::ALL.iter().copied().map(PlatformProfile::builtin).collect(),
        }
    }

    pub fn from_config(config: &CrosspostConfig) -> Self {
        let mut table = Self::builtin();
        for profile in &mut table.profiles {
            if let (Some(script), Some(overrides)) =
                (profile.script.as_mut(), config.platform_override(profile.platform))
            {
                script.apply(overrides);
            }
        }
        table
    }

    pub fn profiles(&self) -> &[PlatformProfile] {
        &self.profiles
    }

    pub fn get(&self, platform: PlatformId) -> Option<&PlatformProfile> {
        self.profiles.iter().find(|profile| profile.platform == platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn youtube_is_the_only_native_platform() {
        let table = CapabilityTable::builtin();
        for profile in table.profiles() {
            let expected = if profile.platform == PlatformId::YouTube {
                AgentStrategy::NativeApi
            } else {
                AgentStrategy::BrowserDriven
            };
            assert_eq!(profile.strategy, expected, "{}", profile.platform);
            assert_eq!(profile.script.is_some(), expected == AgentStrategy::BrowserDriven);
        }
    }

    #[test]
    fn config_overrides_replace_selected_fields() {
        let mut config = CrosspostConfig::default();
        config.platforms.insert(
            "ig".into(),
            PlatformOverride {
                submit: Some(vec!["button[type='submit']".into()]),
                ..PlatformOverride::default()
            },
        );
        let table = CapabilityTable::from_config(&config);
        let script = table.get(PlatformId::Instagram).unwrap().script.as_ref().unwrap();
        assert_eq!(script.submit, vec!["button[type='submit']".to_string()]);
        assert_eq!(script.after_media.len(), 2);
    }

    #[test]
    fn login_markers_match_case_insensitively() {
        let script = PlatformProfile::builtin(PlatformId::Facebook).script.unwrap();
        assert!(script.is_login_url("https://www.facebook.com/checkpoint/block"));
        assert!(script.is_login_url("https://www.facebook.com/LOGIN/?next=1"));
        assert!(!script.is_login_url("https://www.facebook.com/"));
    }

    #[test]
    fn only_facebook_accepts_text_posts() {
        let table = CapabilityTable::builtin();
        for profile in table.profiles() {
            assert!(profile.supports(MediaKind::Video), "{}", profile.platform);
            let text = profile.supports(MediaKind::Text);
            assert_eq!(text, profile.platform == PlatformId::Facebook, "{}", profile.platform);
            if let Some(script) = &profile.script {
                assert_eq!(!script.status_composer.is_empty(), text, "{}", profile.platform);
            }
        }
        assert!(!table.get(PlatformId::TikTok).unwrap().supports(MediaKind::Image));
    }
}
