use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::media::{ContentBundle, MediaAsset};
use crate::platform::PlatformId;

use super::{CollaboratorError, CollaboratorResult};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSubject {
    Asset {
        path: String,
        kind: crate::media::MediaKind,
        duration_seconds: Option<f64>,
    },
    Topic {
        text: String,
    },
}

impl ContentSubject {
    pub fn from_asset(asset: &MediaAsset) -> Self {
        ContentSubject::Asset {
            path: asset.local_path.to_string_lossy().into_owned(),
            kind: asset.kind,
            duration_seconds: asset.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentRequest {
    pub subject: ContentSubject,
    pub platform: PlatformId,
    pub language: String,
    /// Source title when known, e.g. from the downloader.
    pub title_hint: Option<String>,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, request: &ContentRequest) -> CollaboratorResult<ContentBundle>;
}

#[derive(Debug, Deserialize)]
struct GeneratedContent {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    hashtags: Vec<String>,
    #[serde(default)]
    call_to_action: Option<String>,
    #[serde(default)]
    score: Option<f32>,
}

/// Posts the request as JSON to a generation service and expects a bundle back.
/// Services that relay raw model text may wrap the JSON in a fenced block.
#[derive(Debug, Clone)]
pub struct HttpContentGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpContentGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, request: &ContentRequest) -> CollaboratorResult<ContentBundle> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        parse_generated(&body, request.platform)
    }
}

fn classify_status(status: StatusCode, body: &str) -> CollaboratorError {
    let lowered = body.to_ascii_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS || lowered.contains("quota") {
        CollaboratorError::QuotaExceeded(format!("{status}: {body}"))
    } else if status == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS
        || lowered.contains("safety")
        || lowered.contains("policy")
    {
        CollaboratorError::PolicyRejected(body.to_string())
    } else {
        CollaboratorError::Network(format!("unexpected status {status}"))
    }
}

pub(crate) fn parse_generated(body: &str, platform: PlatformId) -> CollaboratorResult<ContentBundle> {
    let json = extract_json_block(body);
    let generated: GeneratedContent = serde_json::from_str(json)
        .map_err(|err| CollaboratorError::MalformedResponse(err.to_string()))?;
    if generated.title.trim().is_empty() {
        return Err(CollaboratorError::MalformedResponse("empty title".into()));
    }
    debug!(%platform, title = %generated.title, "content generated");
    Ok(ContentBundle {
        title: generated.title,
        description: generated.description,
        hashtags: generated.hashtags,
        call_to_action: generated.call_to_action,
        target_platform: platform,
        score: generated.score,
    })
}

fn extract_json_block(body: &str) -> &str {
    if let Some(start) = body.find("```json") {
        let rest = &body[start + 7..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
    }
    body.trim()
}

/// Deterministic captions used when no generator is configured or it fails.
#[derive(Debug, Clone, Default)]
pub struct TemplateContentGenerator;

impl TemplateContentGenerator {
    pub fn bundle(&self, request: &ContentRequest) -> ContentBundle {
        let indonesian = request.language.eq_ignore_ascii_case("indonesian");
        let title = request
            .title_hint
            .clone()
            .filter(|title| !title.trim().is_empty())
            .or_else(|| match &request.subject {
                ContentSubject::Topic { text } => Some(text.clone()),
                ContentSubject::Asset { path, .. } => std::path::Path::new(path)
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(|stem| stem.replace(['_', '-'], " ")),
            })
            .unwrap_or_else(|| "New video".to_string());
        let mut hashtags: Vec<String> = ["#fyp", "#viral", "#trending"]
            .iter()
            .map(|tag| tag.to_string())
            .collect();
        let platform_tag = match request.platform {
            PlatformId::TikTok => "#tiktok",
            PlatformId::Facebook => "#facebookreels",
            PlatformId::Instagram => "#reels",
            PlatformId::YouTube => "#shorts",
        };
        hashtags.push(platform_tag.to_string());
        let (description, cta) = if indonesian {
            ("Jangan lupa tonton sampai habis!", "Like dan share, komentar di bawah!")
        } else {
            ("Watch until the end!", "Like and share, comment below!")
        };
        ContentBundle {
            title,
            description: description.to_string(),
            hashtags,
            call_to_action: Some(cta.to_string()),
            target_platform: request.platform,
            score: None,
        }
    }
}

#[async_trait]
impl ContentGenerator for TemplateContentGenerator {
    async fn generate(&self, request: &ContentRequest) -> CollaboratorResult<ContentBundle> {
        Ok(self.bundle(request))
    }
}
