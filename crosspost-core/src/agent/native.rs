use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::config::YoutubeSection;
use crate::media::{ContentBundle, MediaAsset};
use crate::platform::PlatformId;
use crate::session::{AuthState, SessionRecord, SessionStore};

use super::platforms::AgentStrategy;
use super::{
    Artifact, FailureKind, PublishAgent, PublishFailure, PublishPhase, PublishProgress,
    PublishRequest, PublishResult, ReauthContext,
};

const RESUME_INCOMPLETE: u16 = 308;
const TOKEN_EXPIRY_MARGIN_SECONDS: i64 = 60;
const MAX_STALLED_CHUNKS: u32 = 3;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadedVideo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct VideoList {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    #[serde(default)]
    status: Option<VideoStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatus {
    #[serde(default)]
    upload_status: Option<String>,
    #[serde(default)]
    rejection_reason: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Credentials {
    access_token: String,
    refresh_token: Option<String>,
}

/// Publishes to YouTube through the Data API resumable upload protocol:
/// authenticate, initiate, transfer in chunks, finalize and verify.
pub struct YouTubeAgent {
    client: Client,
    config: YoutubeSection,
    store: Arc<SessionStore>,
}

impl std::fmt::Debug for YouTubeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YouTubeAgent")
            .field("upload_endpoint", &self.config.upload_endpoint)
            .finish()
    }
}

/// Maps an API status to the failure taxonomy.
pub(crate) fn classify_status(status: StatusCode, body: &str) -> FailureKind {
    let lowered = body.to_ascii_lowercase();
    match status.as_u16() {
        401 => FailureKind::AuthRequired,
        429 => FailureKind::QuotaExceeded,
        403 if lowered.contains("quota") || lowered.contains("ratelimit") => {
            FailureKind::QuotaExceeded
        }
        408 => FailureKind::TransientNetwork,
        code if code >= 500 => FailureKind::TransientNetwork,
        _ => FailureKind::PlatformRejected,
    }
}

fn transport_failure(err: reqwest::Error) -> PublishFailure {
    PublishFailure::new(FailureKind::TransientNetwork, err.to_string())
}

async fn status_failure(response: Response, stage: &str) -> PublishFailure {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let kind = classify_status(status, &body);
    PublishFailure::new(kind, format!("{stage} returned {status}: {}", body.trim()))
}

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("mov") => "video/quicktime",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        _ => "video/mp4",
    }
}

/// Parses `Range: bytes=0-1234` into the next byte offset to send.
fn next_offset(range: Option<&str>) -> u64 {
    range
        .and_then(|value| value.rsplit('-').next())
        .and_then(|end| end.trim().parse::<u64>().ok())
        .map(|end| end + 1)
        .unwrap_or(0)
}

impl YouTubeAgent {
    pub fn new(config: &YoutubeSection, store: Arc<SessionStore>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            config: config.clone(),
            store,
        }
    }

    fn credentials(record: &SessionRecord) -> PublishResult<(Credentials, bool)> {
        match &record.auth {
            Some(AuthState::Token {
                access_token,
                refresh_token,
                expires_at,
            }) => {
                let expiring = expires_at
                    .map(|at| at - ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECONDS) <= Utc::now())
                    .unwrap_or(false);
                Ok((
                    Credentials {
                        access_token: access_token.clone(),
                        refresh_token: refresh_token.clone(),
                    },
                    expiring,
                ))
            }
            _ => Err(PublishFailure::new(
                FailureKind::AuthRequired,
                "youtube session holds no OAuth token",
            )),
        }
    }

    fn client_credentials(&self) -> PublishResult<(String, String)> {
        let read = |name: &str| {
            std::env::var(name).map_err(|_| {
                PublishFailure::new(
                    FailureKind::AuthRequired,
                    format!("environment variable {name} is not set"),
                )
            })
        };
        Ok((
            read(&self.config.client_id_env)?,
            read(&self.config.client_secret_env)?,
        ))
    }

    async fn refresh(&self, refresh_token: Option<&str>) -> PublishResult<AuthState> {
        let refresh_token = refresh_token.ok_or_else(|| {
            PublishFailure::new(
                FailureKind::AuthRequired,
                "access token expired and no refresh token is stored",
            )
        })?;
        let (client_id, client_secret) = self.client_credentials()?;
        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(transport_failure)?;
        if !response.status().is_success() {
            let mut failure = status_failure(response, "token refresh").await;
            if failure.kind == FailureKind::PlatformRejected {
                failure.kind = FailureKind::AuthRequired;
            }
            return Err(failure);
        }
        let token: TokenResponse = response.json().await.map_err(|err| {
            PublishFailure::new(FailureKind::AuthRequired, format!("malformed token response: {err}"))
        })?;
        info!(platform = %PlatformId::YouTube, "access token refreshed");
        Ok(AuthState::Token {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or_else(|| Some(refresh_token.to_string())),
            expires_at: token
                .expires_in
                .map(|seconds| Utc::now() + ChronoDuration::seconds(seconds)),
        })
    }

    /// Refreshes the token and persists it so sibling runs see the new state.
    async fn refresh_and_store(&self, credentials: &mut Credentials) -> PublishResult<()> {
        let state = self.refresh(credentials.refresh_token.as_deref()).await?;
        if let AuthState::Token {
            access_token,
            refresh_token,
            ..
        } = &state
        {
            credentials.access_token = access_token.clone();
            credentials.refresh_token = refresh_token.clone();
        }
        if let Err(err) = self.store.save(PlatformId::YouTube, state).await {
            warn!(error = %err, "failed to persist refreshed youtube token");
        }
        Ok(())
    }

    fn metadata(&self, content: &ContentBundle) -> serde_json::Value {
        let tags: Vec<String> = content
            .hashtags
            .iter()
            .map(|tag| tag.trim_start_matches('#').to_string())
            .filter(|tag| !tag.is_empty())
            .collect();
        let mut description = content.description.clone();
        if let Some(cta) = &content.call_to_action {
            description = format!("{description}\n\n{cta}");
        }
        let hashtags = content.hashtags.join(" ");
        if !hashtags.is_empty() {
            description = format!("{description}\n\n{hashtags}");
        }
        let title: String = content.title.chars().take(100).collect();
        json!({
            "snippet": {
                "title": title,
                "description": description.trim(),
                "tags": tags,
                "categoryId": self.config.category_id,
            },
            "status": {
                "privacyStatus": self.config.privacy_status,
                "selfDeclaredMadeForKids": false,
            }
        })
    }

    async fn initiate(
        &self,
        credentials: &Credentials,
        asset: &MediaAsset,
        content: &ContentBundle,
    ) -> PublishResult<Result<String, Response>> {
        let response = self
            .client
            .post(&self.config.upload_endpoint)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
            .header("X-Upload-Content-Type", content_type_for(&asset.local_path))
            .header("X-Upload-Content-Length", asset.size_bytes.to_string())
            .json(&self.metadata(content))
            .send()
            .await
            .map_err(transport_failure)?;
        if !response.status().is_success() {
            return Ok(Err(response));
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                PublishFailure::new(
                    FailureKind::PlatformRejected,
                    "upload session created without a Location header",
                )
            })?;
        Ok(Ok(location))
    }

    async fn transfer(
        &self,
        credentials: &Credentials,
        session_url: &str,
        asset: &MediaAsset,
        request: &PublishRequest,
    ) -> PublishResult<String> {
        let mut file = tokio::fs::File::open(&asset.local_path).await.map_err(|err| {
            PublishFailure::new(
                FailureKind::PreparationFailed,
                format!("cannot open {}: {err}", asset.local_path.display()),
            )
        })?;
        let total = asset.size_bytes;
        let chunk_size = self.config.chunk_size_bytes.max(1);
        let mut offset = 0u64;
        let mut stalls = 0u32;
        loop {
            if request.cancel.is_cancelled() {
                return Err(PublishFailure::new(FailureKind::Cancelled, "upload cancelled"));
            }
            let len = chunk_size.min(total.saturating_sub(offset));
            let mut chunk = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|err| PublishFailure::new(FailureKind::PreparationFailed, err.to_string()))?;
            file.read_exact(&mut chunk)
                .await
                .map_err(|err| PublishFailure::new(FailureKind::PreparationFailed, err.to_string()))?;
            let range = if len == 0 {
                format!("bytes */{total}")
            } else {
                format!("bytes {}-{}/{}", offset, offset + len - 1, total)
            };
            debug!(%range, "uploading chunk");
            let response = self
                .client
                .put(session_url)
                .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
                .header(CONTENT_LENGTH, len.to_string())
                .header(CONTENT_TYPE, content_type_for(&asset.local_path))
                .header(CONTENT_RANGE, range)
                .body(chunk)
                .send()
                .await
                .map_err(transport_failure)?;

            match response.status().as_u16() {
                RESUME_INCOMPLETE => {
                    let received = response
                        .headers()
                        .get(RANGE)
                        .and_then(|value| value.to_str().ok());
                    let next = next_offset(received);
                    if next <= offset {
                        stalls += 1;
                        if stalls >= MAX_STALLED_CHUNKS || len == 0 {
                            return Err(PublishFailure::new(
                                FailureKind::TransientNetwork,
                                format!("upload stalled at byte {offset}"),
                            ));
                        }
                    } else {
                        stalls = 0;
                    }
                    offset = next;
                }
                200 | 201 => {
                    let video: UploadedVideo = response.json().await.map_err(|err| {
                        PublishFailure::new(
                            FailureKind::Unconfirmed,
                            format!("upload finished without a video id: {err}"),
                        )
                    })?;
                    return Ok(video.id);
                }
                _ => return Err(status_failure(response, "chunk upload").await),
            }
        }
    }

    async fn verify(&self, credentials: &Credentials, video_id: &str) -> PublishResult<Artifact> {
        let response = self
            .client
            .get(&self.config.videos_endpoint)
            .query(&[("part", "status"), ("id", video_id)])
            .header(AUTHORIZATION, format!("Bearer {}", credentials.access_token))
            .send()
            .await
            .map_err(transport_failure)?;
        if !response.status().is_success() {
            return Err(status_failure(response, "verification").await);
        }
        let list: VideoList = response.json().await.map_err(|err| {
            PublishFailure::new(FailureKind::Unconfirmed, format!("malformed video list: {err}"))
        })?;
        let item = list
            .items
            .into_iter()
            .find(|item| item.id == video_id)
            .ok_or_else(|| {
                PublishFailure::new(
                    FailureKind::Unconfirmed,
                    format!("video {video_id} not visible after upload"),
                )
            })?;
        if let Some(status) = item.status {
            if matches!(status.upload_status.as_deref(), Some("rejected") | Some("failed")) {
                let reason = status
                    .rejection_reason
                    .or(status.failure_reason)
                    .unwrap_or_else(|| "unspecified".into());
                return Err(PublishFailure::new(
                    FailureKind::PlatformRejected,
                    format!("video {video_id} {}: {reason}", status.upload_status.unwrap_or_default()),
                ));
            }
        }
        info!(platform = %PlatformId::YouTube, video_id, "upload verified");
        Ok(Artifact {
            reference: format!("youtube:{video_id}"),
            url: Some(format!("https://www.youtube.com/watch?v={video_id}")),
        })
    }
}

#[async_trait]
impl PublishAgent for YouTubeAgent {
    fn platform(&self) -> PlatformId {
        PlatformId::YouTube
    }

    fn strategy(&self) -> AgentStrategy {
        AgentStrategy::NativeApi
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        progress: &dyn PublishProgress,
    ) -> PublishResult<Artifact> {
        let (mut credentials, expiring) = Self::credentials(&request.session)?;
        if expiring {
            self.refresh_and_store(&mut credentials).await?;
        }

        let session_url = match self.initiate(&credentials, &request.asset, &request.content).await? {
            Ok(url) => url,
            Err(response) if response.status() == StatusCode::UNAUTHORIZED => {
                debug!("access token rejected, refreshing once");
                self.refresh_and_store(&mut credentials).await?;
                match self.initiate(&credentials, &request.asset, &request.content).await? {
                    Ok(url) => url,
                    Err(response) => return Err(status_failure(response, "upload initiation").await),
                }
            }
            Err(response) => return Err(status_failure(response, "upload initiation").await),
        };

        progress.advance(PublishPhase::Uploading);
        let video_id = self
            .transfer(&credentials, &session_url, &request.asset, request)
            .await?;
        info!(platform = %PlatformId::YouTube, video_id = %video_id, "upload finalized");

        progress.advance(PublishPhase::Confirming);
        self.verify(&credentials, &video_id).await
    }

    async fn reauthenticate(
        &self,
        record: &SessionRecord,
        _ctx: &ReauthContext,
    ) -> PublishResult<AuthState> {
        let refresh_token = match &record.auth {
            Some(AuthState::Token { refresh_token, .. }) => refresh_token.clone(),
            _ => None,
        };
        if refresh_token.is_none() {
            return Err(PublishFailure::new(
                FailureKind::AuthRequired,
                format!(
                    "youtube session is {}; import an OAuth token with a refresh token",
                    record.validity
                ),
            ));
        }
        self.refresh(refresh_token.as_deref()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::NoProgress;
    use crate::media::MediaKind;
    use crate::session::{MemoryBackend, ValidityState};
    use mockito::{Matcher, Server};
    use std::path::PathBuf;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn section(server: &Server, chunk: u64) -> YoutubeSection {
        YoutubeSection {
            client_id_env: "CROSSPOST_TEST_YT_ID".into(),
            client_secret_env: "CROSSPOST_TEST_YT_SECRET".into(),
            token_endpoint: format!("{}/token", server.url()),
            upload_endpoint: format!("{}/upload/youtube/v3/videos", server.url()),
            videos_endpoint: format!("{}/youtube/v3/videos", server.url()),
            chunk_size_bytes: chunk,
            ..YoutubeSection::default()
        }
    }

    fn request(path: PathBuf, size: u64, expires_in: i64) -> PublishRequest {
        PublishRequest {
            run_id: "run-yt".into(),
            platform: PlatformId::YouTube,
            asset: MediaAsset {
                local_path: path,
                kind: MediaKind::Video,
                duration_seconds: None,
                dimensions: None,
                size_bytes: size,
                checksum: "00".repeat(32),
                derived_from: None,
            },
            content: ContentBundle {
                title: "Harbor".into(),
                description: "Evening boats".into(),
                hashtags: vec!["#shorts".into()],
                call_to_action: None,
                target_platform: PlatformId::YouTube,
                score: None,
            },
            session: SessionRecord {
                platform: PlatformId::YouTube,
                auth: Some(AuthState::Token {
                    access_token: "live-token".into(),
                    refresh_token: Some("refresh".into()),
                    expires_at: Some(Utc::now() + ChronoDuration::seconds(expires_in)),
                }),
                captured_at: Some(Utc::now()),
                validity: ValidityState::Valid,
            },
            capture_dir: PathBuf::from("/tmp/unused"),
            cancel: CancellationToken::new(),
        }
    }

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(Arc::new(MemoryBackend::new())))
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, ""), FailureKind::AuthRequired);
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#),
            FailureKind::QuotaExceeded
        );
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), FailureKind::QuotaExceeded);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY, ""), FailureKind::TransientNetwork);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST, "invalid title"), FailureKind::PlatformRejected);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, "forbidden"), FailureKind::PlatformRejected);
    }

    #[test]
    fn range_header_gives_next_offset() {
        assert_eq!(next_offset(Some("bytes=0-262143")), 262144);
        assert_eq!(next_offset(None), 0);
    }

    #[tokio::test]
    async fn resumable_upload_in_two_chunks() {
        let mut server = Server::new_async().await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![7u8; 10]).unwrap();

        let session_url = format!("{}/session/abc", server.url());
        let initiate = server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::UrlEncoded("uploadType".into(), "resumable".into()))
            .match_header("authorization", "Bearer live-token")
            .with_status(200)
            .with_header("location", &session_url)
            .create_async()
            .await;
        let first = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 0-5/10")
            .with_status(308)
            .with_header("range", "bytes=0-5")
            .create_async()
            .await;
        let second = server
            .mock("PUT", "/session/abc")
            .match_header("content-range", "bytes 6-9/10")
            .with_status(200)
            .with_body(r#"{"id":"vid123"}"#)
            .create_async()
            .await;
        let verify = server
            .mock("GET", "/youtube/v3/videos")
            .match_query(Matcher::UrlEncoded("id".into(), "vid123".into()))
            .with_status(200)
            .with_body(r#"{"items":[{"id":"vid123","status":{"uploadStatus":"uploaded"}}]}"#)
            .create_async()
            .await;

        let agent = YouTubeAgent::new(&section(&server, 6), store());
        let artifact = agent
            .publish(&request(path, 10, 3600), &NoProgress)
            .await
            .unwrap();
        assert_eq!(artifact.reference, "youtube:vid123");
        initiate.assert_async().await;
        first.assert_async().await;
        second.assert_async().await;
        verify.assert_async().await;
    }

    #[tokio::test]
    async fn quota_rejection_is_not_retryable() {
        let mut server = Server::new_async().await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![1u8; 4]).unwrap();
        server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_body(r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#)
            .create_async()
            .await;

        let agent = YouTubeAgent::new(&section(&server, 262144), store());
        let failure = agent
            .publish(&request(path, 4, 3600), &NoProgress)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::QuotaExceeded);
        assert!(!failure.kind.is_retryable());
    }

    #[tokio::test]
    async fn rejected_video_surfaces_reason() {
        let mut server = Server::new_async().await;
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, vec![1u8; 4]).unwrap();
        let session_url = format!("{}/session/xyz", server.url());
        server
            .mock("POST", "/upload/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("location", &session_url)
            .create_async()
            .await;
        server
            .mock("PUT", "/session/xyz")
            .with_status(201)
            .with_body(r#"{"id":"dup1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/youtube/v3/videos")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"items":[{"id":"dup1","status":{"uploadStatus":"rejected","rejectionReason":"duplicate"}}]}"#,
            )
            .create_async()
            .await;

        let agent = YouTubeAgent::new(&section(&server, 262144), store());
        let failure = agent
            .publish(&request(path, 4, 3600), &NoProgress)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::PlatformRejected);
        assert!(failure.message.contains("duplicate"));
    }

    #[tokio::test]
    async fn reauth_without_refresh_token_requires_login() {
        let server = Server::new_async().await;
        let agent = YouTubeAgent::new(&section(&server, 262144), store());
        let record = SessionRecord {
            platform: PlatformId::YouTube,
            auth: None,
            captured_at: None,
            validity: ValidityState::Corrupt,
        };
        let ctx = ReauthContext {
            run_id: "run-yt".into(),
            interactive: false,
            capture_dir: PathBuf::from("/tmp/unused"),
            cancel: CancellationToken::new(),
        };
        let failure = agent.reauthenticate(&record, &ctx).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::AuthRequired);
    }
}
