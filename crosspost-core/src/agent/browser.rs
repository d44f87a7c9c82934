use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser::{
    capture_page, BrowserError, BrowserLauncher, BrowserPage, LaunchRequest, RetryPolicy,
};
use crate::config::AutomationSection;
use crate::media::MediaKind;
use crate::platform::PlatformId;
use crate::session::{AuthState, SessionRecord};

use super::platforms::{AgentStrategy, BrowserScript};
use super::{
    Artifact, FailureKind, PublishAgent, PublishFailure, PublishPhase, PublishProgress,
    PublishRequest, PublishResult, ReauthContext,
};

/// A failure together with the stage it happened in, used to name captures.
struct StageFailure {
    stage: &'static str,
    failure: PublishFailure,
}

impl StageFailure {
    fn new(stage: &'static str, failure: PublishFailure) -> Self {
        Self { stage, failure }
    }

    fn browser(stage: &'static str, err: BrowserError) -> Self {
        Self::new(stage, err.into())
    }
}

type StageResult<T> = Result<T, StageFailure>;

#[derive(Debug, Clone)]
struct Timing {
    element: RetryPolicy,
    confirm_timeout: Duration,
    confirm_poll: Duration,
    login_timeout: Duration,
    login_poll: Duration,
}

/// Drives a platform's web upload flow through a browser page:
/// launch, restore session, navigate, locate the upload surface, attach
/// media, type the caption, submit and confirm.
pub struct BrowserAgent {
    platform: PlatformId,
    script: BrowserScript,
    launcher: Arc<dyn BrowserLauncher>,
    media_kinds: Vec<MediaKind>,
    timing: Timing,
}

impl std::fmt::Debug for BrowserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserAgent")
            .field("platform", &self.platform)
            .field("upload_url", &self.script.upload_url)
            .finish()
    }
}

impl BrowserAgent {
    pub fn new(
        platform: PlatformId,
        script: BrowserScript,
        launcher: Arc<dyn BrowserLauncher>,
        automation: &AutomationSection,
    ) -> Self {
        Self {
            platform,
            script,
            launcher,
            media_kinds: vec![MediaKind::Video],
            timing: Timing {
                element: RetryPolicy::for_elements(automation),
                confirm_timeout: automation.confirm_timeout(),
                confirm_poll: Duration::from_millis(automation.confirm_poll_ms.max(1)),
                login_timeout: automation.login_timeout(),
                login_poll: Duration::from_millis(automation.login_poll_ms.max(1)),
            },
        }
    }

    pub fn with_media_kinds(mut self, kinds: Vec<MediaKind>) -> Self {
        self.media_kinds = kinds;
        self
    }

    pub fn script(&self) -> &BrowserScript {
        &self.script
    }

    async fn drive(
        &self,
        page: &dyn BrowserPage,
        request: &PublishRequest,
        progress: &dyn PublishProgress,
    ) -> StageResult<Artifact> {
        let cookies = request.session.cookies();
        let restored = !cookies.is_empty();
        if restored {
            page.set_cookies(cookies)
                .await
                .map_err(|err| StageFailure::browser("restore_session", err))?;
            debug!(platform = %self.platform, count = cookies.len(), "session cookies restored");
        }

        page.navigate(&self.script.upload_url)
            .await
            .map_err(|err| StageFailure::browser("navigate", err))?;
        self.ensure_logged_in(page, restored).await?;

        let caption = request.content.caption();
        let text = match request.asset.kind {
            MediaKind::Text => {
                let body = self.read_status_text(request).await?;
                let status = match (body.is_empty(), caption.trim().is_empty()) {
                    (true, true) => {
                        return Err(StageFailure::new(
                            "read_status_text",
                            PublishFailure::new(FailureKind::PreparationFailed, "status text is empty"),
                        ))
                    }
                    (false, true) => body,
                    (true, false) => caption,
                    (false, false) => format!("{body}\n\n{caption}"),
                };
                self.open_status_composer(page, progress).await?;
                status
            }
            MediaKind::Video | MediaKind::Image => {
                self.attach_media(page, request, progress).await?;
                caption
            }
        };

        if !text.trim().is_empty() {
            let field = self
                .first_present(page, &self.script.caption_input)
                .await
                .map_err(|err| StageFailure::browser("inject_caption", err))?;
            page.type_text(&field, &text)
                .await
                .map_err(|err| StageFailure::browser("inject_caption", err))?;
        }

        self.click_first(page, &self.script.submit)
            .await
            .map_err(|err| StageFailure::browser("submit", err))?;
        info!(platform = %self.platform, "upload submitted");

        progress.advance(PublishPhase::Confirming);
        self.confirm(page).await
    }

    async fn attach_media(
        &self,
        page: &dyn BrowserPage,
        request: &PublishRequest,
        progress: &dyn PublishProgress,
    ) -> StageResult<()> {
        if !self.script.open_composer.is_empty() {
            self.click_first(page, &self.script.open_composer)
                .await
                .map_err(|err| StageFailure::browser("locate_upload_surface", err))?;
        }

        progress.advance(PublishPhase::Uploading);
        let input = self
            .first_present(page, &self.script.file_input)
            .await
            .map_err(|err| StageFailure::browser("locate_upload_surface", err))?;
        page.upload_file(&input, &request.asset.local_path)
            .await
            .map_err(|err| StageFailure::browser("inject_media", err))?;
        info!(platform = %self.platform, path = %request.asset.local_path.display(), "media attached");
        self.wait_for_media(page).await;

        for step in &self.script.after_media {
            self.click_first(page, step)
                .await
                .map_err(|err| StageFailure::browser("inject_media", err))?;
        }
        Ok(())
    }

    /// Text assets become the body of a status post; nothing is uploaded.
    async fn read_status_text(&self, request: &PublishRequest) -> StageResult<String> {
        if self.script.status_composer.is_empty() {
            return Err(StageFailure::new(
                "locate_status_surface",
                PublishFailure::new(
                    FailureKind::PlatformRejected,
                    format!("{} has no text status surface", self.platform),
                ),
            ));
        }
        let body = tokio::fs::read_to_string(&request.asset.local_path)
            .await
            .map_err(|err| {
                StageFailure::new(
                    "read_status_text",
                    PublishFailure::new(
                        FailureKind::PreparationFailed,
                        format!("{}: {err}", request.asset.local_path.display()),
                    ),
                )
            })?;
        Ok(body.trim().to_string())
    }

    async fn open_status_composer(
        &self,
        page: &dyn BrowserPage,
        progress: &dyn PublishProgress,
    ) -> StageResult<()> {
        self.click_first(page, &self.script.status_composer)
            .await
            .map_err(|err| StageFailure::browser("locate_status_surface", err))?;
        progress.advance(PublishPhase::Uploading);
        debug!(platform = %self.platform, "status composer opened");
        Ok(())
    }

    async fn ensure_logged_in(&self, page: &dyn BrowserPage, restored: bool) -> StageResult<()> {
        let url = page
            .current_url()
            .await
            .map_err(|err| StageFailure::browser("navigate", err))?;
        if !self.script.is_login_url(&url) {
            return Ok(());
        }
        if restored {
            debug!(platform = %self.platform, %url, "login wall after cookie restore, reloading once");
            page.reload()
                .await
                .map_err(|err| StageFailure::browser("navigate", err))?;
            let url = page
                .current_url()
                .await
                .map_err(|err| StageFailure::browser("navigate", err))?;
            if !self.script.is_login_url(&url) {
                return Ok(());
            }
        }
        Err(StageFailure::new(
            "navigate",
            PublishFailure::new(
                FailureKind::AuthRequired,
                format!("{} redirected to a login page: {url}", self.platform),
            ),
        ))
    }

    /// Returns the first candidate present on the page, retrying with backoff.
    async fn first_present(
        &self,
        page: &dyn BrowserPage,
        candidates: &[String],
    ) -> Result<String, BrowserError> {
        let outcome = self
            .timing
            .element
            .run(
                |_| async move {
                    for candidate in candidates {
                        if page.is_present(candidate).await? {
                            return Ok(candidate.clone());
                        }
                    }
                    Err(BrowserError::ElementNotFound(candidates.join(" | ")))
                },
                |err| matches!(err, BrowserError::ElementNotFound(_)),
            )
            .await?;
        Ok(outcome.result)
    }

    async fn click_first(
        &self,
        page: &dyn BrowserPage,
        candidates: &[String],
    ) -> Result<(), BrowserError> {
        let selector = self.first_present(page, candidates).await?;
        page.click(&selector).await
    }

    /// Waits for the platform's processing indicator. Proceeds on timeout.
    async fn wait_for_media(&self, page: &dyn BrowserPage) {
        if self.script.media_ready.is_empty() {
            return;
        }
        let deadline = Instant::now() + self.timing.confirm_timeout;
        while Instant::now() < deadline {
            for selector in &self.script.media_ready {
                if matches!(page.is_present(selector).await, Ok(true)) {
                    return;
                }
            }
            sleep(self.timing.confirm_poll).await;
        }
        warn!(platform = %self.platform, "media processing indicator never appeared, continuing");
    }

    /// Requires a positive signal; silence after submit is `Unconfirmed`.
    async fn confirm(&self, page: &dyn BrowserPage) -> StageResult<Artifact> {
        let deadline = Instant::now() + self.timing.confirm_timeout;
        loop {
            let url = page.current_url().await.unwrap_or_default();
            if self.script.matches_success_url(&url) {
                return Ok(self.artifact(url, "url"));
            }
            for selector in &self.script.success_selectors {
                if matches!(page.is_present(selector).await, Ok(true)) {
                    return Ok(self.artifact(url, selector));
                }
            }
            if Instant::now() >= deadline {
                return Err(StageFailure::new(
                    "confirm_success",
                    PublishFailure::new(
                        FailureKind::Unconfirmed,
                        format!(
                            "no success signal within {}s after submit",
                            self.timing.confirm_timeout.as_secs()
                        ),
                    ),
                ));
            }
            sleep(self.timing.confirm_poll).await;
        }
    }

    fn artifact(&self, url: String, signal: &str) -> Artifact {
        info!(platform = %self.platform, %url, signal, "publish confirmed");
        let reference = if url.is_empty() {
            format!("{}:confirmed@{}", self.platform, Utc::now().to_rfc3339())
        } else {
            url.clone()
        };
        Artifact {
            reference,
            url: (!url.is_empty()).then_some(url),
        }
    }

    async fn await_login(&self, page: &dyn BrowserPage) -> PublishResult<()> {
        page.navigate(&self.script.login_url).await?;
        let deadline = Instant::now() + self.timing.login_timeout;
        loop {
            sleep(self.timing.login_poll).await;
            let url = page.current_url().await.unwrap_or_default();
            if !url.is_empty() && !self.script.is_login_url(&url) {
                info!(platform = %self.platform, %url, "interactive login completed");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PublishFailure::new(
                    FailureKind::AuthRequired,
                    format!(
                        "login not completed within {}s",
                        self.timing.login_timeout.as_secs()
                    ),
                ));
            }
        }
    }
}

#[async_trait]
impl PublishAgent for BrowserAgent {
    fn platform(&self) -> PlatformId {
        self.platform
    }

    fn strategy(&self) -> AgentStrategy {
        AgentStrategy::BrowserDriven
    }

    fn supports(&self, kind: MediaKind) -> bool {
        self.media_kinds.contains(&kind)
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        progress: &dyn PublishProgress,
    ) -> PublishResult<Artifact> {
        let page = self
            .launcher
            .launch(LaunchRequest {
                platform: self.platform,
                headless: self.launcher.default_headless(),
            })
            .await?;

        let outcome = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(StageFailure::new(
                "cancelled",
                PublishFailure::new(FailureKind::Cancelled, "publish cancelled"),
            )),
            result = self.drive(page.as_ref(), request, progress) => result,
        };

        let result = match outcome {
            Ok(artifact) => Ok(artifact),
            Err(StageFailure { stage, failure }) => {
                warn!(platform = %self.platform, stage, kind = %failure.kind, error = %failure.message, "browser publish failed");
                let diagnostic = capture_page(page.as_ref(), &request.capture_dir, stage).await;
                Err(failure.with_diagnostic(diagnostic))
            }
        };
        if let Err(err) = page.close().await {
            warn!(platform = %self.platform, error = %err, "browser teardown failed");
        }
        result
    }

    async fn reauthenticate(
        &self,
        record: &SessionRecord,
        ctx: &ReauthContext,
    ) -> PublishResult<AuthState> {
        if !ctx.interactive {
            return Err(PublishFailure::new(
                FailureKind::AuthRequired,
                format!(
                    "{} session is {} and interactive login is unavailable",
                    self.platform, record.validity
                ),
            ));
        }
        info!(platform = %self.platform, validity = %record.validity, "starting interactive login");
        let page = self
            .launcher
            .launch(LaunchRequest {
                platform: self.platform,
                headless: false,
            })
            .await?;

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(PublishFailure::new(FailureKind::Cancelled, "login cancelled")),
            result = self.await_login(page.as_ref()) => result,
        };
        let result = match outcome {
            Ok(()) => match page.cookies().await {
                Ok(cookies) if !cookies.is_empty() => Ok(AuthState::Cookies { cookies }),
                Ok(_) => Err(PublishFailure::new(
                    FailureKind::AuthRequired,
                    "login finished without any cookies",
                )),
                Err(err) => Err(err.into()),
            },
            Err(failure) => {
                let diagnostic = capture_page(page.as_ref(), &ctx.capture_dir, "login").await;
                Err(failure.with_diagnostic(diagnostic))
            }
        };
        if let Err(err) = page.close().await {
            warn!(platform = %self.platform, error = %err, "browser teardown failed");
        }
        result
    }
}
