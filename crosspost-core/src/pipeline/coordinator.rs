use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{
    AgentStrategy, AgentTable, Artifact, FailureKind, PublishAgent, PublishFailure, PublishPhase,
    PublishProgress, PublishRequest, PublishResult, ReauthContext,
};
use crate::browser::RetryPolicy;
use crate::collaborators::{
    AntiFingerprint, ContentGenerator, ContentRequest, ContentSubject, DownloadRequest,
    EnhancementLevel, MediaDownloader, MediaTransformer, PlatformFormat, TemplateContentGenerator,
    TransformOp,
};
use crate::config::CrosspostConfig;
use crate::driver::DriverResolver;
use crate::environment::EnvironmentProfile;
use crate::media::{ContentBundle, MediaAsset, MediaKind};
use crate::platform::PlatformId;
use crate::session::{AuthState, SessionRecord, SessionStore, StaleOutcome, ValidityState};
use crate::telemetry::PublishTelemetry;

use super::attempt::{AttemptState, PipelineRun, PublishAttempt};
use super::{PipelineError, PipelineResult};

/// Where the media for a run comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    Local(PathBuf),
    Remote(String),
}

impl SourceSpec {
    pub fn parse(value: &str) -> PipelineResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidSource(value.to_string()));
        }
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            url::Url::parse(trimmed)
                .map_err(|err| PipelineError::InvalidSource(format!("{trimmed}: {err}")))?;
            return Ok(SourceSpec::Remote(trimmed.to_string()));
        }
        Ok(SourceSpec::Local(PathBuf::from(trimmed)))
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Local(path) => write!(f, "{}", path.display()),
            SourceSpec::Remote(url) => f.write_str(url),
        }
    }
}

/// Everything a run needs, built once at startup and shared by every attempt.
pub struct PipelineContext {
    pub config: Arc<CrosspostConfig>,
    pub environment: EnvironmentProfile,
    pub sessions: Arc<SessionStore>,
    pub agents: AgentTable,
    pub downloader: Arc<dyn MediaDownloader>,
    pub generator: Arc<dyn ContentGenerator>,
    pub transformer: Arc<dyn MediaTransformer>,
    pub telemetry: Option<Arc<PublishTelemetry>>,
    /// Checked before publishing; a failure only aborts all-browser runs.
    pub driver: Option<Arc<DriverResolver>>,
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("environment", &self.environment)
            .field("sessions", &self.sessions)
            .field("agents", &self.agents)
            .field("telemetry", &self.telemetry.is_some())
            .field("driver", &self.driver.is_some())
            .finish()
    }
}

struct Acquired {
    asset: MediaAsset,
    title: Option<String>,
}

/// Everything one attempt task owns.
struct AttemptJob {
    run_id: String,
    platform: PlatformId,
    agent: Arc<dyn PublishAgent>,
    asset: MediaAsset,
    content: ContentBundle,
    capture_dir: PathBuf,
}

/// Feeds agent phases into the shared attempt record.
struct AttemptProgress {
    attempt: Arc<Mutex<PublishAttempt>>,
}

impl AttemptProgress {
    fn update<R>(&self, apply: impl FnOnce(&mut PublishAttempt) -> R) -> R {
        let mut guard = match self.attempt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard)
    }

    fn snapshot(&self) -> PublishAttempt {
        self.update(|attempt| attempt.clone())
    }
}

impl PublishProgress for AttemptProgress {
    fn advance(&self, phase: PublishPhase) {
        let state = match phase {
            PublishPhase::Uploading => AttemptState::Uploading,
            PublishPhase::Confirming => AttemptState::Confirming,
        };
        self.update(|attempt| attempt.advance(state));
    }
}

#[derive(Debug, Clone)]
pub struct PipelineCoordinator {
    ctx: Arc<PipelineContext>,
}

impl PipelineCoordinator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Runs acquisition, preparation and publishing for `targets`. Per-platform
    /// trouble ends up on the attempt; only run-fatal conditions are errors.
    pub async fn run(
        &self,
        source: &SourceSpec,
        targets: &[PlatformId],
        cancel: CancellationToken,
    ) -> PipelineResult<PipelineRun> {
        if targets.is_empty() {
            return Err(PipelineError::NoTargets);
        }
        if let Some(missing) = targets.iter().find(|p| self.ctx.agents.get(**p).is_none()) {
            return Err(PipelineError::MissingAgent(*missing));
        }

        let run_id = Uuid::new_v4().to_string();
        let mut run = PipelineRun::new(run_id.clone(), targets);
        let platforms = run.requested_platforms.clone();
        let strategy = self.ctx.config.pipeline.strategy;
        info!(run_id = %run_id, %source, %strategy, ?platforms, "pipeline run started");

        self.preflight_driver(&platforms).await?;

        let acquired = match self.acquire(source, &run_id).await {
            Ok(acquired) => acquired,
            Err(failure) => {
                warn!(run_id = %run_id, error = %failure, "acquisition failed");
                for attempt in run.attempts.values_mut() {
                    attempt.fail(failure.clone());
                }
                return Ok(self.finish(run));
            }
        };

        let platforms = self.supported_platforms(&mut run, &platforms, acquired.asset.kind);
        let contents = self.generate_all(&acquired, &platforms).await;
        let assets = self.transform_all(&acquired.asset, &platforms, &run_id).await;

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.pipeline.max_concurrency.max(1)));
        let mut handles = Vec::new();
        for platform in &platforms {
            let (Some(agent), Some(content), Some(asset)) = (
                self.ctx.agents.get(*platform),
                contents.get(platform).cloned(),
                assets.get(platform).cloned(),
            ) else {
                continue;
            };
            let shared = match run.attempt_mut(*platform) {
                Some(attempt) => {
                    attempt.asset_ref = Some(asset.reference());
                    attempt.content_ref = Some(content.title.clone());
                    Arc::new(Mutex::new(attempt.clone()))
                }
                None => continue,
            };
            let job = AttemptJob {
                run_id: run_id.clone(),
                platform: *platform,
                agent,
                asset,
                content,
                capture_dir: self
                    .ctx
                    .config
                    .captures_dir()
                    .join(&run_id)
                    .join(platform.as_str()),
            };
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let progress = AttemptProgress {
                attempt: Arc::clone(&shared),
            };
            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                match permit {
                    Some(_permit) => drive_attempt(&ctx, job, &progress, &cancel).await,
                    None => {
                        progress.update(|attempt| {
                            attempt.fail(PublishFailure::new(
                                FailureKind::Cancelled,
                                "run cancelled before the attempt started",
                            ))
                        });
                    }
                }
                progress.snapshot()
            });
            handles.push((*platform, shared, handle));
        }

        for (platform, shared, handle) in handles {
            let attempt = match handle.await {
                Ok(attempt) => attempt,
                Err(err) => {
                    warn!(run_id = %run_id, %platform, error = %err, "attempt task aborted");
                    let mut attempt = AttemptProgress { attempt: shared }.snapshot();
                    attempt.fail(PublishFailure::new(
                        FailureKind::Cancelled,
                        format!("attempt task aborted: {err}"),
                    ));
                    attempt
                }
            };
            run.attempts.insert(platform, attempt);
        }

        Ok(self.finish(run))
    }

    fn finish(&self, mut run: PipelineRun) -> PipelineRun {
        for attempt in run.attempts.values_mut() {
            if !attempt.state.is_terminal() {
                attempt.fail(PublishFailure::new(
                    FailureKind::PreparationFailed,
                    "attempt never reached the publish stage",
                ));
            }
        }
        run.finished_at = Some(Utc::now());
        for attempt in run.attempts.values() {
            self.record_attempt(&run.run_id, attempt);
        }
        if let Some(telemetry) = &self.ctx.telemetry {
            if let Err(err) = telemetry.record_run(&run) {
                warn!(run_id = %run.run_id, error = %err, "failed to record run telemetry");
            }
        }
        info!(run_id = %run.run_id, overall = %run.overall_state(), "pipeline run finished");
        run
    }

    fn record_attempt(&self, run_id: &str, attempt: &PublishAttempt) {
        if let Some(telemetry) = &self.ctx.telemetry {
            if let Err(err) = telemetry.record_attempt(run_id, attempt) {
                warn!(run_id, platform = %attempt.platform, error = %err, "failed to record attempt telemetry");
            }
        }
    }

    /// Fails targets that cannot post this kind of asset before anything is published.
    fn supported_platforms(
        &self,
        run: &mut PipelineRun,
        platforms: &[PlatformId],
        kind: MediaKind,
    ) -> Vec<PlatformId> {
        let mut supported = Vec::with_capacity(platforms.len());
        for platform in platforms {
            if self.ctx.agents.supports(*platform, kind) {
                supported.push(*platform);
                continue;
            }
            warn!(run_id = %run.run_id, %platform, %kind, "platform does not accept this media kind");
            if let Some(attempt) = run.attempt_mut(*platform) {
                attempt.fail(PublishFailure::new(
                    FailureKind::PlatformRejected,
                    format!("{platform} does not accept {kind} posts"),
                ));
            }
        }
        supported
    }

    async fn preflight_driver(&self, platforms: &[PlatformId]) -> PipelineResult<()> {
        let browser_driven: Vec<_> = platforms
            .iter()
            .filter(|platform| {
                self.ctx.agents.strategy(**platform) == Some(AgentStrategy::BrowserDriven)
            })
            .collect();
        let Some(resolver) = &self.ctx.driver else {
            return Ok(());
        };
        if browser_driven.is_empty() {
            return Ok(());
        }
        match resolver.resolve(&self.ctx.environment).await {
            Ok(handle) => {
                debug!(path = %handle.binary_path.display(), "driver preflight passed");
                Ok(())
            }
            Err(err) if browser_driven.len() == platforms.len() => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "driver unavailable; browser-driven platforms will fail");
                Ok(())
            }
        }
    }

    async fn acquire(&self, source: &SourceSpec, run_id: &str) -> PublishResult<Acquired> {
        match source {
            SourceSpec::Local(path) => {
                let asset = MediaAsset::from_path(path).await.map_err(|err| {
                    PublishFailure::new(
                        FailureKind::PreparationFailed,
                        format!("cannot use {}: {err}", path.display()),
                    )
                })?;
                Ok(Acquired {
                    asset: self.describe(asset).await,
                    title: None,
                })
            }
            SourceSpec::Remote(url) => {
                let request = DownloadRequest {
                    url: url.clone(),
                    quality: self.ctx.config.pipeline.download_quality.clone(),
                    dest_dir: self.ctx.config.work_dir().join(run_id).join("source"),
                };
                let downloaded = self.ctx.downloader.download(&request).await.map_err(|err| {
                    PublishFailure::new(
                        FailureKind::PreparationFailed,
                        format!("download failed: {err}"),
                    )
                })?;
                info!(run_id, url = %url, title = ?downloaded.title, "source downloaded");
                Ok(Acquired {
                    asset: self.describe(downloaded.asset).await,
                    title: downloaded.title,
                })
            }
        }
    }

    /// Best effort: a source whose metadata cannot be read is still published.
    async fn describe(&self, asset: MediaAsset) -> MediaAsset {
        if asset.kind == MediaKind::Text
            || (asset.duration_seconds.is_some() && asset.dimensions.is_some())
        {
            return asset;
        }
        match self.ctx.transformer.describe(&asset).await {
            Ok(metadata) => asset.with_metadata(metadata),
            Err(err) => {
                warn!(path = %asset.local_path.display(), error = %err, "could not read media metadata");
                asset
            }
        }
    }

    async fn generate_all(
        &self,
        acquired: &Acquired,
        platforms: &[PlatformId],
    ) -> HashMap<PlatformId, ContentBundle> {
        let bundles = join_all(
            platforms
                .iter()
                .map(|platform| self.content_for(acquired, *platform)),
        )
        .await;
        platforms.iter().copied().zip(bundles).collect()
    }

    async fn content_for(&self, acquired: &Acquired, platform: PlatformId) -> ContentBundle {
        let request = ContentRequest {
            subject: ContentSubject::from_asset(&acquired.asset),
            platform,
            language: self.ctx.config.pipeline.language.clone(),
            title_hint: acquired.title.clone(),
        };
        if !self.ctx.config.pipeline.strategy.generates_content() {
            return TemplateContentGenerator.bundle(&request);
        }
        match self.ctx.generator.generate(&request).await {
            Ok(mut bundle) => {
                bundle.target_platform = platform;
                bundle
            }
            Err(err) => {
                warn!(%platform, error = %err, "content generation failed, using template");
                TemplateContentGenerator.bundle(&request)
            }
        }
    }

    async fn transform_all(
        &self,
        source: &MediaAsset,
        platforms: &[PlatformId],
        run_id: &str,
    ) -> HashMap<PlatformId, MediaAsset> {
        let assets = join_all(
            platforms
                .iter()
                .map(|platform| self.asset_for(source, *platform, run_id)),
        )
        .await;
        platforms.iter().copied().zip(assets).collect()
    }

    /// Each platform gets its own derived file; any failure rolls back to the source.
    async fn asset_for(&self, source: &MediaAsset, platform: PlatformId, run_id: &str) -> MediaAsset {
        let pipeline = &self.ctx.config.pipeline;
        if !pipeline.strategy.transforms_media() || source.kind != MediaKind::Video {
            return source.clone();
        }
        let dir = self.ctx.config.work_dir().join(run_id).join(platform.as_str());
        if let Err(err) = tokio::fs::create_dir_all(&dir).await {
            warn!(%platform, dir = %dir.display(), error = %err, "cannot create work dir, using original");
            return source.clone();
        }
        let stem = source
            .local_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("media");
        let anti_fingerprint = if self.ctx.agents.strategy(platform) == Some(AgentStrategy::NativeApi) {
            AntiFingerprint::None
        } else {
            pipeline.anti_fingerprint.parse().unwrap_or_else(|err: String| {
                warn!(%platform, error = %err, "ignoring anti-fingerprint level");
                AntiFingerprint::default()
            })
        };
        let op = TransformOp {
            enhancement: pipeline.enhancement.parse().unwrap_or_else(|err: String| {
                warn!(%platform, error = %err, "ignoring enhancement level");
                EnhancementLevel::default()
            }),
            anti_fingerprint,
            target: Some(PlatformFormat::for_platform(platform)),
            output_path: dir.join(format!("{stem}_{platform}.mp4")),
        };
        match self.ctx.transformer.transform(source, &op).await {
            Ok(derived) => {
                info!(%platform, path = %derived.local_path.display(), "media transformed");
                derived
            }
            Err(err) => {
                warn!(%platform, error = %err, "transformation failed, rolling back to original asset");
                source.clone()
            }
        }
    }
}

/// Runs one attempt to a terminal state: bounded retries for transient
/// failures, a per-pass timeout, and run-level cancellation.
async fn drive_attempt(
    ctx: &PipelineContext,
    job: AttemptJob,
    progress: &AttemptProgress,
    cancel: &CancellationToken,
) {
    let policy = RetryPolicy::new(&ctx.config.retry);
    let platform = job.platform;
    loop {
        if cancel.is_cancelled() {
            progress.update(|attempt| {
                attempt.fail(PublishFailure::new(FailureKind::Cancelled, "run cancelled"))
            });
            return;
        }
        let result = timed_pass(ctx, &job, progress, cancel).await;
        let retries = progress.update(|attempt| attempt.retry_count);
        match result {
            Ok(artifact) if artifact.reference.trim().is_empty() => {
                progress.update(|attempt| {
                    attempt.fail(PublishFailure::new(
                        FailureKind::Unconfirmed,
                        "agent reported success without an artifact reference",
                    ))
                });
                return;
            }
            Ok(artifact) => {
                info!(run_id = %job.run_id, %platform, artifact = %artifact.reference, "publish confirmed");
                progress.update(|attempt| attempt.succeed(artifact));
                return;
            }
            Err(failure)
                if failure.kind.is_retryable()
                    && retries < policy.max_retries()
                    && !cancel.is_cancelled() =>
            {
                let delay = policy.delay_for(retries + 1);
                warn!(
                    run_id = %job.run_id,
                    %platform,
                    retry = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "transient failure, retrying"
                );
                progress.update(|attempt| attempt.retry(failure));
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = sleep(delay) => {}
                }
            }
            Err(failure) => {
                warn!(run_id = %job.run_id, %platform, kind = %failure.kind, error = %failure.message, "publish failed");
                progress.update(|attempt| attempt.fail(failure));
                return;
            }
        }
    }
}

/// One authenticate-and-publish pass bounded by the attempt timeout. On
/// timeout or cancellation the agent gets the grace period to tear down.
async fn timed_pass(
    ctx: &PipelineContext,
    job: &AttemptJob,
    progress: &AttemptProgress,
    cancel: &CancellationToken,
) -> PublishResult<Artifact> {
    let pipeline = &ctx.config.pipeline;
    let pass_cancel = cancel.child_token();
    let deadline = Instant::now() + pipeline.attempt_timeout();
    let pass = publish_pass(ctx, job, progress, &pass_cancel);
    tokio::pin!(pass);

    let interrupted = tokio::select! {
        result = timeout_at(deadline, &mut pass) => match result {
            Ok(outcome) => return outcome,
            Err(_) => FailureKind::TimedOut,
        },
        _ = cancel.cancelled() => FailureKind::Cancelled,
    };

    pass_cancel.cancel();
    let diagnostic = match timeout(pipeline.cancel_grace(), &mut pass).await {
        Ok(Ok(artifact)) => return Ok(artifact),
        Ok(Err(failure)) => failure.diagnostic,
        Err(_) => {
            warn!(platform = %job.platform, "agent did not stop within the grace period");
            None
        }
    };
    let message = match interrupted {
        FailureKind::TimedOut => format!(
            "attempt exceeded {}s",
            pipeline.attempt_timeout_seconds
        ),
        _ => "run cancelled mid-attempt; partial upload discarded".to_string(),
    };
    let mut failure = PublishFailure::new(interrupted, message);
    failure.diagnostic = diagnostic;
    Err(failure)
}

async fn publish_pass(
    ctx: &PipelineContext,
    job: &AttemptJob,
    progress: &AttemptProgress,
    cancel: &CancellationToken,
) -> PublishResult<Artifact> {
    let platform = job.platform;
    progress.update(|attempt| attempt.advance(AttemptState::Authenticating));

    let record = ctx.sessions.load(platform).await;
    let record = if record.validity.needs_reauth() {
        info!(run_id = %job.run_id, %platform, validity = %record.validity, "session needs re-authentication");
        recover_session(ctx, job, &record, cancel).await?
    } else {
        record
    };
    let trusted = record.validity == ValidityState::Valid;

    let mut request = PublishRequest {
        run_id: job.run_id.clone(),
        platform,
        asset: job.asset.clone(),
        content: job.content.clone(),
        session: record,
        capture_dir: job.capture_dir.clone(),
        cancel: cancel.clone(),
    };
    match job.agent.publish(&request, progress).await {
        Err(failure) if failure.kind == FailureKind::AuthRequired && trusted => {
            info!(run_id = %job.run_id, %platform, "live session rejected, re-authenticating once");
            record_rejection(ctx, platform).await;
            let stale = ctx.sessions.load(platform).await;
            request.session = recover_session(ctx, job, &stale, cancel)
                .await
                .map_err(|reauth| keep_diagnostic(reauth, &failure))?;
            let retried = job.agent.publish(&request, progress).await;
            if matches!(&retried, Err(again) if again.kind == FailureKind::AuthRequired) {
                record_rejection(ctx, platform).await;
            }
            retried
        }
        other => other,
    }
}

async fn recover_session(
    ctx: &PipelineContext,
    job: &AttemptJob,
    record: &SessionRecord,
    cancel: &CancellationToken,
) -> PublishResult<SessionRecord> {
    let reauth = ReauthContext {
        run_id: job.run_id.clone(),
        interactive: ctx.config.automation.interactive_login && ctx.environment.display_available,
        capture_dir: job.capture_dir.clone(),
        cancel: cancel.clone(),
    };
    let state = match job.agent.reauthenticate(record, &reauth).await {
        Ok(state) => state,
        Err(failure) => {
            if failure.kind == FailureKind::AuthRequired && record.validity == ValidityState::Stale {
                record_rejection(ctx, job.platform).await;
            }
            return Err(failure);
        }
    };
    Ok(persist_session(ctx, job.platform, state).await)
}

async fn record_rejection(ctx: &PipelineContext, platform: PlatformId) {
    match ctx.sessions.mark_stale(platform).await {
        Ok(StaleOutcome::Removed) => {
            info!(%platform, "stored session deleted; next run starts from a fresh login")
        }
        Ok(_) => {}
        Err(err) => warn!(%platform, error = %err, "failed to mark session stale"),
    }
}

async fn persist_session(ctx: &PipelineContext, platform: PlatformId, state: AuthState) -> SessionRecord {
    match ctx.sessions.save(platform, state.clone()).await {
        Ok(record) => record,
        Err(err) => {
            warn!(%platform, error = %err, "session refreshed but could not be persisted");
            SessionRecord {
                platform,
                auth: Some(state),
                captured_at: Some(Utc::now()),
                validity: ValidityState::Valid,
            }
        }
    }
}

fn keep_diagnostic(mut failure: PublishFailure, original: &PublishFailure) -> PublishFailure {
    if failure.diagnostic.is_none() {
        failure.diagnostic = original.diagnostic.clone();
    }
    failure
}
