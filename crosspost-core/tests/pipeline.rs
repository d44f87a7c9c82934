use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crosspost_core::agent::{
    AgentStrategy, AgentTable, Artifact, FailureKind, PublishAgent, PublishFailure, PublishPhase,
    PublishProgress, PublishRequest, PublishResult, ReauthContext,
};
use crosspost_core::browser::DiagnosticRef;
use crosspost_core::collaborators::{
    CollaboratorError, CollaboratorResult, ContentGenerator, ContentRequest, DownloadRequest,
    DownloadedMedia, MediaDownloader, MediaTransformer, TransformOp,
};
use crosspost_core::config::ProcessingStrategy;
use crosspost_core::environment::{CpuArch, OsKind};
use crosspost_core::pipeline::{
    AttemptState, OverallState, PipelineContext, PipelineCoordinator, PipelineError, SourceSpec,
};
use crosspost_core::session::{
    AuthState, FileBackend, MemoryBackend, SessionBackend, SessionRecord, SessionStore,
    StoredCookie, ValidityState,
};
use crosspost_core::{
    AutomationMode, ContentBundle, CrosspostConfig, DriverResolver, EnvironmentProfile,
    MediaAsset, MediaKind, MediaMetadata, PlatformId, PublishTelemetry,
};
use crosspost_core::media::Dimensions;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Step {
    Succeed(&'static str),
    Fail(FailureKind),
    FailWithCapture(FailureKind),
    Hang,
}

/// Scripted agent: pops one step per publish call, repeating the last.
struct ScriptedAgent {
    platform: PlatformId,
    strategy: AgentStrategy,
    steps: Mutex<VecDeque<Step>>,
    kinds: Vec<MediaKind>,
    login_works: bool,
    publishes: AtomicUsize,
    reauths: AtomicUsize,
    teardowns: AtomicUsize,
    seen_sessions: Mutex<Vec<ValidityState>>,
    seen_requests: Mutex<Vec<(PathBuf, ContentBundle)>>,
    seen_assets: Mutex<Vec<MediaAsset>>,
}

impl ScriptedAgent {
    fn new(platform: PlatformId, steps: &[Step]) -> Arc<Self> {
        Self::build(platform, steps, vec![MediaKind::Video], true)
    }

    fn accepting(platform: PlatformId, steps: &[Step], kinds: &[MediaKind]) -> Arc<Self> {
        Self::build(platform, steps, kinds.to_vec(), true)
    }

    /// Every re-authentication attempt is refused.
    fn without_login(platform: PlatformId, steps: &[Step]) -> Arc<Self> {
        Self::build(platform, steps, vec![MediaKind::Video], false)
    }

    fn build(platform: PlatformId, steps: &[Step], kinds: Vec<MediaKind>, login_works: bool) -> Arc<Self> {
        let strategy = if platform == PlatformId::YouTube {
            AgentStrategy::NativeApi
        } else {
            AgentStrategy::BrowserDriven
        };
        Arc::new(Self {
            platform,
            strategy,
            steps: Mutex::new(steps.iter().cloned().collect()),
            kinds,
            login_works,
            publishes: AtomicUsize::new(0),
            reauths: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
            seen_sessions: Mutex::new(Vec::new()),
            seen_requests: Mutex::new(Vec::new()),
            seen_assets: Mutex::new(Vec::new()),
        })
    }

    fn next_step(&self) -> Step {
        let mut steps = self.steps.lock().unwrap();
        if steps.len() > 1 {
            steps.pop_front().unwrap()
        } else {
            steps.front().cloned().unwrap_or(Step::Succeed("default"))
        }
    }

    fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    fn reauths(&self) -> usize {
        self.reauths.load(Ordering::SeqCst)
    }

    fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublishAgent for ScriptedAgent {
    fn platform(&self) -> PlatformId {
        self.platform
    }

    fn strategy(&self) -> AgentStrategy {
        self.strategy
    }

    fn supports(&self, kind: MediaKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        progress: &dyn PublishProgress,
    ) -> PublishResult<Artifact> {
        self.publishes.fetch_add(1, Ordering::SeqCst);
        self.seen_sessions
            .lock()
            .unwrap()
            .push(request.session.validity);
        self.seen_requests
            .lock()
            .unwrap()
            .push((request.asset.local_path.clone(), request.content.clone()));
        self.seen_assets.lock().unwrap().push(request.asset.clone());
        progress.advance(PublishPhase::Uploading);
        match self.next_step() {
            Step::Succeed(reference) => {
                progress.advance(PublishPhase::Confirming);
                Ok(Artifact {
                    reference: reference.to_string(),
                    url: None,
                })
            }
            Step::Fail(kind) => Err(PublishFailure::new(kind, format!("{kind} from script"))),
            Step::FailWithCapture(kind) => {
                let dir = request.capture_dir.clone();
                Err(PublishFailure::new(kind, "selector vanished").with_diagnostic(DiagnosticRef {
                    screenshot: Some(dir.join("locate_upload_surface.png")),
                    page_source: Some(dir.join("locate_upload_surface.html")),
                    directory: dir,
                    url: Some("https://example.test/upload".into()),
                    stage: "locate_upload_surface".into(),
                }))
            }
            Step::Hang => {
                request.cancel.cancelled().await;
                self.teardowns.fetch_add(1, Ordering::SeqCst);
                Err(PublishFailure::new(FailureKind::Cancelled, "stopped"))
            }
        }
    }

    async fn reauthenticate(
        &self,
        _record: &SessionRecord,
        _ctx: &ReauthContext,
    ) -> PublishResult<AuthState> {
        self.reauths.fetch_add(1, Ordering::SeqCst);
        if !self.login_works {
            return Err(PublishFailure::new(
                FailureKind::AuthRequired,
                "interactive login unavailable",
            ));
        }
        Ok(cookies("fresh"))
    }
}

struct FailingDownloader;

#[async_trait]
impl MediaDownloader for FailingDownloader {
    async fn download(&self, request: &DownloadRequest) -> CollaboratorResult<DownloadedMedia> {
        Err(CollaboratorError::Unavailable(request.url.clone()))
    }
}

struct FailingGenerator;

#[async_trait]
impl ContentGenerator for FailingGenerator {
    async fn generate(&self, _request: &ContentRequest) -> CollaboratorResult<ContentBundle> {
        Err(CollaboratorError::QuotaExceeded("generator quota".into()))
    }
}

/// Copies the source to the requested output, or fails for one platform.
struct CopyingTransformer {
    fail_for: Option<&'static str>,
}

#[async_trait]
impl MediaTransformer for CopyingTransformer {
    async fn transform(&self, asset: &MediaAsset, op: &TransformOp) -> CollaboratorResult<MediaAsset> {
        let name = op.output_path.to_string_lossy().to_string();
        if self.fail_for.map(|p| name.contains(p)).unwrap_or(false) {
            return Err(CollaboratorError::UnsupportedCodec("prores".into()));
        }
        tokio::fs::copy(&asset.local_path, &op.output_path).await?;
        let mut derived = MediaAsset::from_path(&op.output_path).await?;
        derived.derived_from = Some(asset.local_path.clone());
        Ok(derived)
    }
}

/// Reports fixed container metadata and never transforms.
struct DescribingTransformer;

#[async_trait]
impl MediaTransformer for DescribingTransformer {
    async fn transform(&self, _asset: &MediaAsset, _op: &TransformOp) -> CollaboratorResult<MediaAsset> {
        Err(CollaboratorError::ToolUnavailable("ffmpeg".into()))
    }

    async fn describe(&self, _asset: &MediaAsset) -> CollaboratorResult<MediaMetadata> {
        Ok(MediaMetadata {
            duration_seconds: Some(42.5),
            dimensions: Some(Dimensions {
                width: 1080,
                height: 1920,
            }),
        })
    }
}

fn cookies(value: &str) -> AuthState {
    AuthState::Cookies {
        cookies: vec![StoredCookie {
            name: "sessionid".into(),
            value: value.into(),
            domain: ".example.test".into(),
            path: "/".into(),
            expires: None,
            secure: true,
            http_only: true,
        }],
    }
}

fn token() -> AuthState {
    AuthState::Token {
        access_token: "token".into(),
        refresh_token: Some("refresh".into()),
        expires_at: None,
    }
}

fn profile() -> EnvironmentProfile {
    EnvironmentProfile {
        os_kind: OsKind::Linux,
        cpu_arch: CpuArch::X86_64,
        is_virtualized: true,
        is_headless: true,
        display_available: false,
        signals: Vec::new(),
    }
}

struct Harness {
    dir: TempDir,
    config: CrosspostConfig,
    sessions: Arc<SessionStore>,
    agents: AgentTable,
    generator: Arc<dyn ContentGenerator>,
    transformer: Arc<dyn MediaTransformer>,
    telemetry: Option<Arc<PublishTelemetry>>,
    driver: Option<Arc<DriverResolver>>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = CrosspostConfig::default();
        config.paths.base_dir = dir.path().to_string_lossy().to_string();
        config.pipeline.strategy = ProcessingStrategy::Direct;
        config.retry.backoff_seconds = vec![0];
        config.retry.jitter_ms = 0;
        Self {
            dir,
            config,
            sessions: Arc::new(SessionStore::new(Arc::new(MemoryBackend::new()))),
            agents: AgentTable::new(),
            generator: Arc::new(FailingGenerator),
            transformer: Arc::new(CopyingTransformer { fail_for: None }),
            telemetry: None,
            driver: None,
        }
    }

    fn agent(mut self, agent: Arc<ScriptedAgent>) -> Self {
        self.agents.insert(agent);
        self
    }

    fn media(&self) -> PathBuf {
        let path = self.dir.path().join("harbor_sunset.mp4");
        std::fs::write(&path, b"not really a video but enough bytes").unwrap();
        path
    }

    async fn seed(&self, platform: PlatformId, auth: AuthState) {
        self.sessions.save(platform, auth).await.unwrap();
    }

    fn coordinator(&self) -> PipelineCoordinator {
        PipelineCoordinator::new(PipelineContext {
            config: Arc::new(self.config.clone()),
            environment: profile(),
            sessions: Arc::clone(&self.sessions),
            agents: self.agents.clone(),
            downloader: Arc::new(FailingDownloader),
            generator: Arc::clone(&self.generator),
            transformer: Arc::clone(&self.transformer),
            telemetry: self.telemetry.clone(),
            driver: self.driver.clone(),
        })
    }
}

#[tokio::test]
async fn partial_success_keeps_diagnostic_and_artifact() {
    let tiktok = ScriptedAgent::new(
        PlatformId::TikTok,
        &[Step::FailWithCapture(FailureKind::AutomationSurfaceChanged)],
    );
    let youtube = ScriptedAgent::new(PlatformId::YouTube, &[Step::Succeed("youtube:abc123")]);
    let mut harness = Harness::new()
        .agent(Arc::clone(&tiktok))
        .agent(Arc::clone(&youtube));
    let logs = harness.dir.path().join("logs");
    harness.telemetry = Some(Arc::new(
        PublishTelemetry::new(logs.join("attempts.jsonl"), logs.join("telemetry.sqlite")).unwrap(),
    ));
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    harness.seed(PlatformId::YouTube, token()).await;
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::TikTok, PlatformId::YouTube],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.overall_state(), OverallState::PartialSuccess);
    let failed = run.attempt(PlatformId::TikTok).unwrap();
    assert_eq!(failed.state, AttemptState::Failed);
    assert_eq!(failed.failure_kind(), Some(FailureKind::AutomationSurfaceChanged));
    let diagnostic = failed.diagnostic.as_ref().expect("diagnostic reference");
    assert!(diagnostic
        .directory
        .ends_with(Path::new(&run.run_id).join("tiktok")));

    let succeeded = run.attempt(PlatformId::YouTube).unwrap();
    assert_eq!(succeeded.state, AttemptState::Succeeded);
    assert_eq!(succeeded.artifact.as_ref().unwrap().reference, "youtube:abc123");
    let states: Vec<_> = succeeded.history.iter().map(|c| c.state).collect();
    assert_eq!(
        states,
        vec![
            AttemptState::Pending,
            AttemptState::Authenticating,
            AttemptState::Uploading,
            AttemptState::Confirming,
            AttemptState::Succeeded,
        ]
    );

    let failures = harness
        .telemetry
        .as_ref()
        .unwrap()
        .recent_failures(5)
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, "automation_surface_changed");
    assert!(failures[0].diagnostic.is_some());
}

#[tokio::test]
async fn corrupt_session_enters_reauthentication() {
    let instagram = ScriptedAgent::new(PlatformId::Instagram, &[Step::Succeed("ig:reel")]);
    let mut harness = Harness::new().agent(Arc::clone(&instagram));
    let sessions_dir = harness.dir.path().join("sessions");
    let backend = FileBackend::new(&sessions_dir);
    std::fs::create_dir_all(&sessions_dir).unwrap();
    std::fs::write(backend.path_for(PlatformId::Instagram), b"{ not json").unwrap();
    harness.sessions = Arc::new(SessionStore::new(Arc::new(backend.clone())));
    assert_eq!(
        harness.sessions.load(PlatformId::Instagram).await.validity,
        ValidityState::Corrupt
    );
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::Instagram],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.overall_state(), OverallState::Success);
    assert_eq!(instagram.reauths(), 1);
    assert_eq!(
        *instagram.seen_sessions.lock().unwrap(),
        vec![ValidityState::Valid]
    );
    let stored = harness.sessions.load(PlatformId::Instagram).await;
    assert_eq!(stored.validity, ValidityState::Valid);
    assert_eq!(stored.cookies()[0].value, "fresh");
    assert!(backend.read(PlatformId::Instagram).await.unwrap().is_some());
}

#[tokio::test]
async fn live_rejection_marks_stale_and_reauths_once() {
    let facebook = ScriptedAgent::new(
        PlatformId::Facebook,
        &[Step::Fail(FailureKind::AuthRequired), Step::Succeed("fb:post")],
    );
    let harness = Harness::new().agent(Arc::clone(&facebook));
    harness.seed(PlatformId::Facebook, cookies("expired-server-side")).await;
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::Facebook],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.overall_state(), OverallState::Success);
    assert_eq!(facebook.publishes(), 2);
    assert_eq!(facebook.reauths(), 1);
    let stored = harness.sessions.load(PlatformId::Facebook).await;
    assert_eq!(stored.cookies()[0].value, "fresh");
}

#[tokio::test]
async fn transient_failures_stop_at_the_retry_bound() {
    let youtube = ScriptedAgent::new(
        PlatformId::YouTube,
        &[Step::Fail(FailureKind::TransientNetwork)],
    );
    let quota = ScriptedAgent::new(PlatformId::TikTok, &[Step::Fail(FailureKind::QuotaExceeded)]);
    let mut harness = Harness::new()
        .agent(Arc::clone(&youtube))
        .agent(Arc::clone(&quota));
    harness.config.retry.max_retries = 2;
    harness.seed(PlatformId::YouTube, token()).await;
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::YouTube, PlatformId::TikTok],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let attempt = run.attempt(PlatformId::YouTube).unwrap();
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(attempt.retry_count, 2);
    assert_eq!(youtube.publishes(), 3);
    assert_eq!(attempt.failure_kind(), Some(FailureKind::TransientNetwork));

    assert_eq!(quota.publishes(), 1);
    assert_eq!(run.attempt(PlatformId::TikTok).unwrap().retry_count, 0);
    assert_eq!(run.overall_state(), OverallState::Failed);
}

#[tokio::test]
async fn concurrent_and_sequential_runs_agree() {
    async fn outcomes(max_concurrency: usize) -> BTreeMap<PlatformId, (AttemptState, Option<FailureKind>, u32)> {
        let mut harness = Harness::new()
            .agent(ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt:1")]))
            .agent(ScriptedAgent::new(
                PlatformId::Facebook,
                &[Step::Fail(FailureKind::TransientNetwork), Step::Succeed("fb:1")],
            ))
            .agent(ScriptedAgent::new(
                PlatformId::Instagram,
                &[Step::Fail(FailureKind::PlatformRejected)],
            ))
            .agent(ScriptedAgent::new(PlatformId::YouTube, &[Step::Succeed("")]));
        harness.config.pipeline.max_concurrency = max_concurrency;
        for platform in PlatformId::ALL {
            harness.seed(platform, cookies("live")).await;
        }
        let media = harness.media();
        let run = harness
            .coordinator()
            .run(&SourceSpec::Local(media), &PlatformId::ALL, CancellationToken::new())
            .await
            .unwrap();
        run.attempts
            .iter()
            .map(|(platform, attempt)| {
                (
                    *platform,
                    (attempt.state, attempt.failure_kind(), attempt.retry_count),
                )
            })
            .collect()
    }

    let sequential = outcomes(1).await;
    let concurrent = outcomes(4).await;
    assert_eq!(sequential, concurrent);
    assert_eq!(
        sequential[&PlatformId::YouTube],
        (AttemptState::Failed, Some(FailureKind::Unconfirmed), 0)
    );
    assert_eq!(
        sequential[&PlatformId::Facebook],
        (AttemptState::Succeeded, None, 1)
    );
}

#[tokio::test]
async fn acquisition_failure_fails_every_attempt() {
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt")]);
    let harness = Harness::new().agent(Arc::clone(&tiktok));

    let local = harness
        .coordinator()
        .run(
            &SourceSpec::Local(harness.dir.path().join("missing.mp4")),
            &[PlatformId::TikTok],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(local.overall_state(), OverallState::Failed);
    assert_eq!(
        local.attempt(PlatformId::TikTok).unwrap().failure_kind(),
        Some(FailureKind::PreparationFailed)
    );

    let remote = harness
        .coordinator()
        .run(
            &SourceSpec::parse("https://video.example.test/watch?v=1").unwrap(),
            &[PlatformId::TikTok],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        remote.attempt(PlatformId::TikTok).unwrap().failure_kind(),
        Some(FailureKind::PreparationFailed)
    );
    assert_eq!(tiktok.publishes(), 0);
}

#[tokio::test]
async fn generation_and_transform_failures_fall_back() {
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt")]);
    let youtube = ScriptedAgent::new(PlatformId::YouTube, &[Step::Succeed("yt")]);
    let mut harness = Harness::new()
        .agent(Arc::clone(&tiktok))
        .agent(Arc::clone(&youtube));
    harness.config.pipeline.strategy = ProcessingStrategy::Full;
    harness.transformer = Arc::new(CopyingTransformer {
        fail_for: Some("youtube"),
    });
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    harness.seed(PlatformId::YouTube, token()).await;
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media.clone()),
            &[PlatformId::TikTok, PlatformId::YouTube],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.overall_state(), OverallState::Success);

    let (tiktok_path, tiktok_content) = tiktok.seen_requests.lock().unwrap()[0].clone();
    assert!(tiktok_path.starts_with(harness.dir.path().join("work").join(&run.run_id).join("tiktok")));
    assert!(tiktok_content.hashtags.contains(&"#tiktok".to_string()));
    assert_eq!(tiktok_content.title, "harbor sunset");

    let (youtube_path, youtube_content) = youtube.seen_requests.lock().unwrap()[0].clone();
    assert_eq!(youtube_path, media);
    assert_eq!(youtube_content.target_platform, PlatformId::YouTube);
    assert!(media.exists());
}

#[tokio::test(start_paused = true)]
async fn hung_attempt_times_out_without_blocking_siblings() {
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Hang]);
    let youtube = ScriptedAgent::new(PlatformId::YouTube, &[Step::Succeed("yt")]);
    let mut harness = Harness::new()
        .agent(Arc::clone(&tiktok))
        .agent(Arc::clone(&youtube));
    harness.config.pipeline.attempt_timeout_seconds = 30;
    harness.config.pipeline.cancel_grace_seconds = 1;
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    harness.seed(PlatformId::YouTube, token()).await;
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::TikTok, PlatformId::YouTube],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        run.attempt(PlatformId::TikTok).unwrap().failure_kind(),
        Some(FailureKind::TimedOut)
    );
    assert_eq!(tiktok.publishes(), 1);
    assert_eq!(run.overall_state(), OverallState::PartialSuccess);
}

#[tokio::test]
async fn cancelled_run_never_publishes() {
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt")]);
    let harness = Harness::new().agent(Arc::clone(&tiktok));
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    let media = harness.media();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let run = harness
        .coordinator()
        .run(&SourceSpec::Local(media), &[PlatformId::TikTok], cancel)
        .await
        .unwrap();
    assert_eq!(
        run.attempt(PlatformId::TikTok).unwrap().failure_kind(),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(tiktok.publishes(), 0);
}

#[tokio::test]
async fn driver_failure_is_fatal_only_for_all_browser_runs() {
    let mut harness = Harness::new()
        .agent(ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt")]))
        .agent(ScriptedAgent::new(PlatformId::YouTube, &[Step::Succeed("yt")]));
    let mut config = harness.config.clone();
    config.driver.candidates.clear();
    config.driver.browser_candidates.clear();
    config.driver.auto_provision = false;
    let mode = AutomationMode {
        headless: true,
        single_process: true,
        no_sandbox: true,
        disable_gpu: true,
    };
    harness.driver = Some(Arc::new(DriverResolver::new(&config, mode)));
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    harness.seed(PlatformId::YouTube, token()).await;
    let media = harness.media();
    let coordinator = harness.coordinator();

    let fatal = coordinator
        .run(
            &SourceSpec::Local(media.clone()),
            &[PlatformId::TikTok],
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(fatal, Err(PipelineError::Driver(_))));

    let mixed = coordinator
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::TikTok, PlatformId::YouTube],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(mixed.attempts.len(), 2);
}

#[tokio::test]
async fn unknown_targets_are_rejected_up_front() {
    let harness = Harness::new();
    let media = harness.media();
    let err = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media.clone()),
            &[PlatformId::TikTok],
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::MissingAgent(PlatformId::TikTok)));

    let err = harness
        .coordinator()
        .run(&SourceSpec::Local(media), &[], CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NoTargets));
}

#[tokio::test]
async fn sessions_never_leak_across_platforms() {
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt")]);
    let instagram = ScriptedAgent::new(PlatformId::Instagram, &[Step::Succeed("ig")]);
    let harness = Harness::new()
        .agent(Arc::clone(&tiktok))
        .agent(Arc::clone(&instagram));
    harness.seed(PlatformId::TikTok, cookies("tiktok-only")).await;
    let media = harness.media();

    harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::TikTok, PlatformId::Instagram],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(tiktok.reauths(), 0);
    assert_eq!(instagram.reauths(), 1);
    let instagram_session = harness.sessions.load(PlatformId::Instagram).await;
    assert_eq!(instagram_session.cookies()[0].value, "fresh");
    let tiktok_session = harness.sessions.load(PlatformId::TikTok).await;
    assert_eq!(tiktok_session.cookies()[0].value, "tiktok-only");
}

#[tokio::test]
async fn cancelling_mid_upload_fails_the_attempt_and_tears_down() {
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Hang]);
    let mut harness = Harness::new().agent(Arc::clone(&tiktok));
    harness.config.pipeline.attempt_timeout_seconds = 600;
    harness.config.pipeline.cancel_grace_seconds = 5;
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    let media = harness.media();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watched = Arc::clone(&tiktok);
    tokio::spawn(async move {
        while watched.publishes() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        trigger.cancel();
    });

    let run = harness
        .coordinator()
        .run(&SourceSpec::Local(media), &[PlatformId::TikTok], cancel)
        .await
        .unwrap();

    let attempt = run.attempt(PlatformId::TikTok).unwrap();
    assert_eq!(attempt.state, AttemptState::Failed);
    assert_eq!(attempt.failure_kind(), Some(FailureKind::Cancelled));
    assert!(attempt.history.iter().any(|c| c.state == AttemptState::Uploading));
    assert!(attempt.artifact.is_none());
    assert_eq!(tiktok.publishes(), 1);
    assert_eq!(tiktok.teardowns(), 1);
    assert_eq!(run.overall_state(), OverallState::Failed);
}

#[tokio::test]
async fn text_posts_only_reach_status_capable_platforms() {
    let facebook = ScriptedAgent::accepting(
        PlatformId::Facebook,
        &[Step::Succeed("fb:status")],
        &[MediaKind::Video, MediaKind::Image, MediaKind::Text],
    );
    let tiktok = ScriptedAgent::new(PlatformId::TikTok, &[Step::Succeed("tt")]);
    let harness = Harness::new()
        .agent(Arc::clone(&facebook))
        .agent(Arc::clone(&tiktok));
    harness.seed(PlatformId::Facebook, cookies("live")).await;
    harness.seed(PlatformId::TikTok, cookies("live")).await;
    let status = harness.dir.path().join("announcement.txt");
    std::fs::write(&status, "Harbor festival moves to Saturday.").unwrap();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(status.clone()),
            &[PlatformId::Facebook, PlatformId::TikTok],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.overall_state(), OverallState::PartialSuccess);
    let rejected = run.attempt(PlatformId::TikTok).unwrap();
    assert_eq!(rejected.failure_kind(), Some(FailureKind::PlatformRejected));
    assert_eq!(tiktok.publishes(), 0);

    assert_eq!(
        run.attempt(PlatformId::Facebook).unwrap().state,
        AttemptState::Succeeded
    );
    let seen = facebook.seen_requests.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, status);
}

#[tokio::test]
async fn sessions_rejected_run_after_run_are_deleted() {
    let facebook = ScriptedAgent::without_login(
        PlatformId::Facebook,
        &[Step::Fail(FailureKind::AuthRequired)],
    );
    let mut harness = Harness::new().agent(Arc::clone(&facebook));
    harness.sessions = Arc::new(
        SessionStore::new(Arc::new(MemoryBackend::new())).with_max_rejections(3),
    );
    harness.seed(PlatformId::Facebook, cookies("revoked")).await;
    let media = harness.media();
    let coordinator = harness.coordinator();

    let first = coordinator
        .run(
            &SourceSpec::Local(media.clone()),
            &[PlatformId::Facebook],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        first.attempt(PlatformId::Facebook).unwrap().failure_kind(),
        Some(FailureKind::AuthRequired)
    );
    assert_eq!(
        harness.sessions.load(PlatformId::Facebook).await.validity,
        ValidityState::Stale
    );

    coordinator
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::Facebook],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        harness.sessions.load(PlatformId::Facebook).await.validity,
        ValidityState::Absent
    );
    assert_eq!(facebook.publishes(), 1);
    assert_eq!(facebook.reauths(), 2);
}

#[tokio::test]
async fn local_sources_carry_container_metadata() {
    let youtube = ScriptedAgent::new(PlatformId::YouTube, &[Step::Succeed("yt")]);
    let mut harness = Harness::new().agent(Arc::clone(&youtube));
    harness.transformer = Arc::new(DescribingTransformer);
    harness.seed(PlatformId::YouTube, token()).await;
    let media = harness.media();

    let run = harness
        .coordinator()
        .run(
            &SourceSpec::Local(media),
            &[PlatformId::YouTube],
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.overall_state(), OverallState::Success);
    let asset = youtube.seen_assets.lock().unwrap()[0].clone();
    assert_eq!(asset.duration_seconds, Some(42.5));
    assert_eq!(
        asset.dimensions,
        Some(Dimensions {
            width: 1080,
            height: 1920
        })
    );
}
