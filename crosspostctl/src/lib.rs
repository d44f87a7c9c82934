use std::fmt::Write as _;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use crosspost_core::agent::AgentTable;
use crosspost_core::browser::{BrowserError, BrowserLauncher, ChromiumLauncher};
use crosspost_core::collaborators::{
    ContentGenerator, FfmpegTransformer, HttpContentGenerator, TemplateContentGenerator,
    YtDlpDownloader,
};
use crosspost_core::diagnostics::{HealthReport, HealthReporter, HealthStatus};
use crosspost_core::pipeline::{OverallState, RunReport, SweepReport, WorkspaceJanitor};
use crosspost_core::session::{SessionError, SessionStatus, StoredCookie};
use crosspost_core::{
    load_config, AuthState, AutomationMode, CrosspostConfig, DriverResolver, EnvironmentError,
    EnvironmentProbe, EnvironmentProfile, PipelineContext, PipelineCoordinator, PipelineError,
    PlatformId, ProcessingStrategy, PublishTelemetry, SessionStore, SourceSpec,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_PARTIAL: i32 = 2;
pub const EXIT_FAILED: i32 = 3;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] crosspost_core::ConfigError),
    #[error("environment error: {0}")]
    Environment(#[from] EnvironmentError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("browser setup error: {0}")]
    Browser(#[from] BrowserError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Cross-platform media publishing pipeline", long_about = None)]
pub struct Cli {
    /// Path to crosspost.toml
    #[arg(long, default_value = "configs/crosspost.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Acquire, prepare and publish one piece of media
    Publish(PublishArgs),
    /// Check environment, driver, browser launch and sessions
    Health,
    /// Inspect or manage stored platform sessions
    #[command(subcommand)]
    Session(SessionCommands),
    /// Remove run downloads, derived media and captures past their age limit
    Cleanup(CleanupArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Local media path or remote URL
    #[arg(long)]
    pub source: String,
    /// Target platform; repeat for several (tiktok, facebook|fb, instagram|ig, youtube|yt)
    #[arg(long = "platform", required = true)]
    pub platforms: Vec<PlatformId>,
    /// Processing strategy: direct, ai, optimize or full
    #[arg(long)]
    pub strategy: Option<ProcessingStrategy>,
    /// Overrides pipeline.max_concurrency
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    /// Never open a visible browser for re-authentication
    #[arg(long, default_value_t = false)]
    pub no_interactive: bool,
}

#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Age limit in hours; defaults to pipeline.workspace_ttl_hours
    #[arg(long)]
    pub older_than: Option<u64>,
    /// Report what would be removed without deleting anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Show session validity per platform
    Status {
        platform: Option<PlatformId>,
    },
    /// Delete the stored session for a platform
    Clear { platform: PlatformId },
    /// Store cookies or an OAuth token from a JSON file
    Import { platform: PlatformId, file: PathBuf },
}

pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

/// Runs the selected command and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(*shell, &mut command, "crosspostctl", &mut io::stdout());
        return Ok(EXIT_OK);
    }

    let config = load_config(&cli.config)?;
    match &cli.command {
        Commands::Publish(args) => publish(config, args, cli.format).await,
        Commands::Health => health(config, cli.format).await,
        Commands::Session(command) => session(config, command, cli.format).await,
        Commands::Cleanup(args) => cleanup(&config, args, cli.format),
        Commands::Completions { .. } => Ok(EXIT_OK),
    }
}

struct Runtime {
    config: Arc<CrosspostConfig>,
    profile: EnvironmentProfile,
    probe: EnvironmentProbe,
    resolver: Arc<DriverResolver>,
    launcher: Arc<dyn BrowserLauncher>,
    sessions: Arc<SessionStore>,
}

impl Runtime {
    fn build(config: CrosspostConfig) -> Result<Self> {
        let probe = EnvironmentProbe::new();
        let profile = probe.profile()?;
        let mode = AutomationMode::resolve(&profile, &config.automation);
        info!(
            os = ?profile.os_kind,
            virtualized = profile.is_virtualized,
            headless = mode.headless,
            "environment detected"
        );
        let resolver = Arc::new(DriverResolver::new(&config, mode));
        let launcher: Arc<dyn BrowserLauncher> = Arc::new(ChromiumLauncher::new(
            &config,
            profile.clone(),
            mode,
            Arc::clone(&resolver),
        )?);
        let sessions = Arc::new(SessionStore::from_config(&config)?);
        Ok(Self {
            config: Arc::new(config),
            profile,
            probe,
            resolver,
            launcher,
            sessions,
        })
    }
}

async fn publish(mut config: CrosspostConfig, args: &PublishArgs, format: OutputFormat) -> Result<i32> {
    if let Some(strategy) = args.strategy {
        config.pipeline.strategy = strategy;
    }
    if let Some(limit) = args.max_concurrency {
        config.pipeline.max_concurrency = limit.max(1);
    }
    if args.no_interactive {
        config.automation.interactive_login = false;
    }
    let source = SourceSpec::parse(&args.source)?;
    if let Some(janitor) = WorkspaceJanitor::from_config(&config) {
        if let Err(err) = janitor.sweep() {
            warn!(error = %err, "workspace sweep failed");
        }
    }
    let runtime = Runtime::build(config)?;
    let config = Arc::clone(&runtime.config);

    let collaborators = &config.collaborators;
    let generator: Arc<dyn ContentGenerator> = match &collaborators.content_endpoint {
        Some(endpoint) => Arc::new(HttpContentGenerator::new(
            endpoint.clone(),
            Duration::from_secs(collaborators.content_timeout_seconds),
        )),
        None => Arc::new(TemplateContentGenerator),
    };
    let telemetry = match PublishTelemetry::from_config(&config) {
        Ok(telemetry) => Some(Arc::new(telemetry)),
        Err(err) => {
            warn!(error = %err, "telemetry disabled");
            None
        }
    };
    let context = PipelineContext {
        agents: AgentTable::standard(
            &config,
            Arc::clone(&runtime.launcher),
            Arc::clone(&runtime.sessions),
        ),
        config: Arc::clone(&config),
        environment: runtime.profile.clone(),
        sessions: Arc::clone(&runtime.sessions),
        downloader: Arc::new(YtDlpDownloader::new(&collaborators.ytdlp_binary)),
        generator,
        transformer: Arc::new(
            FfmpegTransformer::new(&collaborators.ffmpeg_binary, collaborators.min_free_disk_mb)
                .with_probe_binary(&collaborators.ffprobe_binary),
        ),
        telemetry,
        driver: Some(Arc::clone(&runtime.resolver)),
    };
    let coordinator = PipelineCoordinator::new(context);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            interrupt.cancel();
        }
    });

    let run = coordinator.run(&source, &args.platforms, cancel).await?;
    let report = run.report();
    render(&report, format)?;
    Ok(exit_code(report.overall_state))
}

pub fn exit_code(state: OverallState) -> i32 {
    match state {
        OverallState::Success => EXIT_OK,
        OverallState::PartialSuccess => EXIT_PARTIAL,
        OverallState::Failed => EXIT_FAILED,
        OverallState::Running => EXIT_FATAL,
    }
}

async fn health(config: CrosspostConfig, format: OutputFormat) -> Result<i32> {
    let runtime = Runtime::build(config)?;
    let reporter = HealthReporter::new(
        runtime.probe.clone(),
        Arc::clone(&runtime.resolver),
        Arc::clone(&runtime.sessions),
    )
    .with_launcher(Arc::clone(&runtime.launcher));
    let report = reporter.run().await;
    render(&report, format)?;
    Ok(match report.overall() {
        HealthStatus::Fail => EXIT_FAILED,
        _ => EXIT_OK,
    })
}

fn cleanup(config: &CrosspostConfig, args: &CleanupArgs, format: OutputFormat) -> Result<i32> {
    let report = sweep_workspace(config, args)?;
    render(&report, format)?;
    Ok(EXIT_OK)
}

pub fn sweep_workspace(config: &CrosspostConfig, args: &CleanupArgs) -> Result<SweepReport> {
    let ttl = match args.older_than {
        Some(hours) => Duration::from_secs(hours * 3600),
        None => config.pipeline.workspace_ttl().ok_or_else(|| {
            AppError::InvalidInput(
                "pipeline.workspace_ttl_hours is 0; pass --older-than to sweep anyway".into(),
            )
        })?,
    };
    let janitor = WorkspaceJanitor::new(vec![config.work_dir(), config.captures_dir()], ttl)
        .dry_run(args.dry_run);
    Ok(janitor.sweep()?)
}

async fn session(config: CrosspostConfig, command: &SessionCommands, format: OutputFormat) -> Result<i32> {
    let sessions = SessionStore::from_config(&config)?;
    match command {
        SessionCommands::Status { platform } => {
            let platforms = match platform {
                Some(platform) => vec![*platform],
                None => PlatformId::ALL.to_vec(),
            };
            let mut rows = Vec::new();
            for platform in platforms {
                rows.push(sessions.status(platform).await);
            }
            render(&SessionTable { rows }, format)?;
        }
        SessionCommands::Clear { platform } => {
            sessions.invalidate(*platform).await?;
            render(
                &Message {
                    message: format!("session for {platform} cleared"),
                },
                format,
            )?;
        }
        SessionCommands::Import { platform, file } => {
            let text = std::fs::read_to_string(file)?;
            let auth = parse_import(&text)?;
            let record = sessions.save(*platform, auth).await?;
            render(
                &Message {
                    message: format!("session for {platform} stored ({})", record.validity),
                },
                format,
            )?;
        }
    }
    Ok(EXIT_OK)
}

#[derive(Debug, Deserialize)]
struct TokenImport {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Accepts a stored session, a browser cookie export, or an OAuth token response.
pub fn parse_import(text: &str) -> Result<AuthState> {
    if let Ok(auth) = serde_json::from_str::<AuthState>(text) {
        return Ok(auth);
    }
    if let Ok(cookies) = serde_json::from_str::<Vec<StoredCookie>>(text) {
        if cookies.is_empty() {
            return Err(AppError::InvalidInput("cookie export is empty".into()));
        }
        return Ok(AuthState::Cookies { cookies });
    }
    let token: TokenImport = serde_json::from_str(text).map_err(|err| {
        AppError::InvalidInput(format!("expected cookies or an OAuth token: {err}"))
    })?;
    let expires_at = token.expires_at.or_else(|| {
        token
            .expires_in
            .map(|seconds| Utc::now() + chrono::Duration::seconds(seconds))
    });
    Ok(AuthState::Token {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at,
    })
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug, Serialize)]
struct Message {
    message: String,
}

impl DisplayFallback for Message {
    fn display(&self) -> String {
        self.message.clone()
    }
}

impl DisplayFallback for SweepReport {
    fn display(&self) -> String {
        let verb = if self.dry_run { "would remove" } else { "removed" };
        let mut out = format!(
            "{verb} {} entries ({:.2} MB), kept {}",
            self.removed.len(),
            self.freed_bytes as f64 / (1024.0 * 1024.0),
            self.kept
        );
        for path in &self.removed {
            let _ = write!(out, "\n  {}", path.display());
        }
        out
    }
}

#[derive(Debug, Serialize)]
struct SessionTable {
    rows: Vec<SessionStatus>,
}

impl DisplayFallback for SessionTable {
    fn display(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            let _ = write!(out, "{:<10} {:<8}", row.platform.as_str(), row.validity.to_string());
            if row.cookies_total > 0 {
                let _ = write!(out, " cookies={} expired={}", row.cookies_total, row.cookies_expired);
            }
            if let Some(expires) = row.token_expires_at {
                let _ = write!(out, " token_expires={}", expires.to_rfc3339());
            }
            if let Some(captured) = row.captured_at {
                let _ = write!(out, " captured={}", captured.to_rfc3339());
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

impl DisplayFallback for RunReport {
    fn display(&self) -> String {
        let mut lines = vec![format!("run {} -> {}", self.run_id, self.overall_state)];
        for attempt in &self.attempts {
            let mut line = format!(
                "  {:<10} {:<10} retries={}",
                attempt.platform.as_str(),
                attempt.state.as_str(),
                attempt.retry_count
            );
            if let Some(artifact) = &attempt.artifact {
                let _ = write!(line, " artifact={artifact}");
            }
            if let Some(kind) = attempt.failure_kind {
                let _ = write!(line, " kind={kind}");
            }
            if let Some(error) = &attempt.error {
                let _ = write!(line, " error=\"{error}\"");
            }
            if let Some(diagnostic) = &attempt.diagnostic {
                let _ = write!(line, " diagnostic={diagnostic}");
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

impl DisplayFallback for HealthReport {
    fn display(&self) -> String {
        let mut lines: Vec<String> = self
            .checks
            .iter()
            .map(|check| format!("[{}] {:<18} {}", check.status, check.name, check.detail))
            .collect();
        lines.push(format!("overall: {}", self.overall()));
        lines.join("\n")
    }
}
