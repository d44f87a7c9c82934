//! Platform upload agents. Every platform publishes through the same
//! `PublishAgent` contract; the capability table decides whether a platform is
//! driven through a browser script or a native HTTP API.

mod browser;
mod native;
mod platforms;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserError, BrowserLauncher, DiagnosticRef};
use crate::config::CrosspostConfig;
use crate::media::{ContentBundle, MediaAsset, MediaKind};
use crate::platform::PlatformId;
use crate::session::{AuthState, SessionRecord, SessionStore};

pub use browser::BrowserAgent;
pub use native::YouTubeAgent;
pub use platforms::{AgentStrategy, BrowserScript, CapabilityTable, PlatformProfile};

pub type PublishResult<T> = Result<T, PublishFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AuthRequired,
    TransientNetwork,
    PlatformRejected,
    AutomationSurfaceChanged,
    QuotaExceeded,
    Unconfirmed,
    TimedOut,
    Cancelled,
    DriverUnavailable,
    PreparationFailed,
}

impl FailureKind {
    /// Only transient network trouble is worth another full attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TransientNetwork)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::AuthRequired => "auth_required",
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::PlatformRejected => "platform_rejected",
            FailureKind::AutomationSurfaceChanged => "automation_surface_changed",
            FailureKind::QuotaExceeded => "quota_exceeded",
            FailureKind::Unconfirmed => "unconfirmed",
            FailureKind::TimedOut => "timed_out",
            FailureKind::Cancelled => "cancelled",
            FailureKind::DriverUnavailable => "driver_unavailable",
            FailureKind::PreparationFailed => "preparation_failed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, Serialize)]
#[error("{kind}: {message}")]
pub struct PublishFailure {
    pub kind: FailureKind,
    pub message: String,
    pub diagnostic: Option<DiagnosticRef>,
}

impl PublishFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            diagnostic: None,
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: DiagnosticRef) -> Self {
        self.diagnostic = Some(diagnostic);
        self
    }
}

impl From<BrowserError> for PublishFailure {
    fn from(err: BrowserError) -> Self {
        let kind = match &err {
            BrowserError::ElementNotFound(_) => FailureKind::AutomationSurfaceChanged,
            BrowserError::Launch(_) | BrowserError::Driver(_) | BrowserError::Profile(_) => {
                FailureKind::DriverUnavailable
            }
            BrowserError::Timeout(_) | BrowserError::Cdp(_) => FailureKind::TransientNetwork,
            BrowserError::Io(_) | BrowserError::Configuration(_) => FailureKind::PreparationFailed,
            BrowserError::Unexpected(_) => FailureKind::AutomationSurfaceChanged,
        };
        PublishFailure::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub run_id: String,
    pub platform: PlatformId,
    pub asset: MediaAsset,
    pub content: ContentBundle,
    pub session: SessionRecord,
    /// `captures_dir/<run_id>/<platform>`.
    pub capture_dir: PathBuf,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Never empty: a post id, or the URL the platform confirmed on.
    pub reference: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    Uploading,
    Confirming,
}

/// Lets the coordinator follow an agent through its forward-only phases.
pub trait PublishProgress: Send + Sync {
    fn advance(&self, phase: PublishPhase);
}

/// Discards phase notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl PublishProgress for NoProgress {
    fn advance(&self, _phase: PublishPhase) {}
}

#[derive(Debug, Clone)]
pub struct ReauthContext {
    pub run_id: String,
    /// A display is available and interactive login is enabled.
    pub interactive: bool,
    pub capture_dir: PathBuf,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait PublishAgent: Send + Sync {
    fn platform(&self) -> PlatformId;

    fn strategy(&self) -> AgentStrategy;

    /// Asset kinds this agent can post.
    fn supports(&self, kind: MediaKind) -> bool {
        kind == MediaKind::Video
    }

    async fn publish(
        &self,
        request: &PublishRequest,
        progress: &dyn PublishProgress,
    ) -> PublishResult<Artifact>;

    /// Recovery path for stale, corrupt or absent sessions. The caller persists
    /// the returned state.
    async fn reauthenticate(
        &self,
        record: &SessionRecord,
        ctx: &ReauthContext,
    ) -> PublishResult<AuthState>;
}

/// Agents keyed by platform.
#[derive(Clone, Default)]
pub struct AgentTable {
    agents: HashMap<PlatformId, Arc<dyn PublishAgent>>,
}

impl fmt::Debug for AgentTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut platforms: Vec<_> = self.agents.keys().map(PlatformId::as_str).collect();
        platforms.sort_unstable();
        f.debug_struct("AgentTable").field("platforms", &platforms).finish()
    }
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the stock agent for every platform in the capability table.
    pub fn standard(
        config: &CrosspostConfig,
        launcher: Arc<dyn BrowserLauncher>,
        store: Arc<SessionStore>,
    ) -> Self {
        let capabilities = CapabilityTable::from_config(config);
        let mut table = Self::new();
        for profile in capabilities.profiles() {
            match &profile.script {
                Some(script) => table.insert(Arc::new(
                    BrowserAgent::new(
                        profile.platform,
                        script.clone(),
                        Arc::clone(&launcher),
                        &config.automation,
                    )
                    .with_media_kinds(profile.media_kinds.clone()),
                )),
                None => table.insert(Arc::new(YouTubeAgent::new(
                    &config.youtube,
                    Arc::clone(&store),
                ))),
            }
        }
        table
    }

    pub fn insert(&mut self, agent: Arc<dyn PublishAgent>) {
        self.agents.insert(agent.platform(), agent);
    }

    pub fn with(mut self, agent: Arc<dyn PublishAgent>) -> Self {
        self.insert(agent);
        self
    }

    pub fn get(&self, platform: PlatformId) -> Option<Arc<dyn PublishAgent>> {
        self.agents.get(&platform).cloned()
    }

    pub fn strategy(&self, platform: PlatformId) -> Option<AgentStrategy> {
        self.agents.get(&platform).map(|agent| agent.strategy())
    }

    pub fn supports(&self, platform: PlatformId, kind: MediaKind) -> bool {
        self.agents
            .get(&platform)
            .is_some_and(|agent| agent.supports(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_network_is_retryable() {
        let retryable: Vec<_> = [
            FailureKind::AuthRequired,
            FailureKind::TransientNetwork,
            FailureKind::PlatformRejected,
            FailureKind::AutomationSurfaceChanged,
            FailureKind::QuotaExceeded,
            FailureKind::Unconfirmed,
            FailureKind::TimedOut,
            FailureKind::Cancelled,
        ]
        .into_iter()
        .filter(FailureKind::is_retryable)
        .collect();
        assert_eq!(retryable, vec![FailureKind::TransientNetwork]);
    }

    #[test]
    fn browser_errors_map_to_failure_kinds() {
        let missing: PublishFailure = BrowserError::ElementNotFound("input[type='file']".into()).into();
        assert_eq!(missing.kind, FailureKind::AutomationSurfaceChanged);
        let launch: PublishFailure = BrowserError::Launch("exec format error".into()).into();
        assert_eq!(launch.kind, FailureKind::DriverUnavailable);
        let timeout: PublishFailure = BrowserError::Timeout("navigation".into()).into();
        assert!(timeout.kind.is_retryable());
    }

    #[test]
    fn local_io_errors_are_not_surface_changes() {
        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "captures dir");
        let failure: PublishFailure = BrowserError::Io(denied).into();
        assert_eq!(failure.kind, FailureKind::PreparationFailed);
        assert!(!failure.kind.is_retryable());
        let config: PublishFailure = BrowserError::Configuration("bad viewport".into()).into();
        assert_eq!(config.kind, FailureKind::PreparationFailed);
    }

    #[test]
    fn standard_table_reports_media_support_per_platform() {
        let config = CrosspostConfig::default();
        let store = Arc::new(SessionStore::new(Arc::new(crate::session::MemoryBackend::new())));
        let launcher: Arc<dyn BrowserLauncher> =
            Arc::new(super::browser::tests::FakeLauncher::new(Vec::new()));
        let table = AgentTable::standard(&config, launcher, store);
        assert!(table.supports(PlatformId::Facebook, MediaKind::Text));
        assert!(table.supports(PlatformId::Instagram, MediaKind::Image));
        assert!(!table.supports(PlatformId::TikTok, MediaKind::Text));
        assert!(!table.supports(PlatformId::YouTube, MediaKind::Image));
    }
}
