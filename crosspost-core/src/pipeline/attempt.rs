use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::{Artifact, FailureKind, PublishFailure};
use crate::browser::DiagnosticRef;
use crate::platform::PlatformId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Authenticating,
    Uploading,
    Confirming,
    Succeeded,
    Failed,
}

impl AttemptState {
    fn rank(&self) -> u8 {
        match self {
            AttemptState::Pending => 0,
            AttemptState::Authenticating => 1,
            AttemptState::Uploading => 2,
            AttemptState::Confirming => 3,
            AttemptState::Succeeded | AttemptState::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Authenticating => "authenticating",
            AttemptState::Uploading => "uploading",
            AttemptState::Confirming => "confirming",
            AttemptState::Succeeded => "succeeded",
            AttemptState::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub state: AttemptState,
    pub at: DateTime<Utc>,
}

/// One platform's journey through the pipeline. State only moves forward;
/// `retry` is the single way back to `Pending`.
#[derive(Debug, Clone, Serialize)]
pub struct PublishAttempt {
    pub platform: PlatformId,
    pub asset_ref: Option<String>,
    pub content_ref: Option<String>,
    pub state: AttemptState,
    pub retry_count: u32,
    pub last_error: Option<PublishFailure>,
    pub artifact: Option<Artifact>,
    pub diagnostic: Option<DiagnosticRef>,
    pub history: Vec<StateChange>,
}

impl PublishAttempt {
    pub fn new(platform: PlatformId) -> Self {
        Self {
            platform,
            asset_ref: None,
            content_ref: None,
            state: AttemptState::Pending,
            retry_count: 0,
            last_error: None,
            artifact: None,
            diagnostic: None,
            history: vec![StateChange {
                state: AttemptState::Pending,
                at: Utc::now(),
            }],
        }
    }

    /// Moves forward; returns false and leaves the attempt untouched when the
    /// target would go backward or the attempt is already terminal.
    pub fn advance(&mut self, next: AttemptState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return false;
        }
        self.set(next);
        true
    }

    pub fn succeed(&mut self, artifact: Artifact) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.artifact = Some(artifact);
        self.last_error = None;
        self.set(AttemptState::Succeeded);
        true
    }

    pub fn fail(&mut self, failure: PublishFailure) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if failure.diagnostic.is_some() {
            self.diagnostic = failure.diagnostic.clone();
        }
        self.last_error = Some(failure);
        self.set(AttemptState::Failed);
        true
    }

    /// The bounded-retry reset. Only a non-terminal attempt can be retried.
    pub fn retry(&mut self, failure: PublishFailure) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if failure.diagnostic.is_some() {
            self.diagnostic = failure.diagnostic.clone();
        }
        self.last_error = Some(failure);
        self.retry_count += 1;
        self.set(AttemptState::Pending);
        true
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.last_error.as_ref().map(|failure| failure.kind)
    }

    fn set(&mut self, state: AttemptState) {
        self.state = state;
        self.history.push(StateChange {
            state,
            at: Utc::now(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    Running,
    PartialSuccess,
    Success,
    Failed,
}

impl OverallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallState::Running => "running",
            OverallState::PartialSuccess => "partial_success",
            OverallState::Success => "success",
            OverallState::Failed => "failed",
        }
    }
}

impl fmt::Display for OverallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub requested_platforms: Vec<PlatformId>,
    pub attempts: BTreeMap<PlatformId, PublishAttempt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Duplicate targets collapse into one attempt; the request order is kept.
    pub fn new(run_id: impl Into<String>, platforms: &[PlatformId]) -> Self {
        let mut requested_platforms = Vec::new();
        for platform in platforms {
            if !requested_platforms.contains(platform) {
                requested_platforms.push(*platform);
            }
        }
        let attempts = requested_platforms
            .iter()
            .map(|platform| (*platform, PublishAttempt::new(*platform)))
            .collect();
        Self {
            run_id: run_id.into(),
            requested_platforms,
            attempts,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn attempt(&self, platform: PlatformId) -> Option<&PublishAttempt> {
        self.attempts.get(&platform)
    }

    pub fn attempt_mut(&mut self, platform: PlatformId) -> Option<&mut PublishAttempt> {
        self.attempts.get_mut(&platform)
    }

    /// Always derived from the attempts, never stored.
    pub fn overall_state(&self) -> OverallState {
        if self.attempts.values().any(|attempt| !attempt.state.is_terminal()) {
            return OverallState::Running;
        }
        let succeeded = self
            .attempts
            .values()
            .filter(|attempt| attempt.state == AttemptState::Succeeded)
            .count();
        match succeeded {
            0 => OverallState::Failed,
            n if n == self.attempts.len() => OverallState::Success,
            _ => OverallState::PartialSuccess,
        }
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            overall_state: self.overall_state(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            attempts: self
                .requested_platforms
                .iter()
                .filter_map(|platform| self.attempts.get(platform))
                .map(AttemptSummary::from)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub platform: PlatformId,
    pub state: AttemptState,
    pub retry_count: u32,
    pub artifact: Option<String>,
    pub url: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub error: Option<String>,
    pub diagnostic: Option<String>,
}

impl From<&PublishAttempt> for AttemptSummary {
    fn from(attempt: &PublishAttempt) -> Self {
        Self {
            platform: attempt.platform,
            state: attempt.state,
            retry_count: attempt.retry_count,
            artifact: attempt.artifact.as_ref().map(|a| a.reference.clone()),
            url: attempt.artifact.as_ref().and_then(|a| a.url.clone()),
            failure_kind: attempt.failure_kind(),
            error: attempt.last_error.as_ref().map(|e| e.message.clone()),
            diagnostic: attempt.diagnostic.as_ref().map(DiagnosticRef::reference),
        }
    }
}

/// Serializable outcome printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub overall_state: OverallState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: Vec<AttemptSummary>,
}
