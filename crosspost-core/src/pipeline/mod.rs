//! Pipeline coordination: acquisition, per-platform content and media
//! preparation, then bounded-concurrency publishing with derived run state.

mod attempt;
mod coordinator;
mod workspace;

use std::path::PathBuf;

use thiserror::Error;

use crate::driver::DriverError;
use crate::platform::PlatformId;

pub use attempt::{
    AttemptState, AttemptSummary, OverallState, PipelineRun, PublishAttempt, RunReport,
    StateChange,
};
pub use coordinator::{PipelineContext, PipelineCoordinator, SourceSpec};
pub use workspace::{SweepReport, WorkspaceJanitor};

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Run-fatal conditions. Anything scoped to one platform lands on its attempt instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no target platforms requested")]
    NoTargets,
    #[error("no publish agent registered for {0}")]
    MissingAgent(PlatformId),
    #[error("invalid source `{0}`")]
    InvalidSource(String),
    #[error("browser driver unavailable for an all-browser run: {0}")]
    Driver(#[from] DriverError),
    #[error("cannot prepare work directory {path}: {source}")]
    WorkDir {
        source: std::io::Error,
        path: PathBuf,
    },
}
