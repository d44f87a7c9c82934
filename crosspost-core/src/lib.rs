pub mod agent;
pub mod browser;
pub mod collaborators;
pub mod config;
pub mod diagnostics;
pub mod driver;
pub mod environment;
pub mod error;
pub mod media;
pub mod pipeline;
pub mod platform;
pub mod process;
pub mod session;
pub mod telemetry;

pub use agent::{
    AgentStrategy, AgentTable, Artifact, BrowserAgent, CapabilityTable, FailureKind, PublishAgent,
    PublishFailure, PublishRequest, PublishResult, YouTubeAgent,
};
pub use config::{load_config, CrosspostConfig, ProcessingStrategy};
pub use diagnostics::{HealthCheck, HealthReport, HealthReporter, HealthStatus};
pub use driver::{DriverError, DriverHandle, DriverResolver};
pub use environment::{AutomationMode, EnvironmentError, EnvironmentProbe, EnvironmentProfile};
pub use error::{ConfigError, Result};
pub use media::{ContentBundle, MediaAsset, MediaKind, MediaMetadata};
pub use pipeline::{
    AttemptState, OverallState, PipelineContext, PipelineCoordinator, PipelineError, PipelineRun,
    PublishAttempt, RunReport, SourceSpec,
};
pub use platform::PlatformId;
pub use session::{AuthState, SessionRecord, SessionStore, StaleOutcome, ValidityState};
pub use telemetry::{PublishTelemetry, TelemetryError};
