use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// The three resolution methods, always tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Override,
    System,
    Provision,
}

impl fmt::Display for ResolutionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResolutionMethod::Override => "override",
            ResolutionMethod::System => "system",
            ResolutionMethod::Provision => "provision",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionAttempt {
    pub method: ResolutionMethod,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no usable browser driver: {}", describe(.attempts))]
    Exhausted { attempts: Vec<ResolutionAttempt> },
    #[error("driver still failing after re-resolution: {0}")]
    Relaunch(String),
    #[error("provisioning failed: {0}")]
    Provision(String),
}

impl DriverError {
    pub fn attempts(&self) -> &[ResolutionAttempt] {
        match self {
            DriverError::Exhausted { attempts } => attempts,
            _ => &[],
        }
    }
}

fn describe(attempts: &[ResolutionAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| format!("{} ({})", attempt.method, attempt.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<reqwest::Error> for DriverError {
    fn from(err: reqwest::Error) -> Self {
        DriverError::Provision(err.to_string())
    }
}

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Provision(err.to_string())
    }
}

impl From<zip::result::ZipError> for DriverError {
    fn from(err: zip::result::ZipError) -> Self {
        DriverError::Provision(err.to_string())
    }
}
