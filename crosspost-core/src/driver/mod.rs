//! Locates a Chromium-family binary the automation layer can drive over the
//! DevTools protocol, provisioning one when the host has none that fits.

mod error;
mod provision;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{CrosspostConfig, DriverSection};
use crate::environment::{AutomationMode, CpuArch, EnvironmentProfile, OsKind};
use crate::process::{CommandRunner, SystemCommandRunner};

pub use error::{DriverError, DriverResult, ResolutionAttempt, ResolutionMethod};
pub use provision::{ChromeForTestingProvisioner, DriverProvisioner, ProvisionRequest};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrowserVersion {
    pub raw: String,
    pub major: u32,
}

impl fmt::Display for BrowserVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn parse_version(text: &str) -> Option<BrowserVersion> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"(\d+)(?:\.\d+){1,3}").ok())
        .as_ref()?;
    let found = pattern.captures(text)?;
    let raw = found.get(0)?.as_str().to_string();
    let major = found.get(1)?.as_str().parse().ok()?;
    Some(BrowserVersion { raw, major })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverSource {
    Override,
    System,
    Provisioned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverHandle {
    pub binary_path: PathBuf,
    pub target_browser_version: BrowserVersion,
    pub launch_options: Vec<String>,
    pub source: DriverSource,
}

/// Launch errors that point at the driver binary itself rather than the page.
pub trait DriverFault {
    fn is_driver_fault(&self) -> bool;
}

/// Chrome-for-Testing platform key for the host, if builds are published for it.
pub fn platform_key(profile: &EnvironmentProfile) -> Option<&'static str> {
    match (&profile.os_kind, &profile.cpu_arch) {
        (OsKind::Linux, CpuArch::X86_64) => Some("linux64"),
        (OsKind::MacOs, CpuArch::Aarch64) => Some("mac-arm64"),
        (OsKind::MacOs, CpuArch::X86_64) => Some("mac-x64"),
        (OsKind::Windows, CpuArch::X86_64) => Some("win64"),
        (OsKind::Windows, CpuArch::X86) => Some("win32"),
        _ => None,
    }
}

pub struct DriverResolver {
    config: DriverSection,
    drivers_dir: PathBuf,
    launch_options: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    provisioner: Arc<dyn DriverProvisioner>,
    cached: RwLock<Option<DriverHandle>>,
    rejected: RwLock<HashSet<PathBuf>>,
}

impl fmt::Debug for DriverResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverResolver")
            .field("config", &self.config)
            .field("drivers_dir", &self.drivers_dir)
            .field("launch_options", &self.launch_options)
            .finish()
    }
}

impl DriverResolver {
    pub fn new(config: &CrosspostConfig, mode: AutomationMode) -> Self {
        let provisioner = ChromeForTestingProvisioner::new(
            config.driver.release_endpoint.clone(),
            config.driver.download_base.clone(),
        );
        Self {
            config: config.driver.clone(),
            drivers_dir: config.drivers_dir(),
            launch_options: mode.chromium_args(),
            runner: Arc::new(SystemCommandRunner),
            provisioner: Arc::new(provisioner),
            cached: RwLock::new(None),
            rejected: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn DriverProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub async fn cached(&self) -> Option<DriverHandle> {
        self.cached.read().await.clone()
    }

    /// Returns the cached handle or runs override, system, then provisioning.
    pub async fn resolve(&self, profile: &EnvironmentProfile) -> DriverResult<DriverHandle> {
        if let Some(handle) = self.cached.read().await.clone() {
            return Ok(handle);
        }
        let mut guard = self.cached.write().await;
        if let Some(handle) = guard.clone() {
            return Ok(handle);
        }
        let handle = self.resolve_uncached(profile).await?;
        info!(
            path = %handle.binary_path.display(),
            version = %handle.target_browser_version,
            source = ?handle.source,
            "browser driver resolved"
        );
        *guard = Some(handle.clone());
        Ok(handle)
    }

    /// Excludes the failed binary from future resolutions and drops the cached
    /// handle if it still points at that binary. A handle some other launch
    /// already re-resolved to stays cached.
    pub async fn invalidate(&self, failed: &DriverHandle) {
        let newly_rejected = self
            .rejected
            .write()
            .await
            .insert(failed.binary_path.clone());
        if newly_rejected {
            warn!(path = %failed.binary_path.display(), "invalidating browser driver");
        }
        let mut cached = self.cached.write().await;
        match cached.as_ref() {
            Some(current) if current.binary_path == failed.binary_path => *cached = None,
            Some(current) => {
                debug!(path = %current.binary_path.display(), "driver already re-resolved")
            }
            None => {}
        }
    }

    /// Runs `launch` with a resolved driver. A driver fault invalidates the
    /// failed handle and retries against a freshly resolved driver exactly once.
    pub async fn launch_with_recovery<T, E, F, Fut>(
        &self,
        profile: &EnvironmentProfile,
        mut launch: F,
    ) -> Result<T, E>
    where
        F: FnMut(DriverHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: DriverFault + From<DriverError> + fmt::Display,
    {
        let handle = self.resolve(profile).await?;
        match launch(handle.clone()).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_driver_fault() => {
                warn!(error = %err, path = %handle.binary_path.display(), "driver failed at launch, re-resolving once");
                self.invalidate(&handle).await;
                let handle = self.resolve(profile).await?;
                launch(handle).await.map_err(|err| {
                    if err.is_driver_fault() {
                        E::from(DriverError::Relaunch(err.to_string()))
                    } else {
                        err
                    }
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn resolve_uncached(&self, profile: &EnvironmentProfile) -> DriverResult<DriverHandle> {
        let rejected = self.rejected.read().await.clone();
        let browser = self.installed_browser().await;
        let required = self.config.required_major.or(browser.as_ref().map(|v| v.major));
        debug!(?browser, ?required, "resolving browser driver");
        let mut attempts = Vec::new();

        match self.config.override_path.as_deref() {
            None => attempts.push(ResolutionAttempt {
                method: ResolutionMethod::Override,
                reason: "no override path configured".into(),
            }),
            Some(path) => {
                let path = PathBuf::from(path);
                match self.check_binary(&path, required, &rejected).await {
                    Ok(version) => return Ok(self.handle(path, version, DriverSource::Override)),
                    Err(reason) => attempts.push(ResolutionAttempt {
                        method: ResolutionMethod::Override,
                        reason: format!("{}: {reason}", path.display()),
                    }),
                }
            }
        }

        let mut failures = Vec::new();
        for candidate in &self.config.candidates {
            let Some(path) = self.runner.locate(candidate) else {
                failures.push(format!("{candidate}: not found"));
                continue;
            };
            match self.check_binary(&path, required, &rejected).await {
                Ok(version) => return Ok(self.handle(path, version, DriverSource::System)),
                Err(reason) => failures.push(format!("{}: {reason}", path.display())),
            }
        }
        attempts.push(ResolutionAttempt {
            method: ResolutionMethod::System,
            reason: if failures.is_empty() {
                "no system candidates configured".into()
            } else {
                failures.join(", ")
            },
        });

        let provision_failure = if !self.config.auto_provision {
            "automatic provisioning disabled".to_string()
        } else if let Some(key) = platform_key(profile) {
            let request = ProvisionRequest {
                major: required,
                platform_key: key.to_string(),
                dest_dir: self.drivers_dir.clone(),
            };
            match self.provisioner.provision(&request).await {
                Ok(path) => match self.check_binary(&path, required, &rejected).await {
                    Ok(version) => {
                        return Ok(self.handle(path, version, DriverSource::Provisioned))
                    }
                    Err(reason) => format!("{}: {reason}", path.display()),
                },
                Err(err) => err.to_string(),
            }
        } else {
            format!(
                "no prebuilt driver for {:?}/{}",
                profile.os_kind, profile.cpu_arch
            )
        };
        attempts.push(ResolutionAttempt {
            method: ResolutionMethod::Provision,
            reason: provision_failure,
        });

        warn!(?attempts, "browser driver resolution exhausted");
        Err(DriverError::Exhausted { attempts })
    }

    async fn installed_browser(&self) -> Option<BrowserVersion> {
        for candidate in &self.config.browser_candidates {
            let Some(path) = self.runner.locate(candidate) else {
                continue;
            };
            if let Ok(version) = self.report_version(&path).await {
                return Some(version);
            }
        }
        None
    }

    async fn report_version(&self, path: &Path) -> Result<BrowserVersion, String> {
        let output = self
            .runner
            .output(path, &["--version".to_string()])
            .await
            .map_err(|err| format!("failed to execute: {err}"))?;
        if !output.success {
            return Err(format!(
                "exited with {:?}: {}",
                output.code,
                output.stderr.trim()
            ));
        }
        parse_version(output.text())
            .ok_or_else(|| format!("unrecognized version output `{}`", output.text()))
    }

    async fn check_binary(
        &self,
        path: &Path,
        required: Option<u32>,
        rejected: &HashSet<PathBuf>,
    ) -> Result<BrowserVersion, String> {
        if rejected.contains(path) {
            return Err("rejected after launch failure".into());
        }
        let version = self.report_version(path).await?;
        match required {
            Some(major) if major != version.major => Err(format!(
                "version {} does not match browser major {major}",
                version.raw
            )),
            _ => Ok(version),
        }
    }

    fn handle(&self, path: PathBuf, version: BrowserVersion, source: DriverSource) -> DriverHandle {
        DriverHandle {
            binary_path: path,
            target_browser_version: version,
            launch_options: self.launch_options.clone(),
            source,
        }
    }
}
