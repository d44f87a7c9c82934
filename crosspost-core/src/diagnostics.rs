use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::browser::{BrowserLauncher, LaunchRequest};
use crate::driver::DriverResolver;
use crate::environment::{EnvironmentProbe, EnvironmentProfile};
use crate::platform::PlatformId;
use crate::session::{SessionStore, ValidityState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthStatus::Pass => "pass",
            HealthStatus::Warn => "warn",
            HealthStatus::Fail => "fail",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub detail: String,
}

impl HealthCheck {
    fn new(name: impl Into<String>, status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Worst status across all checks.
    pub fn overall(&self) -> HealthStatus {
        self.checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Pass)
    }

    pub fn get(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

/// Walks the same startup path a publish run takes, without touching
/// persisted session state.
pub struct HealthReporter {
    probe: EnvironmentProbe,
    resolver: Arc<DriverResolver>,
    launcher: Option<Arc<dyn BrowserLauncher>>,
    sessions: Arc<SessionStore>,
    platforms: Vec<PlatformId>,
}

impl fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReporter")
            .field("resolver", &self.resolver)
            .field("launcher", &self.launcher.is_some())
            .field("platforms", &self.platforms)
            .finish()
    }
}

impl HealthReporter {
    pub fn new(
        probe: EnvironmentProbe,
        resolver: Arc<DriverResolver>,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self {
            probe,
            resolver,
            launcher: None,
            sessions,
            platforms: PlatformId::ALL.to_vec(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_platforms(mut self, platforms: Vec<PlatformId>) -> Self {
        self.platforms = platforms;
        self
    }

    pub async fn run(&self) -> HealthReport {
        let mut checks = Vec::new();
        let profile = match self.probe.profile() {
            Ok(profile) => {
                checks.push(HealthCheck::new(
                    "environment",
                    HealthStatus::Pass,
                    describe_profile(&profile),
                ));
                Some(profile)
            }
            Err(err) => {
                checks.push(HealthCheck::new("environment", HealthStatus::Fail, err.to_string()));
                None
            }
        };

        let driver_ready = match &profile {
            Some(profile) => {
                let check = self.check_driver(profile).await;
                let ready = check.status == HealthStatus::Pass;
                checks.push(check);
                ready
            }
            None => {
                checks.push(HealthCheck::new(
                    "driver",
                    HealthStatus::Warn,
                    "skipped: environment unknown",
                ));
                false
            }
        };

        checks.push(self.check_launch(driver_ready).await);

        for platform in &self.platforms {
            checks.push(self.check_session(*platform).await);
        }

        let report = HealthReport { checks };
        info!(overall = %report.overall(), "health check finished");
        report
    }

    async fn check_driver(&self, profile: &EnvironmentProfile) -> HealthCheck {
        match self.resolver.resolve(profile).await {
            Ok(handle) => HealthCheck::new(
                "driver",
                HealthStatus::Pass,
                format!(
                    "{} ({}, {:?})",
                    handle.binary_path.display(),
                    handle.target_browser_version,
                    handle.source
                ),
            ),
            Err(err) => HealthCheck::new("driver", HealthStatus::Fail, err.to_string()),
        }
    }

    /// Starts and immediately closes a headless browser.
    async fn check_launch(&self, driver_ready: bool) -> HealthCheck {
        let Some(launcher) = &self.launcher else {
            return HealthCheck::new("browser_launch", HealthStatus::Warn, "skipped: no launcher");
        };
        if !driver_ready {
            return HealthCheck::new(
                "browser_launch",
                HealthStatus::Warn,
                "skipped: driver unavailable",
            );
        }
        let request = LaunchRequest {
            platform: PlatformId::TikTok,
            headless: true,
        };
        match launcher.launch(request).await {
            Ok(page) => {
                let url = page.current_url().await.unwrap_or_default();
                debug!(%url, "health launch succeeded");
                match page.close().await {
                    Ok(()) => HealthCheck::new("browser_launch", HealthStatus::Pass, "launched and closed"),
                    Err(err) => HealthCheck::new(
                        "browser_launch",
                        HealthStatus::Warn,
                        format!("launched but teardown failed: {err}"),
                    ),
                }
            }
            Err(err) => HealthCheck::new("browser_launch", HealthStatus::Fail, err.to_string()),
        }
    }

    async fn check_session(&self, platform: PlatformId) -> HealthCheck {
        let status = self.sessions.status(platform).await;
        let level = match status.validity {
            ValidityState::Valid => HealthStatus::Pass,
            ValidityState::Stale | ValidityState::Absent => HealthStatus::Warn,
            ValidityState::Corrupt => HealthStatus::Fail,
        };
        let mut detail = status.validity.to_string();
        if status.cookies_total > 0 {
            detail.push_str(&format!(
                ", {} cookies ({} expired)",
                status.cookies_total, status.cookies_expired
            ));
        }
        if let Some(expires) = status.token_expires_at {
            detail.push_str(&format!(", token expires {}", expires.to_rfc3339()));
        }
        if let Some(captured) = status.captured_at {
            detail.push_str(&format!(", captured {}", captured.to_rfc3339()));
        }
        HealthCheck::new(format!("session:{platform}"), level, detail)
    }
}

fn describe_profile(profile: &EnvironmentProfile) -> String {
    let signals = profile
        .signals
        .iter()
        .map(|signal| signal.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{:?}/{:?} virtualized={} headless={} display={}{}",
        profile.os_kind,
        profile.cpu_arch,
        profile.is_virtualized,
        profile.is_headless,
        profile.display_available,
        if signals.is_empty() {
            String::new()
        } else {
            format!(" [{signals}]")
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrosspostConfig;
    use crate::environment::tests::FakeHost;
    use crate::environment::AutomationMode;
    use crate::session::{AuthState, MemoryBackend, StoredCookie};

    fn resolver_without_candidates() -> Arc<DriverResolver> {
        let mut config = CrosspostConfig::default();
        config.driver.candidates.clear();
        config.driver.browser_candidates.clear();
        config.driver.auto_provision = false;
        config.driver.override_path = None;
        let mode = AutomationMode {
            headless: true,
            single_process: false,
            no_sandbox: false,
            disable_gpu: false,
        };
        Arc::new(DriverResolver::new(&config, mode))
    }

    #[tokio::test]
    async fn reports_every_stage_without_mutating_sessions() {
        let backend = Arc::new(MemoryBackend::new());
        let sessions = Arc::new(SessionStore::new(backend));
        sessions
            .save(
                PlatformId::TikTok,
                AuthState::Cookies {
                    cookies: vec![StoredCookie {
                        name: "sessionid".into(),
                        value: "abc".into(),
                        domain: ".tiktok.com".into(),
                        path: "/".into(),
                        expires: None,
                        secure: true,
                        http_only: true,
                    }],
                },
            )
            .await
            .unwrap();

        let mut host = FakeHost::linux();
        host.env.insert("DISPLAY".into(), ":0".into());
        let reporter = HealthReporter::new(
            EnvironmentProbe::with_host(Arc::new(host)),
            resolver_without_candidates(),
            Arc::clone(&sessions),
        )
        .with_platforms(vec![PlatformId::TikTok, PlatformId::Instagram]);

        let report = reporter.run().await;
        assert_eq!(report.get("environment").unwrap().status, HealthStatus::Pass);
        assert_eq!(report.get("driver").unwrap().status, HealthStatus::Fail);
        assert_eq!(report.get("browser_launch").unwrap().status, HealthStatus::Warn);
        assert_eq!(report.get("session:tiktok").unwrap().status, HealthStatus::Pass);
        assert!(report.get("session:tiktok").unwrap().detail.contains("1 cookies"));
        assert_eq!(report.get("session:instagram").unwrap().status, HealthStatus::Warn);
        assert_eq!(report.overall(), HealthStatus::Fail);

        let after = sessions.load(PlatformId::Instagram).await;
        assert_eq!(after.validity, ValidityState::Absent);
        assert_eq!(sessions.load(PlatformId::TikTok).await.validity, ValidityState::Valid);
    }

    #[tokio::test]
    async fn unknown_os_fails_environment_and_skips_driver() {
        let mut host = FakeHost::linux();
        host.os = "plan9".into();
        let reporter = HealthReporter::new(
            EnvironmentProbe::with_host(Arc::new(host)),
            resolver_without_candidates(),
            Arc::new(SessionStore::new(Arc::new(MemoryBackend::new()))),
        )
        .with_platforms(Vec::new());
        let report = reporter.run().await;
        assert_eq!(report.get("environment").unwrap().status, HealthStatus::Fail);
        assert_eq!(report.get("driver").unwrap().status, HealthStatus::Warn);
        assert_eq!(report.checks.len(), 3);
    }
}
