use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::handler::Handler;
use futures::StreamExt;
use tracing::{debug, info};

use crate::config::{AutomationSection, CrosspostConfig};
use crate::driver::{DriverHandle, DriverResolver};
use crate::environment::{AutomationMode, EnvironmentProfile};
use crate::platform::PlatformId;

use super::error::{BrowserError, BrowserResult};
use super::page::{BrowserPage, ChromiumPage};
use super::profile::{BrowserProfile, ProfileManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchRequest {
    pub platform: PlatformId,
    pub headless: bool,
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, request: LaunchRequest) -> BrowserResult<Box<dyn BrowserPage>>;

    /// Headless setting the environment asks for; interactive logins override it.
    fn default_headless(&self) -> bool;
}

/// Launches Chromium through the driver resolver, re-resolving once when the
/// binary itself is at fault.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    automation: Arc<AutomationSection>,
    mode: AutomationMode,
    environment: EnvironmentProfile,
    resolver: Arc<DriverResolver>,
    profiles: ProfileManager,
}

impl ChromiumLauncher {
    pub fn new(
        config: &CrosspostConfig,
        environment: EnvironmentProfile,
        mode: AutomationMode,
        resolver: Arc<DriverResolver>,
    ) -> BrowserResult<Self> {
        let profiles = ProfileManager::from_config(&config.automation, &config.profiles_dir())?;
        Ok(Self {
            automation: Arc::new(config.automation.clone()),
            mode,
            environment,
            resolver,
            profiles,
        })
    }

    pub fn mode(&self) -> AutomationMode {
        self.mode
    }

    fn build_chromium_config(
        &self,
        driver: &DriverHandle,
        profile: &BrowserProfile,
        headless: bool,
    ) -> BrowserResult<ChromiumConfig> {
        let [width, height] = self.automation.window_size;
        let mut builder = ChromiumConfig::builder()
            .chrome_executable(&driver.binary_path)
            .user_data_dir(profile.path())
            .window_size(width, height)
            .viewport(ChromiumViewport {
                width,
                height,
                device_scale_factor: None,
                emulating_mobile: false,
                is_landscape: width >= height,
                has_touch: false,
            })
            .request_timeout(Duration::from_secs(self.automation.navigation_timeout_seconds));

        if !headless {
            builder = builder.with_head();
        }
        if self.mode.no_sandbox {
            builder = builder.no_sandbox();
        }

        // Interactive logins run headed; single-process mode breaks headed Chromium.
        let mut args: Vec<String> = driver
            .launch_options
            .iter()
            .filter(|arg| headless || arg.as_str() != "--single-process")
            .cloned()
            .collect();
        args.push("--disable-blink-features=AutomationControlled".into());
        args.push("--disable-notifications".into());
        args.push("--no-first-run".into());
        args.push("--password-store=basic".into());
        if let Some(lang) = &self.automation.lang {
            args.push(format!("--lang={lang}"));
        }
        if let Some(agent) = &self.automation.user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        builder = builder.args(args);

        builder.build().map_err(BrowserError::Configuration)
    }

    async fn start(
        &self,
        driver: DriverHandle,
        profile: &BrowserProfile,
        headless: bool,
    ) -> BrowserResult<(Browser, Handler)> {
        let config = self.build_chromium_config(&driver, profile, headless)?;
        info!(
            profile = %profile.id(),
            driver = %driver.binary_path.display(),
            version = %driver.target_browser_version,
            headless,
            "Launching Chromium instance"
        );
        Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self, request: LaunchRequest) -> BrowserResult<Box<dyn BrowserPage>> {
        self.profiles.cleanup_expired()?;
        let profile = self.profiles.allocate(request.platform)?;
        let allocated = &profile;
        let launched = self
            .resolver
            .launch_with_recovery(&self.environment, move |driver| {
                self.start(driver, allocated, request.headless)
            })
            .await;
        let (mut browser, mut handler) = match launched {
            Ok(pair) => pair,
            Err(err) => {
                profile.discard().await;
                return Err(err);
            }
        };

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "Chromium handler reported error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                let _ = browser.close().await;
                let _ = handler_task.await;
                profile.discard().await;
                return Err(err.into());
            }
        };
        let chromium = Box::new(ChromiumPage::new(
            browser,
            page,
            profile,
            handler_task,
            Duration::from_secs(self.automation.navigation_timeout_seconds),
        ));
        if let Err(err) = chromium.prepare(self.automation.user_agent.as_deref()).await {
            chromium.close().await?;
            return Err(err);
        }
        Ok(chromium)
    }

    fn default_headless(&self) -> bool {
        self.mode.headless
    }
}
