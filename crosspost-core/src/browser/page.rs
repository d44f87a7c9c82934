use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, SetUserAgentOverrideParams, TimeSinceEpoch,
};
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::StoredCookie;

use super::error::{BrowserError, BrowserResult};
use super::profile::BrowserProfile;

/// Selectors prefixed with `text=` match a clickable element by its visible text.
pub const TEXT_SELECTOR_PREFIX: &str = "text=";

/// The page operations an upload script needs. Implemented over CDP for real
/// runs and by scripted fakes in tests.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    async fn navigate(&self, url: &str) -> BrowserResult<()>;
    async fn reload(&self) -> BrowserResult<()>;
    async fn current_url(&self) -> BrowserResult<String>;
    async fn set_cookies(&self, cookies: &[StoredCookie]) -> BrowserResult<()>;
    async fn cookies(&self) -> BrowserResult<Vec<StoredCookie>>;
    async fn is_present(&self, selector: &str) -> BrowserResult<bool>;
    async fn click(&self, selector: &str) -> BrowserResult<()>;
    async fn upload_file(&self, selector: &str, path: &Path) -> BrowserResult<()>;
    async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()>;
    async fn screenshot(&self) -> BrowserResult<Vec<u8>>;
    async fn page_source(&self) -> BrowserResult<String>;
    /// Tears the browser down. Must be called on every path out of a script.
    async fn close(self: Box<Self>) -> BrowserResult<()>;
}

pub struct ChromiumPage {
    browser: Browser,
    page: Page,
    profile: BrowserProfile,
    handler_task: Option<JoinHandle<()>>,
    navigation_timeout: Duration,
}

impl std::fmt::Debug for ChromiumPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumPage")
            .field("profile", &self.profile.id())
            .finish()
    }
}

impl ChromiumPage {
    pub(crate) fn new(
        browser: Browser,
        page: Page,
        profile: BrowserProfile,
        handler_task: JoinHandle<()>,
        navigation_timeout: Duration,
    ) -> Self {
        Self {
            browser,
            page,
            profile,
            handler_task: Some(handler_task),
            navigation_timeout,
        }
    }

    pub(crate) async fn prepare(&self, user_agent: Option<&str>) -> BrowserResult<()> {
        if let Some(agent) = user_agent {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(agent)
                .build()
                .map_err(BrowserError::Configuration)?;
            self.page.set_user_agent(params).await?;
        }
        self.profile.touch().await
    }

    async fn element(&self, selector: &str) -> BrowserResult<Element> {
        self.page
            .find_element(selector)
            .await
            .map_err(|_| BrowserError::ElementNotFound(selector.to_string()))
    }

    async fn text_match(&self, text: &str, click: bool) -> BrowserResult<bool> {
        let needle = serde_json::to_string(text)
            .map_err(|err| BrowserError::Unexpected(err.to_string()))?;
        let script = format!(
            "(() => {{
                const needle = {needle}.toLowerCase();
                const nodes = document.querySelectorAll('button, [role=\"button\"], a, span, div');
                for (const node of nodes) {{
                    const label = (node.innerText || '').trim().toLowerCase();
                    if (label === needle) {{
                        if ({click}) {{ node.click(); }}
                        return true;
                    }}
                }}
                return false;
            }})()"
        );
        let result = self.page.evaluate(script).await?;
        Ok(result.into_value::<bool>().unwrap_or(false))
    }
}

fn to_cookie_param(cookie: &StoredCookie) -> BrowserResult<CookieParam> {
    let mut builder = CookieParam::builder()
        .name(cookie.name.clone())
        .value(cookie.value.clone())
        .domain(cookie.domain.clone())
        .path(cookie.path.clone())
        .secure(cookie.secure)
        .http_only(cookie.http_only);
    if let Some(expires) = cookie.expires {
        builder = builder.expires(TimeSinceEpoch::new(expires));
    }
    builder.build().map_err(BrowserError::Configuration)
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn navigate(&self, url: &str) -> BrowserResult<()> {
        let navigation = async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation().await?;
            Ok::<_, BrowserError>(())
        };
        tokio::time::timeout(self.navigation_timeout, navigation)
            .await
            .map_err(|_| BrowserError::Timeout(format!("navigation to {url}")))?
    }

    async fn reload(&self) -> BrowserResult<()> {
        tokio::time::timeout(self.navigation_timeout, async {
            self.page.reload().await?;
            Ok::<_, BrowserError>(())
        })
        .await
        .map_err(|_| BrowserError::Timeout("page reload".into()))?
    }

    async fn current_url(&self) -> BrowserResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn set_cookies(&self, cookies: &[StoredCookie]) -> BrowserResult<()> {
        let params = cookies
            .iter()
            .map(to_cookie_param)
            .collect::<BrowserResult<Vec<_>>>()?;
        if params.is_empty() {
            return Ok(());
        }
        self.page.set_cookies(params).await?;
        Ok(())
    }

    async fn cookies(&self) -> BrowserResult<Vec<StoredCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| StoredCookie {
                expires: (!cookie.session && cookie.expires > 0.0).then_some(cookie.expires),
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                secure: cookie.secure,
                http_only: cookie.http_only,
            })
            .collect())
    }

    async fn is_present(&self, selector: &str) -> BrowserResult<bool> {
        if let Some(text) = selector.strip_prefix(TEXT_SELECTOR_PREFIX) {
            return self.text_match(text, false).await;
        }
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn click(&self, selector: &str) -> BrowserResult<()> {
        if let Some(text) = selector.strip_prefix(TEXT_SELECTOR_PREFIX) {
            return if self.text_match(text, true).await? {
                Ok(())
            } else {
                Err(BrowserError::ElementNotFound(selector.to_string()))
            };
        }
        self.element(selector).await?.click().await?;
        Ok(())
    }

    async fn upload_file(&self, selector: &str, path: &Path) -> BrowserResult<()> {
        let element = self.element(selector).await?;
        let params = SetFileInputFilesParams::builder()
            .file(path.to_string_lossy().into_owned())
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.execute(params).await?;
        debug!(selector, path = %path.display(), "file attached");
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> BrowserResult<()> {
        let element = self.element(selector).await?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    async fn screenshot(&self) -> BrowserResult<Vec<u8>> {
        let params = ScreenshotParams::builder().full_page(true).build();
        Ok(self.page.screenshot(params).await?)
    }

    async fn page_source(&self) -> BrowserResult<String> {
        Ok(self.page.content().await?)
    }

    async fn close(mut self: Box<Self>) -> BrowserResult<()> {
        info!(profile = %self.profile.id(), "Shutting down Chromium instance");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "Failed to close browser gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Browser handler join error");
            }
        }
        self.profile.discard().await;
        Ok(())
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!(
                    profile = %self.profile.id(),
                    "ChromiumPage dropped without explicit close"
                );
                handle.abort();
            }
        }
    }
}
