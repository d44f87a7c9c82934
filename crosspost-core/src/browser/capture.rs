use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::page::BrowserPage;

/// Where the evidence for a failed browser attempt was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRef {
    pub directory: PathBuf,
    pub screenshot: Option<PathBuf>,
    pub page_source: Option<PathBuf>,
    pub url: Option<String>,
    pub stage: String,
}

impl DiagnosticRef {
    pub fn reference(&self) -> String {
        self.directory.display().to_string()
    }
}

/// Captures a screenshot and page HTML under `dir`. Never fails: whatever
/// could not be captured is left out of the returned reference.
pub async fn capture_page(page: &dyn BrowserPage, dir: &Path, stage: &str) -> DiagnosticRef {
    let mut diagnostic = DiagnosticRef {
        directory: dir.to_path_buf(),
        screenshot: None,
        page_source: None,
        url: page.current_url().await.ok(),
        stage: stage.to_string(),
    };
    if let Err(err) = tokio::fs::create_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %err, "cannot create capture directory");
        return diagnostic;
    }

    match page.screenshot().await {
        Ok(bytes) => {
            let path = dir.join(format!("{stage}.png"));
            match tokio::fs::write(&path, bytes).await {
                Ok(()) => diagnostic.screenshot = Some(path),
                Err(err) => warn!(path = %path.display(), error = %err, "failed to write screenshot"),
            }
        }
        Err(err) => warn!(stage, error = %err, "screenshot capture failed"),
    }
    match page.page_source().await {
        Ok(html) => {
            let path = dir.join(format!("{stage}.html"));
            match tokio::fs::write(&path, html).await {
                Ok(()) => diagnostic.page_source = Some(path),
                Err(err) => warn!(path = %path.display(), error = %err, "failed to write page source"),
            }
        }
        Err(err) => warn!(stage, error = %err, "page source capture failed"),
    }
    diagnostic
}
