use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::ZipArchive;

use super::error::{DriverError, DriverResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionRequest {
    /// Browser major to match; `None` provisions the current stable build.
    pub major: Option<u32>,
    /// Chrome-for-Testing platform key, e.g. `linux64` or `mac-arm64`.
    pub platform_key: String,
    pub dest_dir: PathBuf,
}

#[async_trait]
pub trait DriverProvisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> DriverResult<PathBuf>;
}

const BINARY_NAMES: &[&str] = &["chrome-headless-shell", "chrome-headless-shell.exe"];

/// Downloads `chrome-headless-shell` builds published through Chrome for Testing.
#[derive(Debug, Clone)]
pub struct ChromeForTestingProvisioner {
    client: reqwest::Client,
    release_endpoint: String,
    download_base: String,
}

impl ChromeForTestingProvisioner {
    pub fn new(release_endpoint: impl Into<String>, download_base: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            release_endpoint: release_endpoint.into(),
            download_base: download_base.into(),
        }
    }

    fn release_url(&self, major: Option<u32>) -> String {
        let base = self.release_endpoint.trim_end_matches('/');
        match major {
            Some(major) => format!("{base}/LATEST_RELEASE_{major}"),
            None => format!("{base}/LATEST_RELEASE_STABLE"),
        }
    }

    fn archive_url(&self, version: &str, platform_key: &str) -> String {
        format!(
            "{}/{version}/{platform_key}/chrome-headless-shell-{platform_key}.zip",
            self.download_base.trim_end_matches('/')
        )
    }

    async fn latest_version(&self, major: Option<u32>) -> DriverResult<String> {
        let url = self.release_url(major);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::Provision(format!(
                "release lookup {url} returned {}",
                response.status()
            )));
        }
        let version = response.text().await?.trim().to_string();
        if version.is_empty() {
            return Err(DriverError::Provision(format!("empty release from {url}")));
        }
        Ok(version)
    }
}

#[async_trait]
impl DriverProvisioner for ChromeForTestingProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> DriverResult<PathBuf> {
        let version = self.latest_version(request.major).await?;
        let target_dir = request
            .dest_dir
            .join(&version)
            .join(&request.platform_key);
        if let Some(existing) = find_binary(&target_dir) {
            debug!(path = %existing.display(), "reusing provisioned driver");
            return Ok(existing);
        }

        let url = self.archive_url(&version, &request.platform_key);
        info!(%url, "downloading driver build");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(DriverError::Provision(format!(
                "download {url} returned {}",
                response.status()
            )));
        }
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&target_dir).await?;
        let archive_path = target_dir.join("driver.zip");
        tokio::fs::write(&archive_path, &bytes).await?;

        let extract_dir = target_dir.clone();
        let archive_for_task = archive_path.clone();
        tokio::task::spawn_blocking(move || extract_archive(&archive_for_task, &extract_dir))
            .await
            .map_err(|err| DriverError::Provision(err.to_string()))??;
        let _ = tokio::fs::remove_file(&archive_path).await;

        let binary = find_binary(&target_dir).ok_or_else(|| {
            DriverError::Provision(format!(
                "archive {url} did not contain a chrome-headless-shell binary"
            ))
        })?;
        mark_executable(&binary)?;
        Ok(binary)
    }
}

pub(crate) fn extract_archive(archive: &Path, dest: &Path) -> DriverResult<()> {
    let mut archive = ZipArchive::new(File::open(archive)?)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            continue;
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

pub(crate) fn find_binary(root: &Path) -> Option<PathBuf> {
    if !root.exists() {
        return None;
    }
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| BINARY_NAMES.contains(&name))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
}

fn mark_executable(path: &Path) -> DriverResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    #[test]
    fn extracts_and_locates_headless_shell() {
        let dir = tempdir().unwrap();
        let archive_path = dir.path().join("driver.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut writer = ZipWriter::new(file);
            writer
                .add_directory("chrome-headless-shell-linux64/", FileOptions::default())
                .unwrap();
            writer
                .start_file(
                    "chrome-headless-shell-linux64/chrome-headless-shell",
                    FileOptions::default().unix_permissions(0o755),
                )
                .unwrap();
            writer.write_all(b"#!/bin/sh\necho 120.0.6099.109\n").unwrap();
            writer
                .start_file("chrome-headless-shell-linux64/LICENSE", FileOptions::default())
                .unwrap();
            writer.write_all(b"license").unwrap();
            writer.finish().unwrap();
        }

        let dest = dir.path().join("out");
        extract_archive(&archive_path, &dest).unwrap();
        let binary = find_binary(&dest).unwrap();
        assert!(binary.ends_with("chrome-headless-shell-linux64/chrome-headless-shell"));
        mark_executable(&binary).unwrap();
    }

    #[test]
    fn builds_chrome_for_testing_urls() {
        let provisioner = ChromeForTestingProvisioner::new(
            "https://googlechromelabs.github.io/chrome-for-testing/",
            "https://storage.googleapis.com/chrome-for-testing-public",
        );
        assert_eq!(
            provisioner.release_url(Some(120)),
            "https://googlechromelabs.github.io/chrome-for-testing/LATEST_RELEASE_120"
        );
        assert!(provisioner.release_url(None).ends_with("LATEST_RELEASE_STABLE"));
        assert_eq!(
            provisioner.archive_url("120.0.6099.109", "mac-arm64"),
            "https://storage.googleapis.com/chrome-for-testing-public/120.0.6099.109/mac-arm64/chrome-headless-shell-mac-arm64.zip"
        );
    }
}
