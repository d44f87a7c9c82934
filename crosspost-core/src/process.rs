use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

/// Captured result of an external tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout when present, stderr otherwise. Some tools print versions on stderr.
    pub fn text(&self) -> &str {
        if self.stdout.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        }
    }
}

/// Seam over process execution so driver probing and tool adapters can be
/// exercised without the real binaries.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput>;

    /// Resolves a bare program name against `PATH`. Paths are returned as-is when they exist.
    fn locate(&self, program: &str) -> Option<PathBuf> {
        locate_in_path(program, std::env::var_os("PATH"))
    }
}

pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn output(&self, program: &Path, args: &[String]) -> std::io::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl fmt::Debug for SystemCommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SystemCommandRunner")
    }
}

pub fn locate_in_path(program: &str, path_var: Option<std::ffi::OsString>) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path_var = path_var?;
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(program);
        if full.is_file() {
            return Some(full);
        }
        if cfg!(windows) {
            let exe = dir.join(format!("{program}.exe"));
            if exe.is_file() {
                return Some(exe);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn locates_programs_on_search_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("chromium"), b"#!/bin/sh\n").unwrap();
        let path_var = std::env::join_paths([dir.path()]).unwrap();
        let found = locate_in_path("chromium", Some(path_var.clone())).unwrap();
        assert_eq!(found, dir.path().join("chromium"));
        assert!(locate_in_path("google-chrome", Some(path_var)).is_none());
    }

    #[test]
    fn output_text_falls_back_to_stderr() {
        let output = CommandOutput {
            success: true,
            code: Some(0),
            stdout: "  ".into(),
            stderr: "Chromium 120.0.6099.109\n".into(),
        };
        assert_eq!(output.text(), "Chromium 120.0.6099.109");
    }
}
