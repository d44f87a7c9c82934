use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CrosspostConfig;

use super::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub freed_bytes: u64,
    pub kept: usize,
    pub dry_run: bool,
}

/// Removes per-run leftovers: downloads and derived media under `work_dir`
/// and failure captures under `captures_dir`. An entry's age is taken from the
/// newest file inside it, so a run that is still writing is never swept.
#[derive(Debug, Clone)]
pub struct WorkspaceJanitor {
    roots: Vec<PathBuf>,
    ttl: Duration,
    dry_run: bool,
}

impl WorkspaceJanitor {
    pub fn new(roots: Vec<PathBuf>, ttl: Duration) -> Self {
        Self {
            roots,
            ttl,
            dry_run: false,
        }
    }

    /// `None` when the config disables the sweep.
    pub fn from_config(config: &CrosspostConfig) -> Option<Self> {
        let ttl = config.pipeline.workspace_ttl()?;
        Some(Self::new(vec![config.work_dir(), config.captures_dir()], ttl))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn sweep(&self) -> PipelineResult<SweepReport> {
        self.sweep_at(SystemTime::now())
    }

    pub fn sweep_at(&self, now: SystemTime) -> PipelineResult<SweepReport> {
        let mut report = SweepReport {
            dry_run: self.dry_run,
            ..SweepReport::default()
        };
        for root in &self.roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(root = %root.display(), "nothing to sweep");
                    continue;
                }
                Err(source) => {
                    return Err(PipelineError::WorkDir {
                        source,
                        path: root.clone(),
                    })
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let (newest, size) = footprint(&path);
                let age = newest
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or(Duration::ZERO);
                if age <= self.ttl {
                    report.kept += 1;
                    continue;
                }
                if !self.dry_run {
                    let removed = if path.is_dir() {
                        std::fs::remove_dir_all(&path)
                    } else {
                        std::fs::remove_file(&path)
                    };
                    if let Err(err) = removed {
                        warn!(path = %path.display(), error = %err, "failed to remove expired run data");
                        report.kept += 1;
                        continue;
                    }
                }
                report.freed_bytes += size;
                report.removed.push(path);
            }
        }
        info!(
            removed = report.removed.len(),
            kept = report.kept,
            freed_mb = report.freed_bytes / (1024 * 1024),
            dry_run = self.dry_run,
            "workspace sweep finished"
        );
        Ok(report)
    }
}

/// Newest modification time and total size of everything under `path`.
fn footprint(path: &Path) -> (Option<SystemTime>, u64) {
    let mut newest = None;
    let mut size = 0;
    for entry in WalkDir::new(path).into_iter().flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_file() {
            size += metadata.len();
        }
        if let Ok(modified) = metadata.modified() {
            newest = Some(newest.map_or(modified, |current: SystemTime| current.max(modified)));
        }
    }
    (newest, size)
}
