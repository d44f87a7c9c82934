use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::platform::PlatformId;

use super::{SessionError, SessionResult};

/// Raw byte storage for one serialized record per platform.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn read(&self, platform: PlatformId) -> SessionResult<Option<Vec<u8>>>;
    async fn write(&self, platform: PlatformId, bytes: &[u8]) -> SessionResult<()>;
    async fn remove(&self, platform: PlatformId) -> SessionResult<()>;
    fn describe(&self) -> String;
}

/// One JSON (or sealed) file per platform under a directory.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, platform: PlatformId) -> PathBuf {
        self.dir.join(format!("{platform}.json"))
    }
}

#[async_trait]
impl SessionBackend for FileBackend {
    async fn read(&self, platform: PlatformId) -> SessionResult<Option<Vec<u8>>> {
        let path = self.path_for(platform);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SessionError::Io { source, path }),
        }
    }

    async fn write(&self, platform: PlatformId, bytes: &[u8]) -> SessionResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SessionError::Io {
                source,
                path: self.dir.clone(),
            })?;
        let path = self.path_for(platform);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|source| SessionError::Io {
                source,
                path: staging.clone(),
            })?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|source| SessionError::Io { source, path })
    }

    async fn remove(&self, platform: PlatformId) -> SessionResult<()> {
        let path = self.path_for(platform);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SessionError::Io { source, path }),
        }
    }

    fn describe(&self) -> String {
        format!("file:{}", self.dir.display())
    }
}

/// Process-local storage for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<PlatformId, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    async fn read(&self, platform: PlatformId) -> SessionResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(&platform).cloned())
    }

    async fn write(&self, platform: PlatformId, bytes: &[u8]) -> SessionResult<()> {
        self.entries.lock().await.insert(platform, bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, platform: PlatformId) -> SessionResult<()> {
        self.entries.lock().await.remove(&platform);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
