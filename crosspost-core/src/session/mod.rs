mod backend;
mod cipher;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::{CrosspostConfig, SessionBackendKind};
use crate::platform::PlatformId;

pub use backend::{FileBackend, MemoryBackend, SessionBackend};
pub use cipher::SessionCipher;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("session serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("session key error: {0}")]
    Key(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityState {
    Valid,
    Stale,
    Corrupt,
    Absent,
}

impl ValidityState {
    /// Corrupt and absent records both send the agent through re-authentication.
    pub fn needs_reauth(&self) -> bool {
        !matches!(self, ValidityState::Valid)
    }
}

impl fmt::Display for ValidityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValidityState::Valid => "valid",
            ValidityState::Stale => "stale",
            ValidityState::Corrupt => "corrupt",
            ValidityState::Absent => "absent",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Seconds since the epoch; `None` for session cookies.
    #[serde(default, alias = "expirationDate")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, alias = "httpOnly")]
    pub http_only: bool,
}

fn default_cookie_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires {
            Some(expires) if expires > 0.0 => expires < now.timestamp() as f64,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthState {
    Cookies {
        cookies: Vec<StoredCookie>,
    },
    Token {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedSession {
    platform: PlatformId,
    captured_at: DateTime<Utc>,
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    rejections: u32,
    auth: AuthState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub platform: PlatformId,
    pub auth: Option<AuthState>,
    pub captured_at: Option<DateTime<Utc>>,
    pub validity: ValidityState,
}

impl SessionRecord {
    fn without_state(platform: PlatformId, validity: ValidityState) -> Self {
        Self {
            platform,
            auth: None,
            captured_at: None,
            validity,
        }
    }

    pub fn cookies(&self) -> &[StoredCookie] {
        match &self.auth {
            Some(AuthState::Cookies { cookies }) => cookies,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleOutcome {
    /// Marked stale; carries the consecutive rejection count.
    Marked(u32),
    Removed,
    /// No readable record to mark.
    Missing,
}

/// Read-only summary used by the CLI and the health reporter.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub platform: PlatformId,
    pub validity: ValidityState,
    pub captured_at: Option<DateTime<Utc>>,
    pub cookies_total: usize,
    pub cookies_expired: usize,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Platform-scoped authentication state with lazy validity evaluation.
pub struct SessionStore {
    backend: Arc<dyn SessionBackend>,
    cipher: Option<SessionCipher>,
    max_age: Option<ChronoDuration>,
    max_rejections: Option<u32>,
    locks: std::sync::Mutex<HashMap<PlatformId, Arc<AsyncMutex<()>>>>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("backend", &self.backend.describe())
            .field("encrypted", &self.cipher.is_some())
            .field("max_age", &self.max_age)
            .field("max_rejections", &self.max_rejections)
            .finish()
    }
}

impl SessionStore {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self {
            backend,
            cipher: None,
            max_age: None,
            max_rejections: None,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CrosspostConfig) -> SessionResult<Self> {
        let backend: Arc<dyn SessionBackend> = match config.session.backend {
            SessionBackendKind::File => Arc::new(FileBackend::new(config.sessions_dir())),
            SessionBackendKind::Memory => Arc::new(MemoryBackend::new()),
        };
        let mut store = Self::new(backend);
        if let Some(var) = &config.session.encryption_key_env {
            store = store.with_cipher(SessionCipher::from_env(var)?);
        }
        if let Some(hours) = config.session.max_age_hours {
            store = store.with_max_age(ChronoDuration::hours(hours as i64));
        }
        if config.session.max_rejections > 0 {
            store = store.with_max_rejections(config.session.max_rejections);
        }
        Ok(store)
    }

    pub fn with_cipher(mut self, cipher: SessionCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn with_max_age(mut self, max_age: ChronoDuration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_max_rejections(mut self, limit: u32) -> Self {
        self.max_rejections = Some(limit.max(1));
        self
    }

    pub fn backend_description(&self) -> String {
        self.backend.describe()
    }

    /// Never fails: unreadable or malformed state surfaces as `Corrupt`.
    pub async fn load(&self, platform: PlatformId) -> SessionRecord {
        match self.read_persisted(platform).await {
            Ok(Some(persisted)) => self.evaluate(persisted, Utc::now()),
            Ok(None) => SessionRecord::without_state(platform, ValidityState::Absent),
            Err(reason) => {
                warn!(%platform, %reason, "session record is corrupt");
                SessionRecord::without_state(platform, ValidityState::Corrupt)
            }
        }
    }

    pub async fn save(&self, platform: PlatformId, auth: AuthState) -> SessionResult<SessionRecord> {
        let lock = self.lock_for(platform);
        let _guard = lock.lock().await;
        let persisted = PersistedSession {
            platform,
            captured_at: Utc::now(),
            stale: false,
            rejections: 0,
            auth,
        };
        self.write_persisted(&persisted).await?;
        info!(%platform, "session saved");
        Ok(self.evaluate(persisted, Utc::now()))
    }

    /// Records a rejection of the stored state. Only an explicit `save` makes
    /// the record valid again; once the rejection limit is reached the record
    /// is deleted outright.
    pub async fn mark_stale(&self, platform: PlatformId) -> SessionResult<StaleOutcome> {
        let lock = self.lock_for(platform);
        let _guard = lock.lock().await;
        match self.read_persisted(platform).await {
            Ok(Some(mut persisted)) => {
                persisted.stale = true;
                persisted.rejections = persisted.rejections.saturating_add(1);
                if let Some(limit) = self.max_rejections.filter(|limit| persisted.rejections >= *limit) {
                    self.backend.remove(platform).await?;
                    warn!(%platform, rejections = persisted.rejections, limit, "session removed after repeated rejections");
                    return Ok(StaleOutcome::Removed);
                }
                self.write_persisted(&persisted).await?;
                info!(%platform, rejections = persisted.rejections, "session marked stale");
                Ok(StaleOutcome::Marked(persisted.rejections))
            }
            Ok(None) => {
                debug!(%platform, "nothing to mark stale");
                Ok(StaleOutcome::Missing)
            }
            Err(reason) => {
                debug!(%platform, %reason, "corrupt session left for re-auth");
                Ok(StaleOutcome::Missing)
            }
        }
    }

    pub async fn invalidate(&self, platform: PlatformId) -> SessionResult<()> {
        let lock = self.lock_for(platform);
        let _guard = lock.lock().await;
        self.backend.remove(platform).await?;
        info!(%platform, "session invalidated");
        Ok(())
    }

    pub async fn status(&self, platform: PlatformId) -> SessionStatus {
        let record = self.load(platform).await;
        let now = Utc::now();
        let (cookies_total, cookies_expired, token_expires_at) = match &record.auth {
            Some(AuthState::Cookies { cookies }) => (
                cookies.len(),
                cookies.iter().filter(|c| c.is_expired(now)).count(),
                None,
            ),
            Some(AuthState::Token { expires_at, .. }) => (0, 0, *expires_at),
            None => (0, 0, None),
        };
        SessionStatus {
            platform,
            validity: record.validity,
            captured_at: record.captured_at,
            cookies_total,
            cookies_expired,
            token_expires_at,
        }
    }

    fn lock_for(&self, platform: PlatformId) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(platform).or_default())
    }

    async fn read_persisted(&self, platform: PlatformId) -> Result<Option<PersistedSession>, String> {
        let Some(bytes) = self.backend.read(platform).await.map_err(|e| e.to_string())? else {
            return Ok(None);
        };
        let plaintext = match &self.cipher {
            Some(cipher) => cipher
                .open(&bytes)
                .ok_or_else(|| "record does not decrypt under the configured key".to_string())?,
            None => bytes,
        };
        let persisted: PersistedSession =
            serde_json::from_slice(&plaintext).map_err(|e| e.to_string())?;
        if persisted.platform != platform {
            return Err(format!("record belongs to {}", persisted.platform));
        }
        Ok(Some(persisted))
    }

    async fn write_persisted(&self, persisted: &PersistedSession) -> SessionResult<()> {
        let plaintext = serde_json::to_vec_pretty(persisted)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.seal(&plaintext)?,
            None => plaintext,
        };
        self.backend.write(persisted.platform, &bytes).await
    }

    fn evaluate(&self, persisted: PersistedSession, now: DateTime<Utc>) -> SessionRecord {
        let expired_by_age = self
            .max_age
            .map(|max_age| now - persisted.captured_at > max_age)
            .unwrap_or(false);
        let credentials_lapsed = match &persisted.auth {
            AuthState::Cookies { cookies } => {
                cookies.is_empty() || cookies.iter().all(|cookie| cookie.is_expired(now))
            }
            AuthState::Token {
                refresh_token,
                expires_at,
                ..
            } => refresh_token.is_none() && expires_at.map(|at| at <= now).unwrap_or(false),
        };
        let validity = if persisted.stale || expired_by_age || credentials_lapsed {
            ValidityState::Stale
        } else {
            ValidityState::Valid
        };
        SessionRecord {
            platform: persisted.platform,
            auth: Some(persisted.auth),
            captured_at: Some(persisted.captured_at),
            validity,
        }
    }
}
