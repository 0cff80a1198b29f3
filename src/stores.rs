// =============================================================================
// External store abstractions — correlation persistence and token storage
// =============================================================================
//
// The SQL layer behind these lives outside the core. The traits here are the
// seams the actors call through; the bundled implementations are an
// in-memory correlation store (wiring and tests) and a JSON-file token store
// with a write-ahead recovery copy.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::correlation::Correlation;
use crate::oauth::OAuthToken;

// ---------------------------------------------------------------------------
// Correlation Store
// ---------------------------------------------------------------------------

/// Persistence seam for the correlation engine. Calls are made off the hot
/// path and wrapped in retry + circuit breaker by the caller.
pub trait CorrelationStore: Send + Sync + 'static {
    /// Open a recording session; returns its id.
    fn start_session(&self) -> impl Future<Output = Result<String>> + Send;

    /// Close a session previously opened with `start_session`.
    fn end_session(&self, session_id: String) -> impl Future<Output = Result<()>> + Send;

    /// Persist one correlation (with whatever session id it carries).
    fn store(&self, correlation: Correlation) -> impl Future<Output = Result<()>> + Send;
}

/// In-memory correlation store used in tests and store-less deployments.
#[derive(Default)]
pub struct MemoryCorrelationStore {
    session_counter: AtomicU64,
    rows: Mutex<Vec<Correlation>>,
    open_sessions: Mutex<Vec<String>>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored(&self) -> Vec<Correlation> {
        self.rows.lock().clone()
    }

    pub fn open_session_count(&self) -> usize {
        self.open_sessions.lock().len()
    }
}

impl CorrelationStore for MemoryCorrelationStore {
    fn start_session(&self) -> impl Future<Output = Result<String>> + Send {
        let n = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("session-{n}");
        self.open_sessions.lock().push(id.clone());
        async move { Ok(id) }
    }

    fn end_session(&self, session_id: String) -> impl Future<Output = Result<()>> + Send {
        self.open_sessions.lock().retain(|s| *s != session_id);
        async move { Ok(()) }
    }

    fn store(&self, correlation: Correlation) -> impl Future<Output = Result<()>> + Send {
        self.rows.lock().push(correlation);
        async move { Ok(()) }
    }
}

// ---------------------------------------------------------------------------
// OAuth Token Store
// ---------------------------------------------------------------------------

/// Durable storage for OAuth tokens, keyed by service name.
///
/// `save_token` must be called *before* the in-memory record is replaced so
/// a crash never forgets a token that was already live (write-ahead).
pub trait TokenStore: Send + Sync + 'static {
    fn get_token(&self, service: &str) -> Result<Option<OAuthToken>>;
    fn save_token(&self, service: &str, token: &OAuthToken) -> Result<()>;
}

/// In-memory token store for tests.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, OAuthToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get_token(&self, service: &str) -> Result<Option<OAuthToken>> {
        Ok(self.tokens.lock().get(service).cloned())
    }

    fn save_token(&self, service: &str, token: &OAuthToken) -> Result<()> {
        self.tokens.lock().insert(service.to_string(), token.clone());
        Ok(())
    }
}

/// JSON-file token store.
///
/// Layout: one JSON object mapping service name → token at `path`, plus a
/// `.bak` sibling written first on every save. Startup reads the primary and
/// falls back to the recovery copy when the primary is missing or corrupt.
pub struct FileTokenStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, OAuthToken>>,
}

impl FileTokenStore {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let cache = match Self::read_map(&path) {
            Ok(map) => map,
            Err(primary_err) => {
                let backup = Self::backup_path(&path);
                match Self::read_map(&backup) {
                    Ok(map) => {
                        warn!(
                            path = %path.display(),
                            error = %primary_err,
                            "primary token store unreadable — recovered from backup copy"
                        );
                        map
                    }
                    Err(_) => {
                        info!(path = %path.display(), "no token store on disk — starting empty");
                        HashMap::new()
                    }
                }
            }
        };

        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".bak");
        PathBuf::from(p)
    }

    fn read_map(path: &Path) -> Result<HashMap<String, OAuthToken>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read token store at {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse token store at {}", path.display()))
    }

    fn write_map(&self, map: &HashMap<String, OAuthToken>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(map).context("failed to serialise token store")?;

        // Recovery copy first, then atomic tmp + rename for the primary. A
        // crash between the two leaves the new record readable from the
        // backup.
        let backup = Self::backup_path(&self.path);
        std::fs::write(&backup, &content)
            .with_context(|| format!("failed to write token backup to {}", backup.display()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp token store to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to rename tmp token store to {}", self.path.display())
        })?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get_token(&self, service: &str) -> Result<Option<OAuthToken>> {
        Ok(self.cache.lock().get(service).cloned())
    }

    fn save_token(&self, service: &str, token: &OAuthToken) -> Result<()> {
        let mut cache = self.cache.lock();
        let mut next = cache.clone();
        next.insert(service.to_string(), token.clone());
        // Disk write happens before the cache mutation becomes visible.
        self.write_map(&next)?;
        *cache = next;
        info!(service, path = %self.path.display(), "token persisted");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlation::CorrelationPattern;

    fn sample_correlation(id: &str) -> Correlation {
        Correlation {
            id: id.to_string(),
            transcription_id: "t1".into(),
            transcription_text: "hello".into(),
            chat_message_id: "c1".into(),
            chat_user: "u".into(),
            chat_text: "hello lol".into(),
            pattern: CorrelationPattern::DirectQuote,
            confidence: 0.9,
            time_offset_ms: 4500,
            timestamp_ms: 1000,
            session_id: None,
        }
    }

    fn sample_token(access: &str) -> OAuthToken {
        OAuthToken {
            access_token: access.to_string(),
            refresh_token: Some("refresh".into()),
            expires_at_ms: Some(9_999_999),
            scopes: Some(vec!["chat:read".into()]),
            user_id: None,
            client_id: "client".into(),
        }
    }

    #[tokio::test]
    async fn memory_store_sessions_and_rows() {
        let store = MemoryCorrelationStore::new();
        let sid = store.start_session().await.unwrap();
        assert_eq!(store.open_session_count(), 1);

        store.store(sample_correlation("a")).await.unwrap();
        store.store(sample_correlation("b")).await.unwrap();
        assert_eq!(store.stored().len(), 2);

        store.end_session(sid).await.unwrap();
        assert_eq!(store.open_session_count(), 0);
    }

    #[test]
    fn file_store_round_trips() {
        let dir = std::env::temp_dir().join(format!("lumen-tokens-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.json");

        let store = FileTokenStore::open(&path);
        assert!(store.get_token("twitch").unwrap().is_none());

        store.save_token("twitch", &sample_token("abc")).unwrap();

        // A fresh instance reads what was written.
        let reopened = FileTokenStore::open(&path);
        let token = reopened.get_token("twitch").unwrap().unwrap();
        assert_eq!(token.access_token, "abc");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_store_recovers_from_backup_when_primary_corrupt() {
        let dir = std::env::temp_dir().join(format!("lumen-tokens-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.json");

        let store = FileTokenStore::open(&path);
        store.save_token("twitch", &sample_token("abc")).unwrap();

        // Corrupt the primary; the .bak sibling still has the record.
        std::fs::write(&path, "{ not json").unwrap();

        let reopened = FileTokenStore::open(&path);
        let token = reopened.get_token("twitch").unwrap().unwrap();
        assert_eq!(token.access_token, "abc");

        std::fs::remove_dir_all(&dir).ok();
    }
}
