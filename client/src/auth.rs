//! Authentication context shared by everything that talks to the API.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use uuid::Uuid;

use crate::constants::TOKEN_REFRESH_SKEW_MS;
use crate::storage::{data_directory, JsonFile};
use crate::utils::current_unix_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix milliseconds
    pub expires_at_ms: u64,
}

impl TokenPair {
    pub fn from_lifetime(access_token: String, refresh_token: String, expires_in_secs: u64) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at_ms: current_unix_millis() + expires_in_secs * 1000,
        }
    }

    /// Expired, or close enough to expiry that it should be refreshed first
    pub fn is_stale_at(&self, now_ms: u64) -> bool {
        now_ms + TOKEN_REFRESH_SKEW_MS >= self.expires_at_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: Uuid,
    pub display_name: String,
}

/// Where tokens survive between runs
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<TokenPair>;
    fn save(&self, tokens: &TokenPair) -> anyhow::Result<()>;
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<Option<TokenPair>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<TokenPair> {
        self.tokens.lock().clone()
    }

    fn save(&self, tokens: &TokenPair) -> anyhow::Result<()> {
        *self.tokens.lock() = Some(tokens.clone());
        Ok(())
    }

    fn clear(&self) {
        *self.tokens.lock() = None;
    }
}

pub struct FileTokenStore {
    file: JsonFile<TokenPair>,
}

impl FileTokenStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::open(path),
        }
    }

    pub fn default_location() -> Self {
        Self::open(data_directory().join("tokens.json"))
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<TokenPair> {
        self.file.load()
    }

    fn save(&self, tokens: &TokenPair) -> anyhow::Result<()> {
        self.file.save(tokens)
    }

    fn clear(&self) {
        self.file.clear()
    }
}

/// Current credentials plus the lock that keeps refreshes single-flight.
pub struct AuthContext {
    store: Arc<dyn TokenStore>,
    tokens: RwLock<Option<TokenPair>>,
    profile: RwLock<Option<UserProfile>>,
    refresh_lock: AsyncMutex<()>,
}

impl AuthContext {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        let tokens = store.load();
        Self {
            store,
            tokens: RwLock::new(tokens),
            profile: RwLock::new(None),
            refresh_lock: AsyncMutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTokenStore::default()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.read().is_some()
    }

    pub fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.refresh_token.clone())
    }

    pub fn needs_refresh(&self) -> bool {
        self.tokens
            .read()
            .as_ref()
            .is_some_and(|t| t.is_stale_at(current_unix_millis()))
    }

    /// Replace the credentials; persisting is best effort.
    pub fn set_tokens(&self, tokens: TokenPair) {
        if let Err(e) = self.store.save(&tokens) {
            tracing::warn!("Failed to persist tokens: {:#}", e);
        }
        *self.tokens.write() = Some(tokens);
    }

    pub fn clear(&self) {
        self.store.clear();
        *self.tokens.write() = None;
        *self.profile.write() = None;
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.profile.read().clone()
    }

    pub fn set_profile(&self, profile: UserProfile) {
        *self.profile.write() = Some(profile);
    }

    /// Held for the duration of a refresh so concurrent callers wait for it
    pub async fn refresh_guard(&self) -> MutexGuard<'_, ()> {
        self.refresh_lock.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(access: &str, expires_at_ms: u64) -> TokenPair {
        TokenPair {
            access_token: access.into(),
            refresh_token: format!("{access}-refresh"),
            expires_at_ms,
        }
    }

    #[test]
    fn staleness_includes_skew() {
        let tokens = pair("a", 100_000);
        assert!(!tokens.is_stale_at(100_000 - TOKEN_REFRESH_SKEW_MS - 1));
        assert!(tokens.is_stale_at(100_000 - TOKEN_REFRESH_SKEW_MS));
        assert!(tokens.is_stale_at(200_000));
    }

    #[test]
    fn context_loads_and_persists_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let auth = AuthContext::new(Arc::new(FileTokenStore::open(&path)));
        assert!(!auth.is_authenticated());
        auth.set_tokens(pair("first", u64::MAX / 2));

        let reloaded = AuthContext::new(Arc::new(FileTokenStore::open(&path)));
        assert_eq!(reloaded.access_token().as_deref(), Some("first"));
        assert_eq!(reloaded.refresh_token().as_deref(), Some("first-refresh"));
        assert!(!reloaded.needs_refresh());

        reloaded.clear();
        assert!(!reloaded.is_authenticated());
        assert!(!path.exists());
    }

    #[test]
    fn expired_tokens_need_refresh() {
        let auth = AuthContext::in_memory();
        auth.set_tokens(pair("old", 1));
        assert!(auth.needs_refresh());
    }
}
