use crate::cache::TtlCache;
use crate::error::StoreError;
use crate::session::Session;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

/// How long a fetched session stays in the local fallback cache.
const SESSION_CACHE_TTL: Duration = Duration::from_secs(10);
/// How long a confirmed miss suppresses repeat store lookups.
const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(1);

/// Abstract key→session storage. Implementations must be safe for
/// concurrent use; the Redis-cluster and RPC backends live outside this
/// crate, [`InMemorySessionStore`] ships for tests and standalone mode.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key_hash: &str) -> Result<Option<Session>, StoreError>;
    async fn set(
        &self,
        key_hash: &str,
        session: &Session,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;
    async fn delete(&self, key_hash: &str) -> Result<bool, StoreError>;
}

/// Store-side key hashing. Hashing preserves the on-the-wire key shape for
/// callers while keeping raw tokens out of storage keys; it is delegated to
/// the store layer so every component hashes identically.
#[derive(Debug, Clone)]
pub struct KeyHasher {
    enabled: bool,
}

impl KeyHasher {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// SHA-256 truncated to 64 bits, hex-encoded. Disabled hashing passes
    /// the token through unchanged.
    pub fn hash(&self, token: &str) -> String {
        if !self.enabled {
            return token.to_string();
        }
        let digest = Sha256::digest(token.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// In-memory session store backed by the TTL cache.
pub struct InMemorySessionStore {
    entries: TtlCache<Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            entries: TtlCache::new(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key_hash: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.entries.get(key_hash))
    }

    async fn set(
        &self,
        key_hash: &str,
        session: &Session,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries.set(key_hash, session.clone(), ttl);
        Ok(())
    }

    async fn delete(&self, key_hash: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key_hash))
    }
}

/// Shared front to a [`SessionStore`]: hashing, a local positive cache, and
/// negative caching of misses so hot unknown keys do not hammer the store.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    hasher: KeyHasher,
    local: TtlCache<Session>,
    misses: TtlCache<()>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, hasher: KeyHasher) -> Self {
        Self {
            store,
            hasher,
            local: TtlCache::new(),
            misses: TtlCache::new(),
        }
    }

    pub fn hash(&self, token: &str) -> String {
        self.hasher.hash(token)
    }

    /// Look up the session for a raw token. Returns the key hash alongside
    /// the result so callers can stash it on the request context.
    ///
    /// Store errors bubble up: auth paths need the session, so the caller
    /// converts them into a 5xx rather than treating them as a miss.
    pub async fn session_by_token(
        &self,
        token: &str,
    ) -> Result<(String, Option<Session>), StoreError> {
        let key_hash = self.hash(token);
        let session = self.session_by_hash(&key_hash).await?;
        Ok((key_hash, session))
    }

    /// Look up by a pre-hashed key, consulting the local caches first.
    pub async fn session_by_hash(&self, key_hash: &str) -> Result<Option<Session>, StoreError> {
        if self.misses.get(key_hash).is_some() {
            return Ok(None);
        }
        if let Some(mut cached) = self.local.get(key_hash) {
            cached.key_hash = key_hash.to_string();
            return Ok(Some(cached));
        }
        match self.store.get(key_hash).await? {
            Some(mut session) => {
                session.key_hash = key_hash.to_string();
                self.local
                    .set(key_hash, session.clone(), Some(SESSION_CACHE_TTL));
                Ok(Some(session))
            }
            None => {
                self.misses.set(key_hash, (), Some(NEGATIVE_CACHE_TTL));
                Ok(None)
            }
        }
    }

    /// Write a session under a raw token (hashed store-side). Write-through
    /// to the local cache so in-flight requests see the update.
    pub async fn update_session(
        &self,
        token: &str,
        session: &Session,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key_hash = self.hash(token);
        self.update_session_hashed(&key_hash, session, ttl).await
    }

    pub async fn update_session_hashed(
        &self,
        key_hash: &str,
        session: &Session,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.store.set(key_hash, session, ttl).await?;
        self.local
            .set(key_hash, session.clone(), Some(SESSION_CACHE_TTL));
        self.misses.remove(key_hash);
        Ok(())
    }

    pub async fn remove_session(&self, token: &str) -> Result<bool, StoreError> {
        let key_hash = self.hash(token);
        self.local.remove(&key_hash);
        self.store.delete(&key_hash).await
    }
}

/// OAuth client record as stored by the OAuth manager.
#[derive(Debug, Clone)]
pub struct OauthClient {
    pub client_id: String,
    pub redirect_uri: String,
}

/// Lookup contract for OAuth clients; the real storage lives with the
/// OAuth manager, tests use [`InMemoryOauthStore`].
#[async_trait]
pub trait OauthClientStore: Send + Sync {
    async fn get_client(&self, client_id: &str) -> Result<Option<OauthClient>, StoreError>;
}

pub struct InMemoryOauthStore {
    clients: dashmap::DashMap<String, OauthClient>,
}

impl InMemoryOauthStore {
    pub fn new() -> Self {
        Self {
            clients: dashmap::DashMap::new(),
        }
    }

    pub fn insert(&self, client: OauthClient) {
        self.clients.insert(client.client_id.clone(), client);
    }

    pub fn remove(&self, client_id: &str) {
        self.clients.remove(client_id);
    }
}

impl Default for InMemoryOauthStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OauthClientStore for InMemoryOauthStore {
    async fn get_client(&self, client_id: &str) -> Result<Option<OauthClient>, StoreError> {
        Ok(self.clients.get(client_id).map(|c| c.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_short() {
        let hasher = KeyHasher::new(true);
        let a = hasher.hash("84573485734587384888723487243");
        let b = hasher.hash("84573485734587384888723487243");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, hasher.hash("other"));
    }

    #[test]
    fn disabled_hashing_passes_through() {
        let hasher = KeyHasher::new(false);
        assert_eq!(hasher.hash("raw-token"), "raw-token");
    }

    #[tokio::test]
    async fn manager_round_trips_sessions() {
        let manager = SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            KeyHasher::new(true),
        );
        let session = Session {
            org_id: "default".into(),
            ..Session::default()
        };
        manager
            .update_session("token-1", &session, None)
            .await
            .unwrap();

        let (hash, found) = manager.session_by_token("token-1").await.unwrap();
        let found = found.expect("session should exist");
        assert_eq!(found.org_id, "default");
        assert_eq!(found.key_hash, hash);
    }

    #[tokio::test]
    async fn manager_caches_misses() {
        struct CountingStore {
            inner: InMemorySessionStore,
            gets: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl SessionStore for CountingStore {
            async fn get(&self, key_hash: &str) -> Result<Option<Session>, StoreError> {
                self.gets.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                self.inner.get(key_hash).await
            }
            async fn set(
                &self,
                key_hash: &str,
                session: &Session,
                ttl: Option<Duration>,
            ) -> Result<(), StoreError> {
                self.inner.set(key_hash, session, ttl).await
            }
            async fn delete(&self, key_hash: &str) -> Result<bool, StoreError> {
                self.inner.delete(key_hash).await
            }
        }

        let store = Arc::new(CountingStore {
            inner: InMemorySessionStore::new(),
            gets: std::sync::atomic::AtomicUsize::new(0),
        });
        let manager = SessionManager::new(store.clone(), KeyHasher::new(false));

        assert!(manager.session_by_token("nope").await.unwrap().1.is_none());
        assert!(manager.session_by_token("nope").await.unwrap().1.is_none());
        // Second lookup inside the negative-cache window skips the store.
        assert_eq!(store.gets.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
