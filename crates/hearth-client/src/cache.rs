//! Process-wide entity caches with time-to-live freshness.
//!
//! [`EntityCache`] is a keyed map plus the instant each entry was last
//! written. It never evicts: staleness is checked by callers with
//! [`EntityCache::is_fresh`] and a miss simply means "must fetch".
//! [`Caches`] bundles the caches shared by every session and is injected
//! rather than living in a global, so tests get a clean instance each time.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use hearth_shared::{ContainerId, UserId};
use hearth_store::{Backend, MessageRow, Profile};

use crate::containers::ContainerSummary;

/// Cached value plus the time it was written.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

pub struct EntityCache<K, V> {
    entries: Arc<Mutex<HashMap<K, CacheEntry<V>>>>,
}

impl<K, V> Clone for EntityCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K, V> Default for EntityCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> EntityCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.entries.lock().await.get(key).map(|e| e.value.clone())
    }

    /// Value for `key` only if it was written less than `ttl` ago.
    pub async fn get_fresh(&self, key: &K, ttl: Duration) -> Option<V> {
        self.entries
            .lock()
            .await
            .get(key)
            .filter(|e| e.is_fresh(ttl))
            .map(|e| e.value.clone())
    }

    /// Replace the whole entry and restart its freshness window.
    pub async fn set(&self, key: K, value: V) {
        self.entries.lock().await.insert(
            key,
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Replace the value of an existing entry without touching its fetch
    /// time. Used to keep a cached list in step with pushed changes, which
    /// must not make the entry look freshly fetched. No-op on a miss.
    pub async fn replace_value(&self, key: &K, value: V) {
        if let Some(entry) = self.entries.lock().await.get_mut(key) {
            entry.value = value;
        }
    }

    pub async fn is_fresh(&self, key: &K, ttl: Duration) -> bool {
        self.entries
            .lock()
            .await
            .get(key)
            .is_some_and(|e| e.is_fresh(ttl))
    }

    /// Look up several keys at once; misses are absent from the result.
    pub async fn get_many(&self, keys: &[K]) -> HashMap<K, V> {
        let entries = self.entries.lock().await;
        keys.iter()
            .filter_map(|k| entries.get(k).map(|e| (k.clone(), e.value.clone())))
            .collect()
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.remove(key);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Serve a fresh entry, or run `fetch` and cache its result.
    ///
    /// `force` always fetches. A failed fetch leaves the entry untouched.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: K,
        ttl: Duration,
        force: bool,
        fetch: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if !force {
            if let Some(value) = self.get_fresh(&key, ttl).await {
                return Ok(value);
            }
        }
        let value = fetch().await?;
        self.set(key, value.clone()).await;
        Ok(value)
    }
}

/// The caches shared by all sessions of one process.
#[derive(Clone, Default)]
pub struct Caches {
    /// Never expire; only overwritten.
    pub profiles: EntityCache<UserId, Profile>,
    /// Confirmed rows of each container, as last fetched and since patched.
    pub messages: EntityCache<ContainerId, Vec<MessageRow>>,
    /// Conversation list of each user.
    pub conversations: EntityCache<UserId, Vec<ContainerSummary>>,
}

impl Caches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profiles for `ids`, from the cache where present and from `backend`
    /// otherwise. A failed lookup is logged and those ids are simply absent
    /// from the result.
    pub async fn profiles_for(&self, backend: &dyn Backend, ids: &[UserId]) -> HashMap<UserId, Profile> {
        match self.lookup_profiles(backend, ids).await {
            Ok(profiles) => profiles,
            Err(e) => {
                warn!(count = ids.len(), error = %e, "Failed to load profiles");
                self.profiles.get_many(ids).await
            }
        }
    }

    /// Like [`Caches::profiles_for`], but reports a failed store lookup. On
    /// success, an id missing from the result has no profile in the store.
    /// Fetched profiles are cached.
    pub async fn lookup_profiles(
        &self,
        backend: &dyn Backend,
        ids: &[UserId],
    ) -> hearth_store::Result<HashMap<UserId, Profile>> {
        let mut profiles = self.profiles.get_many(ids).await;
        let missing: Vec<UserId> = ids
            .iter()
            .copied()
            .filter(|id| !profiles.contains_key(id))
            .collect();
        if missing.is_empty() {
            return Ok(profiles);
        }

        for profile in backend.select_profiles(&missing).await? {
            self.profiles.set(profile.id, profile.clone()).await;
            profiles.insert(profile.id, profile);
        }
        Ok(profiles)
    }

    pub async fn reset(&self) {
        self.profiles.clear().await;
        self.messages.clear().await;
        self.conversations.clear().await;
    }
}
