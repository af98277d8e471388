//! In-memory mirror of user profiles.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::sequencer::SenderKey;
use crate::store::{StateStore, UserProfile};

/// Default number of profiles mirrored before the stalest is evicted.
pub const DEFAULT_PROFILE_CAPACITY: usize = 10_000;

/// Read-through copy of profiles seen by this process. Never authoritative:
/// the store wins, and a missing entry only means "not seen yet". Holds at
/// most `capacity` entries; a new key evicts the least recently updated one.
pub struct ProfileCache {
    profiles: RwLock<HashMap<SenderKey, UserProfile>>,
    capacity: usize,
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PROFILE_CAPACITY)
    }
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache holding at most `capacity` profiles (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn get(&self, key: &SenderKey) -> Option<UserProfile> {
        self.profiles.read().await.get(key).cloned()
    }

    /// Record `profile` unless the mirror already holds a newer one.
    pub async fn insert(&self, profile: UserProfile) {
        let mut profiles = self.profiles.write().await;
        let newer = profiles
            .get(&profile.key)
            .is_none_or(|cached| profile.updated_at >= cached.updated_at);
        if !newer {
            return;
        }
        if !profiles.contains_key(&profile.key) && profiles.len() >= self.capacity {
            let stalest = profiles
                .values()
                .min_by_key(|p| p.updated_at)
                .map(|p| p.key.clone());
            if let Some(key) = stalest {
                debug!(key = %key, "Profile mirror full; evicting stalest entry");
                profiles.remove(&key);
            }
        }
        profiles.insert(profile.key.clone(), profile);
    }

    pub async fn len(&self) -> usize {
        self.profiles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.profiles.read().await.is_empty()
    }

    /// Best-effort lookup in `store`. A hit updates the mirror; a miss or a
    /// store failure leaves it untouched. Returns whatever the mirror holds
    /// afterwards.
    pub async fn refresh(&self, store: &dyn StateStore, key: &SenderKey) -> Option<UserProfile> {
        match store.get_profile(key).await {
            Ok(Some(profile)) => self.insert(profile).await,
            Ok(None) => debug!(key = %key, "No stored profile"),
            Err(e) => warn!(key = %key, error = %e, "Profile lookup failed; continuing without it"),
        }
        self.get(key).await
    }
}
