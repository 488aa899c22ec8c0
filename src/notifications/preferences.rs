//! Notification preferences with optimistic updates.
//!
//! The cached record is persisted as `{ "version": n, "preferences": {...} }`.
//! A record with an unknown version is dropped and the defaults are used
//! until the next refresh.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::NotificationBackend;
use crate::error::{PushError, StoreError};
use crate::models::{NotificationPreference, PreferenceKey};
use crate::optimistic::with_optimistic_update;
use crate::storage::{KeyValueStore, KEY_NOTIFICATION_PREFERENCES};

pub const PREFERENCES_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPreferences {
    version: u32,
    preferences: NotificationPreference,
}

pub struct PreferenceManager {
    backend: Arc<dyn NotificationBackend>,
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<NotificationPreference>,
    // One update in flight at a time so rollbacks cannot interleave.
    update_lock: tokio::sync::Mutex<()>,
}

impl PreferenceManager {
    /// Load the persisted preferences, falling back to defaults.
    pub fn new(backend: Arc<dyn NotificationBackend>, store: Arc<dyn KeyValueStore>) -> Self {
        let cached = load(store.as_ref());
        Self {
            backend,
            store,
            cache: Mutex::new(cached),
            update_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn current(&self) -> NotificationPreference {
        self.cache
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Pull the backend copy into the cache. On failure the cache is kept.
    pub async fn refresh(&self) -> Result<NotificationPreference, PushError> {
        let _guard = self.update_lock.lock().await;
        match self.backend.fetch_preferences().await {
            Ok(remote) => {
                self.replace(remote.clone())?;
                debug!("notification preferences refreshed");
                Ok(remote)
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh notification preferences, keeping cached copy");
                Err(e.into())
            }
        }
    }

    /// Flip one switch locally, send it, and roll back if the backend refuses.
    pub async fn update_preference(
        &self,
        key: PreferenceKey,
        value: bool,
    ) -> Result<NotificationPreference, PushError> {
        let _guard = self.update_lock.lock().await;

        with_optimistic_update(
            || self.swap(key, value),
            |previous| {
                self.swap(key, previous);
                info!(key = key.as_str(), "preference update failed, rolled back");
            },
            self.backend.update_preference(key, value),
        )
        .await?;

        let updated = self.current();
        save(self.store.as_ref(), &updated)?;
        info!(key = key.as_str(), value, "notification preference updated");
        Ok(updated)
    }

    fn swap(&self, key: PreferenceKey, value: bool) -> bool {
        match self.cache.lock() {
            Ok(mut cache) => {
                let previous = cache.get(key);
                cache.set(key, value);
                previous
            }
            Err(_) => value,
        }
    }

    fn replace(&self, preferences: NotificationPreference) -> Result<(), StoreError> {
        save(self.store.as_ref(), &preferences)?;
        let mut cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
        *cache = preferences;
        Ok(())
    }
}

fn load(store: &dyn KeyValueStore) -> NotificationPreference {
    let raw = match store.get(KEY_NOTIFICATION_PREFERENCES) {
        Ok(Some(raw)) => raw,
        Ok(None) => return NotificationPreference::default(),
        Err(e) => {
            warn!(error = %e, "failed to read cached notification preferences");
            return NotificationPreference::default();
        }
    };
    match serde_json::from_str::<PersistedPreferences>(&raw) {
        Ok(record) if record.version == PREFERENCES_SCHEMA_VERSION => record.preferences,
        Ok(record) => {
            warn!(
                found = record.version,
                expected = PREFERENCES_SCHEMA_VERSION,
                "cached notification preferences have an unknown version, using defaults"
            );
            NotificationPreference::default()
        }
        Err(e) => {
            warn!(error = %e, "cached notification preferences are unreadable, using defaults");
            NotificationPreference::default()
        }
    }
}

fn save(store: &dyn KeyValueStore, preferences: &NotificationPreference) -> Result<(), StoreError> {
    let record = PersistedPreferences {
        version: PREFERENCES_SCHEMA_VERSION,
        preferences: preferences.clone(),
    };
    let raw = serde_json::to_string(&record)
        .map_err(|e| StoreError::Corrupt {
            id: KEY_NOTIFICATION_PREFERENCES.to_string(),
            reason: e.to_string(),
        })?;
    store.set(KEY_NOTIFICATION_PREFERENCES, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::notifications::testing::FakeBackend;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn manager() -> (PreferenceManager, Arc<FakeBackend>, Arc<MemoryStore>) {
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryStore::new());
        let manager = PreferenceManager::new(backend.clone(), store.clone());
        (manager, backend, store)
    }

    #[tokio::test]
    async fn test_failed_update_rolls_back_every_key() {
        let (manager, backend, _) = manager();
        backend.set_fail_updates(true);

        for key in PreferenceKey::ALL {
            let before = manager.current();
            let result = manager.update_preference(key, !before.get(key)).await;

            assert!(matches!(
                result,
                Err(PushError::Api(ApiError::Server { status: 503, .. }))
            ));
            assert_eq!(manager.current(), before, "{} not rolled back", key.as_str());
        }
    }

    #[tokio::test]
    async fn test_successful_update_is_persisted() {
        let (manager, backend, store) = manager();

        let updated = manager
            .update_preference(PreferenceKey::Whatsapp, false)
            .await
            .unwrap();

        assert!(!updated.whatsapp);
        assert!(!backend.remote.lock().unwrap().whatsapp);

        let reloaded = PreferenceManager::new(backend.clone(), store.clone());
        assert!(!reloaded.current().whatsapp);
        assert!(reloaded.current().push);
    }

    #[tokio::test]
    async fn test_unknown_version_resets_to_defaults() {
        let backend = Arc::new(FakeBackend::default());
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                KEY_NOTIFICATION_PREFERENCES,
                &json!({ "version": 99, "preferences": { "push": false } }).to_string(),
            )
            .unwrap();

        let manager = PreferenceManager::new(backend, store);
        assert_eq!(manager.current(), NotificationPreference::default());
    }

    #[tokio::test]
    async fn test_refresh_replaces_cache_and_keeps_it_on_failure() {
        let (manager, backend, _) = manager();
        backend.remote.lock().unwrap().invoice = false;

        let refreshed = manager.refresh().await.unwrap();
        assert!(!refreshed.invoice);
        assert!(!manager.current().invoice);

        struct Down;
        #[async_trait::async_trait]
        impl NotificationBackend for Down {
            async fn register_push_token(&self, _: &str, _: &str) -> Result<(), ApiError> {
                unreachable!()
            }
            async fn unregister_push_token(&self, _: &str, _: &str) -> Result<(), ApiError> {
                unreachable!()
            }
            async fn fetch_preferences(&self) -> Result<NotificationPreference, ApiError> {
                Err(ApiError::Network("offline".into()))
            }
            async fn update_preference(&self, _: PreferenceKey, _: bool) -> Result<(), ApiError> {
                unreachable!()
            }
            async fn unread_count(&self) -> Result<u64, ApiError> {
                unreachable!()
            }
        }

        let store = Arc::new(MemoryStore::new());
        let offline = PreferenceManager::new(Arc::new(Down), store);
        assert!(offline.refresh().await.is_err());
        assert_eq!(offline.current(), NotificationPreference::default());
    }
}
