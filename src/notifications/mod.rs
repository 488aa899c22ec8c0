//! Notification preferences, push tokens, and the unread badge.

use async_trait::async_trait;
use tracing::warn;

use crate::error::ApiError;
use crate::models::{NotificationPreference, PreferenceKey};

pub mod preferences;
pub mod push;

pub use preferences::PreferenceManager;
pub use push::{DisabledPushProvider, PushProvider, PushTokenManager};

/// Backend endpoints the notification managers talk to.
#[async_trait]
pub trait NotificationBackend: Send + Sync {
    async fn register_push_token(&self, device_id: &str, token: &str) -> Result<(), ApiError>;
    /// A token the backend no longer knows counts as success.
    async fn unregister_push_token(&self, device_id: &str, token: &str) -> Result<(), ApiError>;
    async fn fetch_preferences(&self) -> Result<NotificationPreference, ApiError>;
    async fn update_preference(&self, key: PreferenceKey, value: bool) -> Result<(), ApiError>;
    async fn unread_count(&self) -> Result<u64, ApiError>;
}

/// Unread notification count for the badge. Any failure shows as zero.
pub async fn poll_unread_count(backend: &dyn NotificationBackend) -> u64 {
    match backend.unread_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "failed to fetch unread notification count");
            0
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory backend that records calls and can be told to fail.
    #[derive(Default)]
    pub struct FakeBackend {
        pub registered: Mutex<Vec<(String, String)>>,
        pub unregistered: Mutex<Vec<(String, String)>>,
        pub remote: Mutex<NotificationPreference>,
        pub fail_updates: Mutex<bool>,
        pub fail_unregister: Mutex<bool>,
        pub unread: Mutex<Option<u64>>,
    }

    impl FakeBackend {
        pub fn set_fail_updates(&self, fail: bool) {
            *self.fail_updates.lock().unwrap() = fail;
        }

        pub fn registrations(&self) -> Vec<(String, String)> {
            self.registered.lock().unwrap().clone()
        }

        pub fn unregistrations(&self) -> Vec<(String, String)> {
            self.unregistered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationBackend for FakeBackend {
        async fn register_push_token(&self, device_id: &str, token: &str) -> Result<(), ApiError> {
            self.registered
                .lock()
                .unwrap()
                .push((device_id.to_string(), token.to_string()));
            Ok(())
        }

        async fn unregister_push_token(&self, device_id: &str, token: &str) -> Result<(), ApiError> {
            if *self.fail_unregister.lock().unwrap() {
                return Err(ApiError::Network("unreachable".into()));
            }
            self.unregistered
                .lock()
                .unwrap()
                .push((device_id.to_string(), token.to_string()));
            Ok(())
        }

        async fn fetch_preferences(&self) -> Result<NotificationPreference, ApiError> {
            Ok(self.remote.lock().unwrap().clone())
        }

        async fn update_preference(&self, key: PreferenceKey, value: bool) -> Result<(), ApiError> {
            if *self.fail_updates.lock().unwrap() {
                return Err(ApiError::Server {
                    status: 503,
                    message: "maintenance".into(),
                });
            }
            self.remote.lock().unwrap().set(key, value);
            Ok(())
        }

        async fn unread_count(&self) -> Result<u64, ApiError> {
            self.unread
                .lock()
                .unwrap()
                .ok_or_else(|| ApiError::Network("unreachable".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBackend;
    use super::*;

    #[tokio::test]
    async fn test_unread_count_degrades_to_zero() {
        let backend = FakeBackend::default();
        assert_eq!(poll_unread_count(&backend).await, 0);

        *backend.unread.lock().unwrap() = Some(7);
        assert_eq!(poll_unread_count(&backend).await, 7);
    }
}
