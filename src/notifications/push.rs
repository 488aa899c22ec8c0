//! Push token lifecycle.
//!
//! One token per install, registered with the backend under a stable device
//! id. The registered record is persisted so a restart does not re-register
//! the same token.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::NotificationBackend;
use crate::error::PushError;
use crate::events::{AppEvent, EventBus};
use crate::models::{PermissionState, PushMessage, PushToken};
use crate::storage::{KeyValueStore, KEY_DEVICE_ID, KEY_PUSH_TOKEN};

/// Platform push service (browser FCM, OS notification service).
#[async_trait]
pub trait PushProvider: Send + Sync {
    fn permission(&self) -> PermissionState;
    /// Show the permission prompt if needed.
    async fn request_permission(&self) -> Result<PermissionState, PushError>;
    /// Current token, minting one if the provider has none.
    async fn get_token(&self) -> Result<String, PushError>;
    async fn delete_token(&self) -> Result<(), PushError>;
    fn on_message(&self) -> broadcast::Receiver<PushMessage>;
}

/// Provider for hosts without push support. Permission is always denied.
pub struct DisabledPushProvider {
    messages: broadcast::Sender<PushMessage>,
}

impl Default for DisabledPushProvider {
    fn default() -> Self {
        let (messages, _) = broadcast::channel(1);
        Self { messages }
    }
}

#[async_trait]
impl PushProvider for DisabledPushProvider {
    fn permission(&self) -> PermissionState {
        PermissionState::Denied
    }

    async fn request_permission(&self) -> Result<PermissionState, PushError> {
        Ok(PermissionState::Denied)
    }

    async fn get_token(&self) -> Result<String, PushError> {
        Err(PushError::Provider("push notifications are not available".into()))
    }

    async fn delete_token(&self) -> Result<(), PushError> {
        Ok(())
    }

    fn on_message(&self) -> broadcast::Receiver<PushMessage> {
        self.messages.subscribe()
    }
}

pub struct PushTokenManager {
    provider: Arc<dyn PushProvider>,
    backend: Arc<dyn NotificationBackend>,
    store: Arc<dyn KeyValueStore>,
    events: EventBus,
    foreground: AtomicBool,
    // Serialises request/remove so two prompts cannot register twice.
    lock: tokio::sync::Mutex<()>,
}

impl PushTokenManager {
    pub fn new(
        provider: Arc<dyn PushProvider>,
        backend: Arc<dyn NotificationBackend>,
        store: Arc<dyn KeyValueStore>,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            backend,
            store,
            events,
            foreground: AtomicBool::new(true),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Stable id for this install, created on first use.
    pub fn device_id(&self) -> Result<String, PushError> {
        if let Some(id) = self.store.get(KEY_DEVICE_ID)? {
            if !id.trim().is_empty() {
                return Ok(id);
            }
        }
        let id = Uuid::new_v4().to_string();
        self.store.set(KEY_DEVICE_ID, &id)?;
        info!(device_id = %id, "generated device id");
        Ok(id)
    }

    /// Token registered for this device, if any.
    pub fn current_token(&self) -> Result<Option<PushToken>, PushError> {
        let Some(raw) = self.store.get(KEY_PUSH_TOKEN)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(error = %e, "discarding unreadable push token record");
                self.store.remove(KEY_PUSH_TOKEN)?;
                Ok(None)
            }
        }
    }

    /// Ask for permission and register the resulting token.
    ///
    /// Returns `None` when the user declines. Asking again with the same
    /// provider token does not register it a second time.
    pub async fn request_permission(&self) -> Result<Option<PushToken>, PushError> {
        let _guard = self.lock.lock().await;

        let state = self.provider.request_permission().await?;
        if state != PermissionState::Granted {
            info!(?state, "push permission not granted");
            self.events
                .emit(AppEvent::PushPermissionChanged { granted: false });
            return Ok(None);
        }
        self.events
            .emit(AppEvent::PushPermissionChanged { granted: true });

        let device_id = self.device_id()?;
        let token = self.provider.get_token().await?;
        let existing = self.current_token()?;

        if let Some(existing) = existing {
            if existing.token == token && existing.device_id == device_id {
                debug!(device_id = %device_id, "push token already registered");
                return Ok(Some(existing));
            }
            info!(device_id = %device_id, "push token rotated, unregistering the old one");
            if let Err(e) = self
                .backend
                .unregister_push_token(&existing.device_id, &existing.token)
                .await
            {
                warn!(error = %e, "failed to unregister rotated push token");
            }
        }

        self.backend.register_push_token(&device_id, &token).await?;
        let record = PushToken {
            token,
            device_id,
            registered_at: Utc::now(),
        };
        self.store
            .set(KEY_PUSH_TOKEN, &serde_json::to_string(&record)?)?;
        info!(device_id = %record.device_id, "push token registered");
        Ok(Some(record))
    }

    /// Unregister and forget the token (logout, opt-out).
    ///
    /// Local state is cleared even when the backend call fails; that error is
    /// returned afterwards.
    pub async fn remove_token(&self) -> Result<(), PushError> {
        let _guard = self.lock.lock().await;

        let backend_result = match self.current_token()? {
            Some(existing) => self
                .backend
                .unregister_push_token(&existing.device_id, &existing.token)
                .await
                .map_err(PushError::from),
            None => Ok(()),
        };
        if let Err(e) = &backend_result {
            warn!(error = %e, "failed to unregister push token from backend");
        }

        if let Err(e) = self.provider.delete_token().await {
            warn!(error = %e, "failed to delete push token at provider");
        }
        self.store.remove(KEY_PUSH_TOKEN)?;
        info!("push token removed");
        backend_result
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    /// Turn a push message into an in-app toast when the app is in front and
    /// allowed to notify. Returns whether a toast was shown.
    pub fn handle_message(&self, message: &PushMessage) -> bool {
        if !self.is_foreground() {
            debug!("app in background, leaving push message to the system");
            return false;
        }
        if self.provider.permission() != PermissionState::Granted {
            return false;
        }
        self.events.emit(AppEvent::Toast {
            title: message.title.clone(),
            body: message.body.clone(),
        });
        true
    }

    pub fn spawn_foreground_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut messages = self.provider.on_message();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.recv() => match message {
                        Ok(message) => {
                            manager.handle_message(&message);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "dropped push messages");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}
