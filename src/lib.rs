//! Kost Sync - offline-first core of the kost management dashboard
//!
//! Mutations made while offline (rooms, residents, utilities, invoices,
//! payments, laundry, complaints, expenses, announcements) are saved to a
//! durable local queue and replayed in order once the backend is reachable
//! again. The crate also owns the push token lifecycle and the notification
//! preference cache.
//!
//! [`Kost`] wires the services together; a UI layer holds one and listens on
//! [`Kost::events`].

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod api;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod models;
pub mod notifications;
pub mod optimistic;
pub mod queue;
pub mod storage;
pub mod sync;

pub use api::ApiClient;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, HealthProbe};
pub use error::{ApiError, ConfigError, PushError, StoreError};
pub use events::{AppEvent, EventBus};
pub use models::{
    ActionStatus, ActionType, NewAction, NotificationPreference, Operation, PendingAction,
    PreferenceKey, PushToken, Resource,
};
pub use notifications::{
    poll_unread_count, DisabledPushProvider, NotificationBackend, PreferenceManager, PushProvider,
    PushTokenManager,
};
pub use optimistic::with_optimistic_update;
pub use queue::{PendingActionStore, QueueCounts};
pub use sync::{
    ActionReplayer, DrainReport, FailurePolicy, ReplayOutcome, SubmitOutcome, SyncManager,
    SyncStatus,
};

/// `local_settings` category holding device-scoped notification state.
const NOTIFICATION_SETTINGS_CATEGORY: &str = "notifications";

/// A backend that can replay queued actions, answer health checks and serve
/// the notification endpoints. [`ApiClient`] is the production one.
pub trait KostBackend: ActionReplayer + HealthProbe + NotificationBackend + 'static {}

impl<T> KostBackend for T where T: ActionReplayer + HealthProbe + NotificationBackend + 'static {}

/// The wired-up service graph.
pub struct Kost {
    pub config: SyncConfig,
    pub events: EventBus,
    pub db: Arc<db::DbState>,
    pub queue: Arc<PendingActionStore>,
    pub connectivity: Arc<ConnectivityMonitor>,
    pub sync: Arc<SyncManager>,
    pub push: Arc<PushTokenManager>,
    pub preferences: Arc<PreferenceManager>,
    backend: Arc<dyn NotificationBackend>,
    probe: Arc<dyn HealthProbe>,
}

impl Kost {
    /// Open the database under `config.data_dir` and wire every service.
    pub fn open<B: KostBackend>(
        config: SyncConfig,
        backend: Arc<B>,
        provider: Arc<dyn PushProvider>,
    ) -> Result<Self, StoreError> {
        let db = Arc::new(db::init(&config.data_dir)?);
        Ok(Self::with_db(config, db, backend, provider))
    }

    pub fn with_db<B: KostBackend>(
        config: SyncConfig,
        db: Arc<db::DbState>,
        backend: Arc<B>,
        provider: Arc<dyn PushProvider>,
    ) -> Self {
        let events = EventBus::default();
        let queue = Arc::new(PendingActionStore::new(
            db.clone(),
            config.max_queue_len,
            config.max_retries,
            events.clone(),
        ));
        // Start offline; the first probe result brings us online and the
        // resulting reconnect drains whatever the last run left behind.
        let connectivity = Arc::new(ConnectivityMonitor::new(
            false,
            config.debounce(),
            events.clone(),
        ));
        let sync = Arc::new(SyncManager::new(
            queue.clone(),
            backend.clone(),
            connectivity.clone(),
            events.clone(),
            config.failure_policy,
            config.request_timeout(),
        ));
        let settings: Arc<dyn storage::KeyValueStore> = Arc::new(storage::SettingsStore::new(
            db.clone(),
            NOTIFICATION_SETTINGS_CATEGORY,
        ));
        let push = Arc::new(PushTokenManager::new(
            provider,
            backend.clone(),
            settings.clone(),
            events.clone(),
        ));
        let preferences = Arc::new(PreferenceManager::new(backend.clone(), settings));

        Self {
            config,
            events,
            db,
            queue,
            connectivity,
            sync,
            push,
            preferences,
            backend: backend.clone(),
            probe: backend,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Unread badge count; `0` when the backend cannot be reached.
    pub async fn unread_count(&self) -> u64 {
        poll_unread_count(self.backend.as_ref()).await
    }

    /// Recover interrupted replays and start the background tasks: the
    /// connectivity debouncer and probe, the sync loop, and the push
    /// foreground listener. All of them stop when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Result<Vec<JoinHandle<()>>, StoreError> {
        let recovered = self.queue.recover_interrupted()?;
        if recovered > 0 {
            info!(recovered, "Recovered actions interrupted mid-sync");
        }

        let tasks = vec![
            self.connectivity.spawn_debouncer(cancel.clone()),
            self.connectivity.spawn_probe(
                self.probe.clone(),
                self.config.probe_interval(),
                cancel.clone(),
            ),
            self.sync
                .start_sync_loop(self.config.sync_interval(), cancel.clone()),
            self.push.spawn_foreground_listener(cancel),
        ];
        Ok(tasks)
    }
}
