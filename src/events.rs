//! Event bus between the core and the UI layer.
//!
//! Events are serialised with a `type` tag so a UI bridge can forward them
//! as-is. Emission never fails: with no subscribers the event is dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::sync::{DrainReport, SyncStatus};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    ActionEnqueued {
        action_id: String,
        action_type: String,
    },
    /// The action could not be saved locally and is lost unless resubmitted.
    EnqueueDropped {
        action_type: String,
        reason: String,
    },
    ActionSynced {
        action_id: String,
        action_type: String,
    },
    ActionFailed {
        action_id: String,
        action_type: String,
        retryable: bool,
        retry_count: u32,
        error: String,
    },
    ActionDeferred {
        action_id: String,
        reason: String,
    },
    DrainFinished {
        report: DrainReport,
    },
    SyncStatus {
        status: SyncStatus,
    },
    ConnectivityChanged {
        online: bool,
    },
    SessionExpired,
    PushPermissionChanged {
        granted: bool,
    },
    Toast {
        title: String,
        body: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }
}
