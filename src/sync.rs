//! Sync manager: replays the offline queue against the backend.
//!
//! Actions are replayed strictly one at a time in FIFO order, each call
//! awaited before the next starts, because later actions may reference
//! entities created by earlier ones. At most one drain runs at a time; a
//! trigger that lands mid-drain sets a re-check flag and the running drain
//! makes one more pass instead of a second drain starting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{ApiError, StoreError};
use crate::events::{AppEvent, EventBus};
use crate::models::{
    ActionStatus, ActionType, FailureKind, NewAction, PendingAction, Resource,
};
use crate::queue::{PendingActionStore, QueueCounts};

/// Sends one queued action to the backend.
#[async_trait]
pub trait ActionReplayer: Send + Sync {
    async fn replay(&self, action: &PendingAction) -> Result<Value, ApiError>;
}

/// What a drain does after an action fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failed or blocked action.
    #[default]
    Halt,
    /// Skip the failed action and every later action on the same entity;
    /// keep going with the rest.
    SkipDependents,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(FailurePolicy::Halt),
            "skip_dependents" | "skip-dependents" | "skip" => Ok(FailurePolicy::SkipDependents),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplayOutcome {
    Completed,
    RetryableFailure {
        error: String,
        retry_count: u32,
        /// Out of automatic retries; needs a manual retry or discard.
        exhausted: bool,
    },
    PermanentFailure {
        error: String,
    },
    /// Back-pressure or an expired session. Left `pending`, no retry used.
    Deferred {
        reason: String,
    },
}

impl ReplayOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ReplayOutcome::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action_id: String,
    pub action_type: ActionType,
    pub outcome: ReplayOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub results: Vec<ActionResult>,
    /// Actions left untouched because an earlier action on the same entity
    /// failed or is blocked.
    pub skipped: Vec<String>,
    /// First action that needs user attention, when it stopped the drain.
    pub blocked_by: Option<String>,
    pub halted: bool,
    /// Another drain was running; this call only requested a re-check.
    pub already_running: bool,
    pub passes: u32,
    pub error: Option<String>,
}

impl DrainReport {
    fn already_running() -> Self {
        Self {
            already_running: true,
            ..Self::default()
        }
    }

    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome.is_completed())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    ReplayOutcome::RetryableFailure { .. } | ReplayOutcome::PermanentFailure { .. }
                )
            })
            .count()
    }

    pub fn outcome_for(&self, action_id: &str) -> Option<&ReplayOutcome> {
        self.results
            .iter()
            .find(|r| r.action_id == action_id)
            .map(|r| &r.outcome)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub drain_in_progress: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub queue: QueueCounts,
}

/// Result of [`SyncManager::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Applied on the backend right away.
    Applied(Value),
    /// Saved to the offline queue for later replay.
    Queued(PendingAction),
    /// The backend refused the payload; nothing was queued.
    Rejected(ApiError),
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct SyncManager {
    store: Arc<PendingActionStore>,
    replayer: Arc<dyn ActionReplayer>,
    connectivity: Arc<ConnectivityMonitor>,
    events: EventBus,
    policy: FailurePolicy,
    request_timeout: Duration,
    drain_in_progress: AtomicBool,
    recheck_requested: AtomicBool,
    trigger: Notify,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    /// Action claimed by the running drain and not yet recorded.
    in_flight: Mutex<Option<String>>,
}

/// Holds the single-drain flag for one `drain` call. Dropped mid-replay
/// (the caller's future was cancelled), it hands the claimed action back to
/// the queue before releasing the flag.
struct DrainGuard<'a> {
    manager: &'a SyncManager,
    held: bool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(manager: &'a SyncManager) -> Option<Self> {
        if manager.drain_in_progress.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self {
            manager,
            held: true,
        })
    }

    fn release(&mut self) {
        if self.held {
            self.manager.drain_in_progress.store(false, Ordering::SeqCst);
            self.held = false;
        }
    }

    fn reacquire(&mut self) -> bool {
        self.held = self
            .manager
            .drain_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.held
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.manager.take_in_flight() {
            match self.manager.store.release_claim(&id) {
                Ok(_) => warn!(
                    action_id = %id,
                    "drain cancelled mid-replay, action returned to the queue"
                ),
                Err(e) => warn!(action_id = %id, error = %e, "failed to release claimed action"),
            }
        }
        self.release();
    }
}

impl SyncManager {
    pub fn new(
        store: Arc<PendingActionStore>,
        replayer: Arc<dyn ActionReplayer>,
        connectivity: Arc<ConnectivityMonitor>,
        events: EventBus,
        policy: FailurePolicy,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            replayer,
            connectivity,
            events,
            policy,
            request_timeout,
            drain_in_progress: AtomicBool::new(false),
            recheck_requested: AtomicBool::new(false),
            trigger: Notify::new(),
            last_sync: Mutex::new(None),
            in_flight: Mutex::new(None),
        }
    }

    fn set_in_flight(&self, action_id: Option<String>) {
        if let Ok(mut guard) = self.in_flight.lock() {
            *guard = action_id;
        }
    }

    fn take_in_flight(&self) -> Option<String> {
        self.in_flight.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn store(&self) -> &Arc<PendingActionStore> {
        &self.store
    }

    pub fn is_draining(&self) -> bool {
        self.drain_in_progress.load(Ordering::SeqCst)
    }

    /// Wake the sync loop for an immediate drain.
    pub fn request_sync(&self) {
        self.trigger.notify_one();
    }

    /// Apply a mutation now when possible, otherwise queue it.
    ///
    /// The mutation is queued when offline, when older actions are still
    /// queued (it must not overtake them), or when the direct attempt fails
    /// with a retryable error. A backend rejection is returned, not queued.
    pub async fn submit(&self, action: NewAction) -> Result<SubmitOutcome, StoreError> {
        action.validate().map_err(StoreError::InvalidAction)?;

        if !self.connectivity.get_status() || self.is_draining() || self.store.has_pending()? {
            let queued = self.store.enqueue(action)?;
            self.request_sync();
            return Ok(SubmitOutcome::Queued(queued));
        }

        let attempt = PendingAction {
            id: Uuid::new_v4().to_string(),
            action_type: action.action_type,
            entity_id: action.entity_id.clone(),
            payload: action.payload.clone(),
            created_at: Utc::now(),
            status: ActionStatus::Syncing,
            retry_count: 0,
            last_error: None,
            failure_kind: None,
        };

        match self.call_with_timeout(&attempt).await {
            Ok(value) => {
                debug!(action_type = %attempt.action_type, "applied action directly");
                Ok(SubmitOutcome::Applied(value))
            }
            Err(e) if e.is_retryable() || matches!(e, ApiError::Unauthorized { .. }) => {
                info!(
                    action_type = %attempt.action_type,
                    error = %e,
                    "direct attempt failed, queueing for later sync"
                );
                if matches!(e, ApiError::Unauthorized { .. }) {
                    self.events.emit(AppEvent::SessionExpired);
                }
                let queued = self.store.enqueue_with_id(attempt.id, action)?;
                Ok(SubmitOutcome::Queued(queued))
            }
            Err(e) => {
                warn!(action_type = %attempt.action_type, error = %e, "backend rejected action");
                Ok(SubmitOutcome::Rejected(e))
            }
        }
    }

    /// Replay every eligible queued action, in order.
    pub async fn drain(&self) -> DrainReport {
        let Some(mut guard) = DrainGuard::acquire(self) else {
            self.recheck_requested.store(true, Ordering::SeqCst);
            debug!("drain already running, queued a re-check");
            return DrainReport::already_running();
        };

        let mut report = DrainReport::default();
        loop {
            self.run_pass(&mut report).await;

            if report.halted {
                // Re-running now would only hit the same failure again.
                self.recheck_requested.store(false, Ordering::SeqCst);
                break;
            }
            if self.recheck_requested.swap(false, Ordering::SeqCst) {
                continue;
            }
            guard.release();

            // A trigger may have landed between the check and the release.
            if self.recheck_requested.load(Ordering::SeqCst) && guard.reacquire() {
                self.recheck_requested.store(false, Ordering::SeqCst);
                continue;
            }
            break;
        }
        drop(guard);

        if !report.results.is_empty() {
            info!(
                completed = report.completed(),
                failed = report.failed(),
                skipped = report.skipped.len(),
                halted = report.halted,
                "Drain complete"
            );
        }
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now());
        }
        self.events.emit(AppEvent::DrainFinished {
            report: report.clone(),
        });
        report
    }

    async fn run_pass(&self, report: &mut DrainReport) {
        let actions = match self.store.list_pending() {
            Ok(actions) => actions,
            Err(e) => {
                warn!(error = %e, "failed to load pending actions");
                report.halted = true;
                report.error = Some(e.to_string());
                return;
            }
        };
        if actions.is_empty() {
            return;
        }
        report.passes += 1;

        let max_retries = self.store.max_retries();
        let mut blocked: HashSet<(Resource, String)> = HashSet::new();
        let block = |blocked: &mut HashSet<(Resource, String)>, action: &PendingAction| {
            if let Some((resource, id)) = action.entity_key() {
                blocked.insert((resource, id.to_string()));
            }
        };

        for action in actions {
            if let Some((resource, id)) = action.entity_key() {
                if blocked.contains(&(resource, id.to_string())) {
                    debug!(action_id = %action.id, "skipping action behind a failed dependency");
                    report.skipped.push(action.id.clone());
                    continue;
                }
            }

            if !action.is_auto_retryable(max_retries) {
                match self.policy {
                    FailurePolicy::Halt => {
                        info!(
                            action_id = %action.id,
                            action_type = %action.action_type,
                            "queue blocked by an action that needs attention"
                        );
                        report.blocked_by = Some(action.id.clone());
                        report.halted = true;
                        return;
                    }
                    FailurePolicy::SkipDependents => {
                        block(&mut blocked, &action);
                        report.skipped.push(action.id.clone());
                        continue;
                    }
                }
            }

            let Some(outcome) = self.replay_one(&action).await else {
                report.skipped.push(action.id.clone());
                continue;
            };

            let stop = match &outcome {
                ReplayOutcome::Completed => false,
                ReplayOutcome::Deferred { .. } => true,
                ReplayOutcome::RetryableFailure { .. } | ReplayOutcome::PermanentFailure { .. } => {
                    self.policy == FailurePolicy::Halt
                }
            };
            if !outcome.is_completed() {
                block(&mut blocked, &action);
            }
            report.results.push(ActionResult {
                action_id: action.id.clone(),
                action_type: action.action_type,
                outcome,
            });
            if stop {
                report.halted = true;
                return;
            }
        }
    }

    /// Claim, send and record one action. `None` when another caller
    /// already owns it.
    async fn replay_one(&self, action: &PendingAction) -> Option<ReplayOutcome> {
        match self.store.claim(&action.id) {
            Ok(true) => self.set_in_flight(Some(action.id.clone())),
            Ok(false) => {
                debug!(action_id = %action.id, "action already claimed, skipping");
                return None;
            }
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "failed to claim action");
                return None;
            }
        }

        debug!(
            action_id = %action.id,
            action_type = %action.action_type,
            retry_count = action.retry_count,
            "replaying action"
        );

        let result = self.call_with_timeout(action).await;
        self.set_in_flight(None);
        Some(match result {
            Ok(_) => self.complete(action),
            Err(e) => self.fail(action, e),
        })
    }

    async fn call_with_timeout(&self, action: &PendingAction) -> Result<Value, ApiError> {
        match tokio::time::timeout(self.request_timeout, self.replayer.replay(action)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Timeout(self.request_timeout)),
        }
    }

    fn complete(&self, action: &PendingAction) -> ReplayOutcome {
        let removed = self
            .store
            .mark_status(&action.id, ActionStatus::Completed)
            .and_then(|_| self.store.dequeue_completed(&action.id));
        if let Err(e) = removed {
            // The backend has it; the idempotency key covers a replay.
            error!(action_id = %action.id, error = %e, "failed to dequeue synced action");
        }
        info!(action_id = %action.id, action_type = %action.action_type, "action synced");
        self.events.emit(AppEvent::ActionSynced {
            action_id: action.id.clone(),
            action_type: action.action_type.to_string(),
        });
        ReplayOutcome::Completed
    }

    fn fail(&self, action: &PendingAction, err: ApiError) -> ReplayOutcome {
        let message = err.to_string();

        if matches!(
            err,
            ApiError::Backpressure { .. } | ApiError::Unauthorized { .. }
        ) {
            if let Err(e) = self.store.defer(&action.id, &message) {
                warn!(action_id = %action.id, error = %e, "failed to defer action");
            }
            if matches!(err, ApiError::Unauthorized { .. }) {
                warn!("backend session is not valid; sync paused until re-login");
                self.events.emit(AppEvent::SessionExpired);
            } else {
                info!(action_id = %action.id, "backend busy, deferring without using a retry");
            }
            self.events.emit(AppEvent::ActionDeferred {
                action_id: action.id.clone(),
                reason: message.clone(),
            });
            return ReplayOutcome::Deferred { reason: message };
        }

        let retryable = err.is_retryable();
        let kind = if retryable {
            FailureKind::Retryable
        } else {
            FailureKind::Rejected
        };
        let retry_count = match self.store.record_failure(&action.id, kind, &message) {
            Ok(count) => count,
            Err(e) => {
                warn!(action_id = %action.id, error = %e, "failed to record action failure");
                action.retry_count.saturating_add(1)
            }
        };

        warn!(
            action_id = %action.id,
            action_type = %action.action_type,
            retry_count,
            retryable,
            error = %message,
            "action replay failed"
        );
        self.events.emit(AppEvent::ActionFailed {
            action_id: action.id.clone(),
            action_type: action.action_type.to_string(),
            retryable,
            retry_count,
            error: message.clone(),
        });

        if retryable {
            ReplayOutcome::RetryableFailure {
                error: message,
                retry_count,
                exhausted: retry_count >= self.store.max_retries(),
            }
        } else {
            ReplayOutcome::PermanentFailure { error: message }
        }
    }

    /// Manual retry of one failed action, then drain.
    pub async fn retry(&self, action_id: &str) -> Result<DrainReport, StoreError> {
        if !self.store.reset_for_retry(action_id)? && self.store.get(action_id)?.is_none() {
            return Err(StoreError::NotFound(action_id.to_string()));
        }
        Ok(self.drain().await)
    }

    /// Manual retry of every failed action, then drain.
    pub async fn retry_all(&self) -> Result<DrainReport, StoreError> {
        let reset = self.store.reset_all_failed()?;
        info!(reset, "manual retry requested for failed actions");
        Ok(self.drain().await)
    }

    pub fn discard(&self, action_id: &str) -> Result<bool, StoreError> {
        self.store.discard(action_id)
    }

    pub fn status(&self) -> Result<SyncStatus, StoreError> {
        Ok(SyncStatus {
            online: self.connectivity.get_status(),
            drain_in_progress: self.is_draining(),
            last_sync: self.last_sync.lock().ok().and_then(|g| *g),
            queue: self.store.counts()?,
        })
    }

    fn emit_status(&self) {
        match self.status() {
            Ok(status) => self.events.emit(AppEvent::SyncStatus { status }),
            Err(e) => warn!(error = %e, "failed to read sync status"),
        }
    }

    /// Start the background sync loop. Drains on reconnection, on
    /// [`SyncManager::request_sync`], and every `interval` while online with
    /// work queued.
    pub fn start_sync_loop(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut transitions = self.connectivity.subscribe();

        tokio::spawn(async move {
            info!("Sync loop started (interval: {}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                let reason = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Sync loop stopped");
                        break;
                    }
                    event = transitions.recv() => match event {
                        Ok(ConnectivityEvent::Reconnected) => "reconnected",
                        Ok(ConnectivityEvent::Disconnected) => {
                            info!("Network offline; deferring remote sync and keeping queue pending");
                            manager.emit_status();
                            continue;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "sync loop lagged behind connectivity events");
                            "lagged"
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = manager.trigger.notified() => "requested",
                    _ = ticker.tick() => "interval",
                };

                if !manager.connectivity.get_status() {
                    continue;
                }
                match manager.store.has_pending() {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(error = %e, "failed to check queue");
                        continue;
                    }
                }

                debug!(reason, "starting drain");
                manager.drain().await;
                manager.emit_status();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;
    use std::collections::HashMap;

    /// Replayer returning scripted results per action id, defaulting to
    /// success, and recording every call.
    #[derive(Default)]
    struct ScriptedReplayer {
        calls: Mutex<Vec<String>>,
        script: Mutex<HashMap<String, Vec<Result<Value, ApiError>>>>,
        delay: Option<Duration>,
    }

    impl ScriptedReplayer {
        fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn fail_next(&self, action_id: &str, err: ApiError) {
            self.script
                .lock()
                .unwrap()
                .entry(action_id.to_string())
                .or_default()
                .push(Err(err));
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionReplayer for ScriptedReplayer {
        async fn replay(&self, action: &PendingAction) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push(action.id.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&action.id) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ => Ok(json!({ "ok": true })),
            }
        }
    }

    struct Harness {
        manager: Arc<SyncManager>,
        replayer: Arc<ScriptedReplayer>,
        connectivity: Arc<ConnectivityMonitor>,
        events: EventBus,
    }

    fn harness_with(policy: FailurePolicy, replayer: ScriptedReplayer, online: bool) -> Harness {
        let events = EventBus::default();
        let db = Arc::new(db::open_in_memory().unwrap());
        let store = Arc::new(PendingActionStore::new(db, 100, 3, events.clone()));
        let replayer = Arc::new(replayer);
        let connectivity = Arc::new(ConnectivityMonitor::new(
            online,
            Duration::from_millis(10),
            events.clone(),
        ));
        let manager = Arc::new(SyncManager::new(
            store,
            replayer.clone(),
            connectivity.clone(),
            events.clone(),
            policy,
            Duration::from_secs(30),
        ));
        Harness {
            manager,
            replayer,
            connectivity,
            events,
        }
    }

    fn harness(policy: FailurePolicy) -> Harness {
        harness_with(policy, ScriptedReplayer::default(), true)
    }

    fn enqueue(h: &Harness, action: NewAction) -> String {
        h.manager.store().enqueue(action).unwrap().id
    }

    fn pending_ids(h: &Harness) -> Vec<String> {
        h.manager
            .store()
            .list_pending()
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect()
    }

    fn network_error() -> ApiError {
        ApiError::Network("connection reset".into())
    }

    #[tokio::test]
    async fn test_drain_replays_in_fifo_order_and_empties_queue() {
        let h = harness(FailurePolicy::Halt);
        let ids: Vec<String> = (0..5)
            .map(|i| enqueue(&h, NewAction::create(Resource::Utility, json!({ "meter": i }))))
            .collect();

        let report = h.manager.drain().await;

        assert_eq!(h.replayer.calls(), ids);
        assert_eq!(report.completed(), 5);
        assert!(!report.halted);
        assert!(pending_ids(&h).is_empty());
        assert!(h.manager.store().list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_halt_policy_stops_at_first_failure_without_reordering() {
        let h = harness(FailurePolicy::Halt);
        let a = enqueue(&h, NewAction::create(Resource::Room, json!({})));
        let b = enqueue(&h, NewAction::update(Resource::Room, "r1", json!({})));
        let c = enqueue(&h, NewAction::create(Resource::Expense, json!({})));
        h.replayer.fail_next(&b, network_error());

        let report = h.manager.drain().await;

        assert_eq!(h.replayer.calls(), vec![a.clone(), b.clone()]);
        assert!(report.halted);
        assert!(matches!(
            report.outcome_for(&b),
            Some(ReplayOutcome::RetryableFailure { retry_count: 1, exhausted: false, .. })
        ));
        assert_eq!(pending_ids(&h), vec![b.clone(), c.clone()]);

        let b_row = h.manager.store().get(&b).unwrap().unwrap();
        assert_eq!(b_row.status, ActionStatus::Failed);
        assert_eq!(b_row.retry_count, 1);

        // Next reconnect picks up where it stopped.
        let report = h.manager.drain().await;
        assert_eq!(report.completed(), 2);
        assert_eq!(h.replayer.calls(), vec![a, b.clone(), b, c]);
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn test_skip_dependents_policy_continues_with_unrelated_actions() {
        let h = harness(FailurePolicy::SkipDependents);
        let a = enqueue(&h, NewAction::update(Resource::Room, "r1", json!({ "floor": 2 })));
        let b = enqueue(&h, NewAction::delete(Resource::Room, "r1"));
        let c = enqueue(&h, NewAction::update(Resource::Invoice, "i1", json!({})));
        h.replayer.fail_next(&a, network_error());

        let report = h.manager.drain().await;

        assert_eq!(h.replayer.calls(), vec![a.clone(), c.clone()]);
        assert_eq!(report.skipped, vec![b.clone()]);
        assert!(!report.halted);
        assert_eq!(pending_ids(&h), vec![a, b]);
    }

    #[tokio::test]
    async fn test_rejected_action_is_not_retried_automatically() {
        let h = harness(FailurePolicy::Halt);
        let invoice = enqueue(&h, NewAction::create(Resource::Invoice, json!({ "amount": -1 })));
        h.replayer.fail_next(
            &invoice,
            ApiError::Rejected {
                status: 400,
                message: "amount must be positive".into(),
            },
        );

        let report = h.manager.drain().await;
        assert!(matches!(
            report.outcome_for(&invoice),
            Some(ReplayOutcome::PermanentFailure { .. })
        ));

        let stored = h.manager.store().get(&invoice).unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Failed);
        assert_eq!(stored.failure_kind, Some(FailureKind::Rejected));
        assert_eq!(pending_ids(&h), vec![invoice.clone()]);

        // Another reconnect does not resend it.
        let report = h.manager.drain().await;
        assert_eq!(h.replayer.calls().len(), 1);
        assert_eq!(report.blocked_by.as_deref(), Some(invoice.as_str()));

        // A manual retry does.
        let report = h.manager.retry(&invoice).await.unwrap();
        assert_eq!(report.completed(), 1);
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn test_retry_limit_leaves_action_failed_for_user() {
        let h = harness(FailurePolicy::Halt);
        let a = enqueue(&h, NewAction::create(Resource::Laundry, json!({ "kg": 3 })));
        for _ in 0..3 {
            h.replayer.fail_next(&a, network_error());
        }

        let mut last = DrainReport::default();
        for _ in 0..3 {
            last = h.manager.drain().await;
        }
        assert!(matches!(
            last.outcome_for(&a),
            Some(ReplayOutcome::RetryableFailure { retry_count: 3, exhausted: true, .. })
        ));

        let report = h.manager.drain().await;
        assert_eq!(h.replayer.calls().len(), 3);
        assert_eq!(report.blocked_by.as_deref(), Some(a.as_str()));
        assert_eq!(h.manager.status().unwrap().queue.needs_attention, 1);

        assert!(h.manager.discard(&a).unwrap());
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_defers_without_consuming_retry() {
        let h = harness(FailurePolicy::Halt);
        let a = enqueue(&h, NewAction::create(Resource::Payment, json!({})));
        let b = enqueue(&h, NewAction::create(Resource::Payment, json!({})));
        h.replayer.fail_next(
            &a,
            ApiError::Backpressure {
                retry_after_secs: Some(5),
            },
        );

        let report = h.manager.drain().await;

        assert!(report.halted);
        assert_eq!(h.replayer.calls(), vec![a.clone()]);
        let stored = h.manager.store().get(&a).unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(pending_ids(&h), vec![a, b]);
    }

    #[tokio::test]
    async fn test_unauthorized_pauses_sync_and_signals_session_expiry() {
        let h = harness(FailurePolicy::SkipDependents);
        let mut rx = h.events.subscribe();
        let a = enqueue(&h, NewAction::create(Resource::Announcement, json!({})));
        let b = enqueue(&h, NewAction::create(Resource::Announcement, json!({})));
        h.replayer
            .fail_next(&a, ApiError::Unauthorized { status: 401 });

        let report = h.manager.drain().await;

        // Even the skip policy stops: every later call would fail the same way.
        assert!(report.halted);
        assert_eq!(pending_ids(&h), vec![a, b]);
        let mut saw_expiry = false;
        while let Ok(event) = rx.try_recv() {
            saw_expiry |= matches!(event, AppEvent::SessionExpired);
        }
        assert!(saw_expiry);
    }

    #[tokio::test]
    async fn test_overlapping_drains_send_each_action_once() {
        let h = harness_with(
            FailurePolicy::Halt,
            ScriptedReplayer::with_delay(Duration::from_millis(20)),
            true,
        );
        let ids: Vec<String> = (0..3)
            .map(|_| enqueue(&h, NewAction::create(Resource::Complaint, json!({}))))
            .collect();

        let (first, second) = tokio::join!(h.manager.drain(), h.manager.drain());

        assert!(second.already_running || first.already_running);
        let mut calls = h.replayer.calls();
        assert_eq!(calls.len(), 3);
        calls.dedup();
        assert_eq!(calls, ids);
        assert!(!h.manager.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_drain_releases_flag_and_claimed_action() {
        let h = harness_with(
            FailurePolicy::Halt,
            ScriptedReplayer::with_delay(Duration::from_millis(200)),
            true,
        );
        let a = enqueue(&h, NewAction::create(Resource::Room, json!({ "number": "B2" })));

        let abandoned = tokio::time::timeout(Duration::from_millis(50), h.manager.drain()).await;
        assert!(abandoned.is_err());
        assert!(!h.manager.is_draining());
        let stored = h.manager.store().get(&a).unwrap().unwrap();
        assert_eq!(stored.status, ActionStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        let report = h.manager.drain().await;
        assert!(!report.already_running);
        assert_eq!(report.completed(), 1);
        assert_eq!(h.replayer.calls(), vec![a.clone(), a]);
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn test_retry_all_resets_every_rejected_action() {
        let h = harness(FailurePolicy::SkipDependents);
        let a = enqueue(&h, NewAction::create(Resource::Invoice, json!({ "amount": 0 })));
        let b = enqueue(&h, NewAction::create(Resource::Payment, json!({ "amount": 0 })));
        for id in [&a, &b] {
            h.replayer.fail_next(
                id,
                ApiError::Rejected {
                    status: 422,
                    message: "amount must be positive".into(),
                },
            );
        }

        let report = h.manager.drain().await;
        assert_eq!(report.failed(), 2);
        assert_eq!(h.manager.status().unwrap().queue.needs_attention, 2);

        let report = h.manager.retry_all().await.unwrap();
        assert_eq!(report.completed(), 2);
        assert_eq!(h.replayer.calls(), vec![a.clone(), b.clone(), a, b]);
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_as_retryable_failure() {
        let events = EventBus::default();
        let db = Arc::new(db::open_in_memory().unwrap());
        let store = Arc::new(PendingActionStore::new(db, 10, 3, events.clone()));
        let connectivity = Arc::new(ConnectivityMonitor::new(
            true,
            Duration::from_millis(10),
            events.clone(),
        ));
        let manager = SyncManager::new(
            store.clone(),
            Arc::new(ScriptedReplayer::with_delay(Duration::from_secs(60))),
            connectivity,
            events,
            FailurePolicy::Halt,
            Duration::from_secs(30),
        );
        let id = store
            .enqueue(NewAction::create(Resource::Room, json!({})))
            .unwrap()
            .id;

        let report = manager.drain().await;

        assert!(matches!(
            report.outcome_for(&id),
            Some(ReplayOutcome::RetryableFailure { .. })
        ));
        let stored = store.get(&id).unwrap().unwrap();
        assert_eq!(stored.failure_kind, Some(FailureKind::Retryable));
        assert!(stored.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_submit_applies_directly_when_online_and_queue_empty() {
        let h = harness(FailurePolicy::Halt);
        let outcome = h
            .manager
            .submit(NewAction::create(Resource::Resident, json!({ "name": "Sari" })))
            .await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Applied(_)));
        assert_eq!(h.replayer.calls().len(), 1);
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn test_submit_queues_when_offline_or_behind_existing_work() {
        let h = harness_with(FailurePolicy::Halt, ScriptedReplayer::default(), false);
        let first = h
            .manager
            .submit(NewAction::create(Resource::Room, json!({})))
            .await
            .unwrap();
        assert!(matches!(first, SubmitOutcome::Queued(_)));
        assert!(h.replayer.calls().is_empty());

        h.connectivity.report(true);
        // Status only changes once debounced; the queue already forces order.
        let second = h
            .manager
            .submit(NewAction::update(Resource::Room, "r1", json!({})))
            .await
            .unwrap();
        assert!(matches!(second, SubmitOutcome::Queued(_)));
        assert_eq!(pending_ids(&h).len(), 2);
    }

    #[tokio::test]
    async fn test_submit_queues_after_network_failure_with_same_id() {
        let h = harness(FailurePolicy::Halt);
        // The direct attempt's id is not known up front, so use a replayer
        // that fails every call.
        let replayer = h.replayer.clone();
        let outcome = {
            struct Down;
            #[async_trait]
            impl ActionReplayer for Down {
                async fn replay(&self, _: &PendingAction) -> Result<Value, ApiError> {
                    Err(ApiError::Network("offline".into()))
                }
            }
            let manager = SyncManager::new(
                h.manager.store().clone(),
                Arc::new(Down),
                h.connectivity.clone(),
                h.events.clone(),
                FailurePolicy::Halt,
                Duration::from_secs(30),
            );
            manager
                .submit(NewAction::create(Resource::Expense, json!({ "amount": 50_000 })))
                .await
                .unwrap()
        };

        let SubmitOutcome::Queued(queued) = outcome else {
            panic!("expected the action to be queued");
        };
        assert_eq!(pending_ids(&h), vec![queued.id.clone()]);

        h.manager.drain().await;
        assert_eq!(replayer.calls(), vec![queued.id]);
    }

    #[tokio::test]
    async fn test_submit_returns_rejection_without_queueing() {
        struct Refuses;
        #[async_trait]
        impl ActionReplayer for Refuses {
            async fn replay(&self, _: &PendingAction) -> Result<Value, ApiError> {
                Err(ApiError::Rejected {
                    status: 422,
                    message: "room number taken".into(),
                })
            }
        }

        let h = harness(FailurePolicy::Halt);
        let manager = SyncManager::new(
            h.manager.store().clone(),
            Arc::new(Refuses),
            h.connectivity.clone(),
            h.events.clone(),
            FailurePolicy::Halt,
            Duration::from_secs(30),
        );
        let outcome = manager
            .submit(NewAction::create(Resource::Room, json!({ "number": "A1" })))
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            SubmitOutcome::Rejected(ApiError::Rejected { status: 422, .. })
        ));
        assert!(pending_ids(&h).is_empty());
    }

    #[tokio::test]
    async fn test_sync_loop_drains_on_request() {
        let h = harness(FailurePolicy::Halt);
        let id = enqueue(&h, NewAction::create(Resource::Room, json!({})));
        let cancel = CancellationToken::new();
        let task = h
            .manager
            .start_sync_loop(Duration::from_secs(3600), cancel.clone());

        h.manager.request_sync();
        for _ in 0..50 {
            if pending_ids(&h).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.replayer.calls(), vec![id]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!("halt".parse::<FailurePolicy>().unwrap(), FailurePolicy::Halt);
        assert_eq!(
            "Skip-Dependents".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::SkipDependents
        );
        assert!("yolo".parse::<FailurePolicy>().is_err());
    }
}
