//! Durable FIFO queue of deferred mutations.
//!
//! Rows live in `pending_actions` and are ordered by the autoincrement `seq`
//! column, so replay order is insertion order across restarts. Nothing is
//! deleted except through [`PendingActionStore::dequeue_completed`] or an
//! explicit [`PendingActionStore::discard`].

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::StoreError;
use crate::events::{AppEvent, EventBus};
use crate::models::{ActionStatus, FailureKind, NewAction, PendingAction};

const SELECT_COLUMNS: &str = "id, action_type, entity_id, payload, created_at, status,
     retry_count, last_error, failure_kind";

/// Queue totals for a status indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
    pub needs_attention: usize,
}

pub struct PendingActionStore {
    db: Arc<DbState>,
    max_len: usize,
    max_retries: u32,
    events: EventBus,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn corrupt(id: &str, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Raw column values, decoded outside the rusqlite row callback so decode
/// failures can carry the row id.
struct RawRow {
    id: String,
    action_type: String,
    entity_id: Option<String>,
    payload: String,
    created_at: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action_type: row.get(1)?,
            entity_id: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
            status: row.get(5)?,
            retry_count: row.get(6)?,
            last_error: row.get(7)?,
            failure_kind: row.get(8)?,
        })
    }

    fn decode(self) -> Result<PendingAction, StoreError> {
        let action_type = self
            .action_type
            .parse()
            .map_err(|e: String| corrupt(&self.id, e))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(&self.id, format!("payload: {e}")))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| corrupt(&self.id, format!("created_at: {e}")))?
            .with_timezone(&Utc);
        let status = self
            .status
            .parse()
            .map_err(|e: String| corrupt(&self.id, e))?;
        let failure_kind = self
            .failure_kind
            .as_deref()
            .map(str::parse::<FailureKind>)
            .transpose()
            .map_err(|e| corrupt(&self.id, e))?;

        Ok(PendingAction {
            id: self.id,
            action_type,
            entity_id: self.entity_id,
            payload,
            created_at,
            status,
            retry_count: u32::try_from(self.retry_count).unwrap_or(0),
            last_error: self.last_error,
            failure_kind,
        })
    }
}

impl PendingActionStore {
    pub fn new(db: Arc<DbState>, max_len: usize, max_retries: u32, events: EventBus) -> Self {
        Self {
            db,
            max_len,
            max_retries,
            events,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Append a new `pending` action and persist it before returning.
    ///
    /// On failure the action is not stored; an `EnqueueDropped` event is
    /// emitted and the error is returned so the caller can tell the user.
    pub fn enqueue(&self, action: NewAction) -> Result<PendingAction, StoreError> {
        self.enqueue_with_id(Uuid::new_v4().to_string(), action)
    }

    /// Enqueue under an id that was already used for a direct attempt, so
    /// the replay carries the same idempotency key.
    pub(crate) fn enqueue_with_id(
        &self,
        id: String,
        action: NewAction,
    ) -> Result<PendingAction, StoreError> {
        let action_type = action.action_type;
        match self.insert(id, action) {
            Ok(stored) => {
                info!(
                    action_id = %stored.id,
                    action_type = %stored.action_type,
                    "queued action for later sync"
                );
                self.events.emit(AppEvent::ActionEnqueued {
                    action_id: stored.id.clone(),
                    action_type: stored.action_type.to_string(),
                });
                Ok(stored)
            }
            Err(e) => {
                warn!(action_type = %action_type, error = %e, "failed to queue action, dropping it");
                self.events.emit(AppEvent::EnqueueDropped {
                    action_type: action_type.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn insert(&self, id: String, action: NewAction) -> Result<PendingAction, StoreError> {
        action.validate().map_err(StoreError::InvalidAction)?;
        let payload = serde_json::to_string(&action.payload)
            .map_err(|e| StoreError::InvalidAction(format!("payload: {e}")))?;

        let conn = self.db.lock()?;
        let queued: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_actions WHERE status != 'completed'",
            [],
            |row| row.get(0),
        )?;
        if queued as usize >= self.max_len {
            return Err(StoreError::QuotaExceeded {
                limit: self.max_len,
            });
        }

        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO pending_actions (
                 id, action_type, entity_id, payload, status, retry_count,
                 created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
            params![
                id,
                action.action_type.to_string(),
                action.entity_id,
                payload,
                now
            ],
        )?;

        Ok(PendingAction {
            id,
            action_type: action.action_type,
            entity_id: action.entity_id,
            payload: action.payload,
            created_at: DateTime::parse_from_rfc3339(&now)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            status: ActionStatus::Pending,
            retry_count: 0,
            last_error: None,
            failure_kind: None,
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingAction>, StoreError> {
        let conn = self.db.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM pending_actions WHERE id = ?1"),
                params![id],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::decode).transpose()
    }

    /// Actions still owed to the backend (`pending` or `failed`), FIFO.
    pub fn list_pending(&self) -> Result<Vec<PendingAction>, StoreError> {
        self.query_list("WHERE status IN ('pending', 'failed')")
    }

    /// Every stored action regardless of status, FIFO.
    pub fn list_all(&self) -> Result<Vec<PendingAction>, StoreError> {
        self.query_list("")
    }

    fn query_list(&self, where_clause: &str) -> Result<Vec<PendingAction>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM pending_actions {where_clause} ORDER BY seq ASC"
        ))?;
        let rows = stmt
            .query_map([], RawRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut actions = Vec::with_capacity(rows.len());
        for raw in rows {
            match raw.decode() {
                Ok(action) => actions.push(action),
                // A row we cannot decode can never be replayed; keep it on
                // disk for diagnostics but do not let it wedge the queue.
                Err(e) => warn!(error = %e, "skipping undecodable queue row"),
            }
        }
        Ok(actions)
    }

    /// Set an action's status. Returns `false` when it already had it.
    pub fn mark_status(&self, id: &str, status: ActionStatus) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions SET status = ?2, updated_at = ?3
             WHERE id = ?1 AND status != ?2",
            params![id, status.as_str(), now_rfc3339()],
        )?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM pending_actions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(id.to_string()));
            }
        }
        Ok(changed > 0)
    }

    /// Atomically move a `pending`/`failed` action to `syncing`.
    ///
    /// Only one caller can win the claim for a given action, which is what
    /// keeps a re-entrant drain from sending the same action twice.
    pub fn claim(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions SET status = 'syncing', updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'failed')",
            params![id, now_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Give back a claim whose replay was abandoned before an outcome was
    /// recorded. No retry is consumed.
    pub fn release_claim(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions SET status = 'pending', updated_at = ?2
             WHERE id = ?1 AND status = 'syncing'",
            params![id, now_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Mark `failed`, bump the retry counter and keep the backend message.
    /// Returns the new retry count.
    pub fn record_failure(
        &self,
        id: &str,
        kind: FailureKind,
        error: &str,
    ) -> Result<u32, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions
             SET status = 'failed',
                 retry_count = retry_count + 1,
                 failure_kind = ?2,
                 last_error = ?3,
                 updated_at = ?4
             WHERE id = ?1",
            params![id, kind.as_str(), error, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let count: i64 = conn.query_row(
            "SELECT retry_count FROM pending_actions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Put an action back to `pending` without consuming a retry.
    pub fn defer(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions
             SET status = 'pending', last_error = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, reason, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove an action the backend has confirmed. Only `completed` rows are
    /// removed; returns whether a row was deleted.
    pub fn dequeue_completed(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let deleted = conn.execute(
            "DELETE FROM pending_actions WHERE id = ?1 AND status = 'completed'",
            params![id],
        )?;
        Ok(deleted == 1)
    }

    /// Manual retry: a failed action goes back to `pending` with a fresh
    /// retry budget.
    pub fn reset_for_retry(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions
             SET status = 'pending', retry_count = 0, failure_kind = NULL, updated_at = ?2
             WHERE id = ?1 AND status = 'failed'",
            params![id, now_rfc3339()],
        )?;
        Ok(changed == 1)
    }

    /// Manual retry for every failed action. Returns how many were reset.
    pub fn reset_all_failed(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE pending_actions
             SET status = 'pending', retry_count = 0, failure_kind = NULL, updated_at = ?1
             WHERE status = 'failed'",
            params![now_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Explicit user discard. An action that is mid-flight cannot be
    /// discarded.
    pub fn discard(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let deleted = conn.execute(
            "DELETE FROM pending_actions WHERE id = ?1 AND status != 'syncing'",
            params![id],
        )?;
        if deleted == 1 {
            info!(action_id = %id, "discarded queued action");
        }
        Ok(deleted == 1)
    }

    /// Actions left in `syncing` by a crash go back to `pending`. Run once at
    /// start-up, before any drain.
    pub fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let recovered = conn.execute(
            "UPDATE pending_actions SET status = 'pending', updated_at = ?1
             WHERE status = 'syncing'",
            params![now_rfc3339()],
        )?;
        if recovered > 0 {
            info!(recovered, "recovered actions interrupted mid-sync");
        } else {
            debug!("no interrupted actions to recover");
        }
        Ok(recovered)
    }

    pub fn counts(&self) -> Result<QueueCounts, StoreError> {
        let actions = self.list_all()?;
        let mut counts = QueueCounts::default();
        for action in &actions {
            match action.status {
                ActionStatus::Pending => counts.pending += 1,
                ActionStatus::Syncing => counts.syncing += 1,
                ActionStatus::Failed => {
                    counts.failed += 1;
                    if action.needs_attention(self.max_retries) {
                        counts.needs_attention += 1;
                    }
                }
                ActionStatus::Completed => {}
            }
        }
        Ok(counts)
    }

    pub fn has_pending(&self) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pending_actions WHERE status IN ('pending', 'failed')",
            [],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}
