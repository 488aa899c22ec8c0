//! Data types shared by the offline queue, the sync manager and the
//! notification managers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Action typing
// ---------------------------------------------------------------------------

/// Dashboard resource a queued mutation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    Room,
    Resident,
    Utility,
    Invoice,
    Payment,
    Laundry,
    Complaint,
    Expense,
    Announcement,
}

impl Resource {
    pub const ALL: [Resource; 9] = [
        Resource::Room,
        Resource::Resident,
        Resource::Utility,
        Resource::Invoice,
        Resource::Payment,
        Resource::Laundry,
        Resource::Complaint,
        Resource::Expense,
        Resource::Announcement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Room => "room",
            Resource::Resident => "resident",
            Resource::Utility => "utility",
            Resource::Invoice => "invoice",
            Resource::Payment => "payment",
            Resource::Laundry => "laundry",
            Resource::Complaint => "complaint",
            Resource::Expense => "expense",
            Resource::Announcement => "announcement",
        }
    }

    /// REST collection segment, e.g. `/api/rooms`.
    pub fn collection(&self) -> &'static str {
        match self {
            Resource::Room => "rooms",
            Resource::Resident => "residents",
            Resource::Utility => "utilities",
            Resource::Invoice => "invoices",
            Resource::Payment => "payments",
            Resource::Laundry => "laundry",
            Resource::Complaint => "complaints",
            Resource::Expense => "expenses",
            Resource::Announcement => "announcements",
        }
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resource::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| format!("unknown resource: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation: {other}")),
        }
    }
}

/// Mutation kind tagged with its target resource. Serialised as
/// `"<operation>-<resource>"`, e.g. `create-room`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionType {
    pub operation: Operation,
    pub resource: Resource,
}

impl ActionType {
    pub fn new(operation: Operation, resource: Resource) -> Self {
        Self {
            operation,
            resource,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.operation.as_str(), self.resource.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (op, resource) = s
            .split_once('-')
            .ok_or_else(|| format!("malformed action type: {s}"))?;
        Ok(Self::new(op.parse()?, resource.parse()?))
    }
}

impl TryFrom<String> for ActionType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionType> for String {
    fn from(value: ActionType) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Pending actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Syncing,
    Failed,
    Completed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Syncing => "syncing",
            ActionStatus::Failed => "failed",
            ActionStatus::Completed => "completed",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "syncing" => Ok(ActionStatus::Syncing),
            "failed" => Ok(ActionStatus::Failed),
            "completed" => Ok(ActionStatus::Completed),
            other => Err(format!("unknown action status: {other}")),
        }
    }
}

/// Classification of the most recent replay failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout or server error. Replayed automatically.
    Retryable,
    /// The backend refused the payload. Needs a person to fix or discard it.
    Rejected,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Rejected => "rejected",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(FailureKind::Retryable),
            "rejected" => Ok(FailureKind::Rejected),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

/// A mutation the UI wants applied, before it is given an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub action_type: ActionType,
    pub entity_id: Option<String>,
    pub payload: Value,
}

impl NewAction {
    pub fn create(resource: Resource, payload: Value) -> Self {
        Self {
            action_type: ActionType::new(Operation::Create, resource),
            entity_id: None,
            payload,
        }
    }

    pub fn update(resource: Resource, entity_id: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: ActionType::new(Operation::Update, resource),
            entity_id: Some(entity_id.into()),
            payload,
        }
    }

    pub fn delete(resource: Resource, entity_id: impl Into<String>) -> Self {
        Self {
            action_type: ActionType::new(Operation::Delete, resource),
            entity_id: Some(entity_id.into()),
            payload: Value::Null,
        }
    }

    /// Attach a client-generated id to a create.
    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Updates and deletes must name the entity they touch.
    pub fn validate(&self) -> Result<(), String> {
        let needs_id = matches!(
            self.action_type.operation,
            Operation::Update | Operation::Delete
        );
        let has_id = self
            .entity_id
            .as_deref()
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false);
        if needs_id && !has_id {
            return Err(format!("{} requires an entity id", self.action_type));
        }
        Ok(())
    }
}

/// A deferred mutation persisted in the offline queue.
///
/// Only `status`, `retry_count` and the failure bookkeeping change after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub entity_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub status: ActionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl PendingAction {
    /// `(resource, entity id)` this action touches, when the id is known.
    pub fn entity_key(&self) -> Option<(Resource, &str)> {
        self.entity_id
            .as_deref()
            .map(|id| (self.action_type.resource, id))
    }

    /// Whether a drain may replay this action without a person stepping in.
    pub fn is_auto_retryable(&self, max_retries: u32) -> bool {
        match self.status {
            ActionStatus::Pending => true,
            ActionStatus::Failed => {
                self.failure_kind != Some(FailureKind::Rejected) && self.retry_count < max_retries
            }
            ActionStatus::Syncing | ActionStatus::Completed => false,
        }
    }

    /// Failed for good: rejected by the backend or out of retries.
    pub fn needs_attention(&self, max_retries: u32) -> bool {
        self.status == ActionStatus::Failed && !self.is_auto_retryable(max_retries)
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceKey {
    Whatsapp,
    Push,
    Invoice,
    PaymentReminder,
    ComplaintUpdate,
    Announcement,
}

impl PreferenceKey {
    pub const ALL: [PreferenceKey; 6] = [
        PreferenceKey::Whatsapp,
        PreferenceKey::Push,
        PreferenceKey::Invoice,
        PreferenceKey::PaymentReminder,
        PreferenceKey::ComplaintUpdate,
        PreferenceKey::Announcement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceKey::Whatsapp => "whatsapp",
            PreferenceKey::Push => "push",
            PreferenceKey::Invoice => "invoice",
            PreferenceKey::PaymentReminder => "payment_reminder",
            PreferenceKey::ComplaintUpdate => "complaint_update",
            PreferenceKey::Announcement => "announcement",
        }
    }
}

/// Per-channel and per-type notification switches, mirrored from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreference {
    pub whatsapp: bool,
    pub push: bool,
    pub invoice: bool,
    pub payment_reminder: bool,
    pub complaint_update: bool,
    pub announcement: bool,
}

impl Default for NotificationPreference {
    fn default() -> Self {
        Self {
            whatsapp: true,
            push: true,
            invoice: true,
            payment_reminder: true,
            complaint_update: true,
            announcement: true,
        }
    }
}

impl NotificationPreference {
    pub fn get(&self, key: PreferenceKey) -> bool {
        match key {
            PreferenceKey::Whatsapp => self.whatsapp,
            PreferenceKey::Push => self.push,
            PreferenceKey::Invoice => self.invoice,
            PreferenceKey::PaymentReminder => self.payment_reminder,
            PreferenceKey::ComplaintUpdate => self.complaint_update,
            PreferenceKey::Announcement => self.announcement,
        }
    }

    pub fn set(&mut self, key: PreferenceKey, value: bool) {
        let slot = match key {
            PreferenceKey::Whatsapp => &mut self.whatsapp,
            PreferenceKey::Push => &mut self.push,
            PreferenceKey::Invoice => &mut self.invoice,
            PreferenceKey::PaymentReminder => &mut self.payment_reminder,
            PreferenceKey::ComplaintUpdate => &mut self.complaint_update,
            PreferenceKey::Announcement => &mut self.announcement,
        };
        *slot = value;
    }
}

/// Push token registered with the backend for this install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushToken {
    pub token: String,
    pub device_id: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    Denied,
    /// Not asked yet, or the prompt was dismissed.
    Default,
}

/// Message delivered by the push provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: HashMap<String, String>,
}
