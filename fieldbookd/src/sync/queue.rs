use fieldbook_core::ActionKind;
use serde_json::Value;
use thiserror::Error;

use super::now_unix;
use super::store::{LocalStore, StoreError};

pub type ActionId = i64;

/// Prefix of ids minted on the device for entities the server has not seen yet.
pub const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("action payload must be a JSON object, got {0}")]
    InvalidPayload(&'static str),
    #[error("action {0} does not exist or is already synced")]
    MissingAction(ActionId),
    #[error("action {id} is {status} and cannot be resolved this way")]
    NotResolvable { id: ActionId, status: ActionStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    /// Waiting for delivery, possibly after a transient failure.
    Pending,
    /// Rejected by the server; needs the user to discard or resubmit it.
    Failed,
    /// Gave up after too many transient failures; needs attention.
    Stuck,
}

impl ActionStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Failed => "failed",
            ActionStatus::Stuck => "stuck",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(ActionStatus::Pending),
            "failed" => Ok(ActionStatus::Failed),
            "stuck" => Ok(ActionStatus::Stuck),
            other => Err(StoreError::InvalidActionStatus(other.to_string())),
        }
    }

    pub fn is_blocked(&self) -> bool {
        !matches!(self, ActionStatus::Pending)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: Value,
    pub created_at: i64,
    pub synced: bool,
    pub status: ActionStatus,
    pub attempt: u32,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl PendingAction {
    /// Stable across retries and restarts; the device id keeps keys unique
    /// even after a local reset restarts action ids.
    pub fn idempotency_key(&self, device_id: &str) -> String {
        format!("{device_id}:{}", self.id)
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// One-line summary shown to the user when the action needs attention.
    pub fn describe(&self) -> String {
        let mut text = format!("#{} {}", self.id, self.kind);
        if let Some(id) = self.entity_id() {
            text.push_str(&format!(" {id}"));
        }
        if let Some(name) = self.payload.get("name").and_then(Value::as_str) {
            text.push_str(&format!(" ({name})"));
        }
        if let Some(error) = &self.last_error {
            text.push_str(&format!(": {error}"));
        }
        text
    }
}

pub fn new_local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{:016x}", rand::random::<u64>())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Durable FIFO of user mutations. The store is the only source of truth;
/// nothing here is cached in memory.
#[derive(Clone)]
pub struct ActionQueue {
    store: LocalStore,
}

impl ActionQueue {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Durably appends an action. Create actions without an `id` get a
    /// placeholder so later actions can reference the new entity.
    pub async fn enqueue(&self, kind: ActionKind, payload: Value) -> Result<ActionId, QueueError> {
        let mut payload = payload;
        let Some(fields) = payload.as_object_mut() else {
            return Err(QueueError::InvalidPayload(json_type_name(&payload)));
        };
        if kind.creates_resource() && !fields.contains_key("id") {
            fields.insert("id".into(), Value::String(new_local_id()));
        }
        let id = self.store.append_action(kind, &payload, now_unix()).await?;
        tracing::debug!(action_id = id, %kind, "action enqueued");
        Ok(id)
    }

    pub async fn head(&self) -> Result<Option<PendingAction>, QueueError> {
        Ok(self.store.head_unsynced_action().await?)
    }

    pub async fn get(&self, id: ActionId) -> Result<Option<PendingAction>, QueueError> {
        Ok(self.store.get_action(id).await?)
    }

    pub async fn pending(&self) -> Result<Vec<PendingAction>, QueueError> {
        Ok(self.store.list_actions(false).await?)
    }

    pub async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.count_unsynced_actions().await?)
    }

    /// Actions that halt the queue until the user resolves them.
    pub async fn blocked(&self) -> Result<Vec<PendingAction>, QueueError> {
        Ok(self
            .pending()
            .await?
            .into_iter()
            .filter(|action| action.status.is_blocked())
            .collect())
    }

    pub async fn blocked_count(&self) -> Result<usize, QueueError> {
        Ok(self.store.count_blocked_actions().await?)
    }

    pub async fn confirmed_through(&self) -> Result<ActionId, QueueError> {
        Ok(self.store.confirmed_through().await?)
    }

    /// Drops a failed or stuck action for good.
    pub async fn discard(&self, id: ActionId) -> Result<PendingAction, QueueError> {
        let action = self.blocked_action(id).await?;
        self.store.delete_action(id).await?;
        tracing::info!(action = %action.describe(), "action discarded");
        Ok(action)
    }

    /// Replaces the payload of a rejected action and puts it back in line at
    /// its original position.
    pub async fn resubmit(&self, id: ActionId, payload: Value) -> Result<(), QueueError> {
        let action = self.blocked_action(id).await?;
        if action.status != ActionStatus::Failed {
            return Err(QueueError::NotResolvable {
                id,
                status: action.status,
            });
        }
        if !payload.is_object() {
            return Err(QueueError::InvalidPayload(json_type_name(&payload)));
        }
        self.store.reset_action(id, Some(&payload)).await?;
        Ok(())
    }

    /// Gives a stuck action a fresh set of delivery attempts.
    pub async fn retry(&self, id: ActionId) -> Result<(), QueueError> {
        let action = self.blocked_action(id).await?;
        if action.status != ActionStatus::Stuck {
            return Err(QueueError::NotResolvable {
                id,
                status: action.status,
            });
        }
        self.store.reset_action(id, None).await?;
        Ok(())
    }

    pub async fn prune_synced(&self, created_before: i64) -> Result<u64, QueueError> {
        Ok(self.store.prune_synced_actions(created_before).await?)
    }

    async fn blocked_action(&self, id: ActionId) -> Result<PendingAction, QueueError> {
        let action = self
            .store
            .get_action(id)
            .await?
            .filter(|action| !action.synced)
            .ok_or(QueueError::MissingAction(id))?;
        if !action.status.is_blocked() {
            return Err(QueueError::NotResolvable {
                id,
                status: action.status,
            });
        }
        Ok(action)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
