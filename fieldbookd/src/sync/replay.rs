use std::collections::HashMap;

use fieldbook_core::{FieldbookClient, FieldbookError};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::backoff::{RetryDecision, RetryPolicy};
use super::cache;
use super::now_unix;
use super::queue::{ActionId, ActionQueue, ActionStatus, PendingAction, QueueError, is_local_id};
use super::store::StoreError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Why a drain stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The queue is empty.
    Completed,
    /// The head failed with a retryable error and was rescheduled.
    HaltedTransient,
    /// The head is waiting out an earlier backoff.
    BackingOff,
    /// The head is failed or stuck and needs the user.
    HaltedPermanent,
    /// Cancelled mid-flight; nothing was charged to the head.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    Transient,
    Permanent,
    /// Transient failures hit the attempt limit.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrainResult {
    pub succeeded: Vec<ActionId>,
    pub failed: Vec<(ActionId, DeliveryErrorKind)>,
    pub outcome: DrainOutcome,
}

impl DrainResult {
    fn new() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            outcome: DrainOutcome::Completed,
        }
    }

    fn finish(mut self, outcome: DrainOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Delivers queued actions to the API one at a time, oldest first.
#[derive(Clone)]
pub struct ReplayEngine {
    client: FieldbookClient,
    queue: ActionQueue,
    policy: RetryPolicy,
}

impl ReplayEngine {
    pub fn new(client: FieldbookClient, queue: ActionQueue, policy: RetryPolicy) -> Self {
        Self {
            client,
            queue,
            policy,
        }
    }

    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainResult, ReplayError> {
        let mut result = DrainResult::new();
        loop {
            if cancel.is_cancelled() {
                return Ok(result.finish(DrainOutcome::Abandoned));
            }
            // Re-read every step: actions may be enqueued or resolved meanwhile.
            let Some(action) = self.queue.head().await? else {
                return Ok(result.finish(DrainOutcome::Completed));
            };
            if action.status.is_blocked() {
                tracing::debug!(action = %action.describe(), "queue head needs attention");
                return Ok(result.finish(DrainOutcome::HaltedPermanent));
            }
            if action.retry_at.is_some_and(|retry_at| retry_at > now_unix()) {
                return Ok(result.finish(DrainOutcome::BackingOff));
            }

            let id_map = self.queue.store().id_map().await?;
            let mut payload = action.payload.clone();
            rewrite_local_ids(&mut payload, &id_map);
            let key = action.idempotency_key(self.queue.store().device_id());
            tracing::debug!(action_id = action.id, kind = %action.kind, attempt = action.attempt, "delivering action");

            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(action_id = action.id, "delivery abandoned, connection lost");
                    return Ok(result.finish(DrainOutcome::Abandoned));
                }
                delivery = self.client.deliver(action.kind, &payload, &key) => delivery,
            };

            match delivery {
                Ok(response) => {
                    self.confirm(&action, &payload, response.as_ref()).await?;
                    result.succeeded.push(action.id);
                }
                Err(err) => {
                    let kind = self.record_failure(&action, &err).await?;
                    result.failed.push((action.id, kind));
                    let outcome = match kind {
                        DeliveryErrorKind::Transient => DrainOutcome::HaltedTransient,
                        DeliveryErrorKind::Permanent | DeliveryErrorKind::Exhausted => {
                            DrainOutcome::HaltedPermanent
                        }
                    };
                    return Ok(result.finish(outcome));
                }
            }
        }
    }

    async fn confirm(
        &self,
        action: &PendingAction,
        delivered: &Value,
        response: Option<&Value>,
    ) -> Result<(), ReplayError> {
        let mut tx = self.queue.store().begin().await?;
        tx.mark_action_synced(action.id).await?;
        let mapping =
            cache::project_confirmation(&mut tx, action, action.entity_id(), delivered, response)
                .await?;
        tx.commit().await?;
        match mapping {
            Some((local, server)) => tracing::info!(
                action_id = action.id,
                kind = %action.kind,
                %local,
                %server,
                "action confirmed, placeholder resolved"
            ),
            None => tracing::info!(action_id = action.id, kind = %action.kind, "action confirmed"),
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        action: &PendingAction,
        err: &FieldbookError,
    ) -> Result<DeliveryErrorKind, ReplayError> {
        let store = self.queue.store();
        let message = err.to_string();
        if !err.is_retryable() {
            store
                .record_action_failure(action.id, ActionStatus::Failed, action.attempt, None, &message)
                .await?;
            tracing::warn!(action = %action.describe(), error = %message, "action rejected by server");
            return Ok(DeliveryErrorKind::Permanent);
        }

        let attempt = action.attempt.saturating_add(1);
        match self.policy.decide(attempt, now_unix()) {
            RetryDecision::RetryAt(retry_at) => {
                store
                    .record_action_failure(
                        action.id,
                        ActionStatus::Pending,
                        attempt,
                        Some(retry_at),
                        &message,
                    )
                    .await?;
                tracing::info!(
                    action_id = action.id,
                    attempt,
                    retry_at,
                    class = ?err.classification(),
                    error = %message,
                    "delivery failed, will retry"
                );
                Ok(DeliveryErrorKind::Transient)
            }
            RetryDecision::GiveUp => {
                store
                    .record_action_failure(action.id, ActionStatus::Stuck, attempt, None, &message)
                    .await?;
                tracing::warn!(
                    action = %action.describe(),
                    attempt,
                    "delivery keeps failing, action is stuck"
                );
                Ok(DeliveryErrorKind::Exhausted)
            }
        }
    }
}

/// Replaces placeholder ids anywhere in `value` with their server ids.
pub fn rewrite_local_ids(value: &mut Value, id_map: &HashMap<String, String>) {
    match value {
        Value::String(text) if is_local_id(text) => {
            if let Some(server_id) = id_map.get(text.as_str()) {
                *text = server_id.clone();
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_local_ids(item, id_map);
            }
        }
        Value::Object(fields) => {
            for field in fields.values_mut() {
                rewrite_local_ids(field, id_map);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
#[path = "replay_tests.rs"]
mod tests;
