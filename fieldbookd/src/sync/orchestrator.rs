use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fieldbook_core::{ActionKind, FieldbookClient, FieldbookError};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::cache::{EntityKind, ReadCache};
use super::connectivity::{ConnectivitySignal, PhaseEvent, SyncPhase, SyncStatus, SyncTrigger};
use super::now_unix;
use super::queue::{ActionId, ActionQueue, PendingAction, QueueError};
use super::replay::{DrainOutcome, DrainResult, ReplayEngine, ReplayError};
use super::store::{LocalStore, StoreError};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("api error: {0}")]
    Api(#[from] FieldbookError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshSummary {
    pub clients: usize,
    pub sessions: usize,
    pub invoices: usize,
}

/// Decides when to drain and keeps the status surface current.
pub struct SyncOrchestrator {
    client: FieldbookClient,
    queue: ActionQueue,
    cache: ReadCache,
    engine: ReplayEngine,
    phase: watch::Sender<SyncPhase>,
    status: watch::Sender<SyncStatus>,
    draining: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    pub fn new(client: FieldbookClient, store: LocalStore, policy: RetryPolicy) -> Self {
        let queue = ActionQueue::new(store.clone());
        let engine = ReplayEngine::new(client.clone(), queue.clone(), policy);
        let (phase, _) = watch::channel(SyncPhase::Offline);
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            client,
            queue,
            cache: ReadCache::new(store),
            engine,
            phase,
            status,
            draining: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Durably queues a user mutation and projects it into the cache.
    /// Only the durable write can fail the call.
    pub async fn enqueue(&self, kind: ActionKind, payload: Value) -> Result<ActionId, QueueError> {
        let id = self.queue.enqueue(kind, payload).await?;
        match self.queue.get(id).await {
            Ok(Some(action)) => {
                if let Err(err) = self.cache.project_action(&action).await {
                    tracing::warn!(action_id = id, error = %err, "optimistic projection failed");
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(action_id = id, error = %err, "cannot reload queued action"),
        }
        self.refresh_status().await;
        Ok(id)
    }

    /// Runs one drain if online, something is pending and no drain is
    /// running. Returns `None` when the trigger was a no-op.
    pub async fn trigger(&self, trigger: SyncTrigger) -> Result<Option<DrainResult>, ReplayError> {
        if !self.phase().is_online() {
            return Ok(None);
        }
        if self.queue.pending_count().await? == 0 {
            return Ok(None);
        }
        if self.draining.swap(true, Ordering::AcqRel) {
            tracing::debug!(%trigger, "drain already running");
            return Ok(None);
        }
        let _guard = DrainGuard(&self.draining);

        let token = CancellationToken::new();
        *self.cancel_slot() = Some(token.clone());
        // The connection may have dropped while the queue was being counted.
        if !self.phase().is_online() {
            self.cancel_slot().take();
            tracing::debug!(%trigger, "went offline before drain started");
            return Ok(None);
        }
        self.transition(PhaseEvent::DrainStarted);
        self.refresh_status().await;
        tracing::info!(%trigger, pending = self.status().pending_count, "drain started");

        let drained = self.engine.drain(&token).await;
        self.cancel_slot().take();

        let outcome = match &drained {
            Ok(result) => result.outcome,
            Err(err) => {
                tracing::warn!(error = %err, "drain aborted by local store error");
                DrainOutcome::HaltedTransient
            }
        };
        let stuck = self.blocked_count_or_last().await;
        self.transition(PhaseEvent::DrainFinished { outcome, stuck });
        self.refresh_status().await;

        let result = drained?;
        tracing::info!(
            %trigger,
            outcome = ?result.outcome,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            pending = self.status().pending_count,
            "drain finished"
        );
        Ok(Some(result))
    }

    /// Marks the API reachable and starts a reconnect drain.
    pub async fn connectivity_restored(&self) -> Result<Option<DrainResult>, ReplayError> {
        if self.phase().is_online() {
            return Ok(None);
        }
        let stuck = self.blocked_count_or_last().await;
        self.transition(PhaseEvent::ConnectionRestored { stuck });
        self.refresh_status().await;
        self.trigger(SyncTrigger::Reconnect).await
    }

    /// Goes offline at once, abandoning any in-flight delivery.
    pub fn connectivity_lost(&self) {
        if let Some(token) = self.cancel_slot().take() {
            token.cancel();
        }
        self.transition(PhaseEvent::ConnectionLost);
        let phase = self.phase();
        self.status.send_modify(|status| {
            status.is_online = phase.is_online();
            status.is_syncing = phase.is_syncing();
        });
    }

    pub async fn handle_signal(
        &self,
        signal: ConnectivitySignal,
    ) -> Result<Option<DrainResult>, ReplayError> {
        match signal {
            // An interface coming up says nothing about the API; ask it.
            ConnectivitySignal::Online => self.probe().await,
            ConnectivitySignal::Offline => {
                self.connectivity_lost();
                Ok(None)
            }
            ConnectivitySignal::Foreground if self.phase().is_online() => {
                self.trigger(SyncTrigger::Foreground).await
            }
            ConnectivitySignal::Foreground => self.probe().await,
        }
    }

    /// Checks API liveness and moves the phase accordingly.
    pub async fn probe(&self) -> Result<Option<DrainResult>, ReplayError> {
        match self.client.ping().await {
            Ok(()) => self.connectivity_restored().await,
            Err(err) => {
                if self.phase().is_online() {
                    tracing::info!(error = %err, "api unreachable");
                    self.connectivity_lost();
                } else {
                    tracing::debug!(error = %err, "api still unreachable");
                }
                Ok(None)
            }
        }
    }

    /// Refetches server state and stores it authoritatively.
    pub async fn refresh_cache(&self) -> Result<RefreshSummary, RefreshError> {
        // Actions still unsynced here may confirm while the fetch is in
        // flight; their confirmations must outrank this snapshot.
        let watermark = self.queue.confirmed_through().await?;
        let clients = self.client.list_clients().await?;
        let sessions = self.client.list_sessions().await?;
        let invoices = self.client.list_invoices().await?;
        let active = self.client.get_active_session().await?;

        let summary = RefreshSummary {
            clients: self
                .cache
                .apply_snapshot(EntityKind::Client, &clients, watermark)
                .await?,
            sessions: self
                .cache
                .apply_snapshot(EntityKind::Session, &sessions, watermark)
                .await?,
            invoices: self
                .cache
                .apply_snapshot(EntityKind::Invoice, &invoices, watermark)
                .await?,
        };
        self.cache
            .apply_active_snapshot(active.as_ref(), watermark)
            .await?;
        tracing::debug!(?summary, watermark, "cache refreshed");
        Ok(summary)
    }

    pub async fn discard(&self, id: ActionId) -> Result<PendingAction, QueueError> {
        let action = self.queue.discard(id).await?;
        self.cache.revert_action(&action).await?;
        self.after_resolution().await;
        Ok(action)
    }

    pub async fn resubmit(&self, id: ActionId, payload: Value) -> Result<(), QueueError> {
        self.queue.resubmit(id, payload).await?;
        if let Some(action) = self.queue.get(id).await? {
            self.cache.project_action(&action).await?;
        }
        self.after_resolution().await;
        Ok(())
    }

    pub async fn retry(&self, id: ActionId) -> Result<(), QueueError> {
        self.queue.retry(id).await?;
        self.after_resolution().await;
        Ok(())
    }

    /// Deletes synced actions older than `retention`.
    pub async fn prune_synced(&self, retention: Duration) -> Result<u64, QueueError> {
        let cutoff = now_unix().saturating_sub(retention.as_secs() as i64);
        let pruned = self.queue.prune_synced(cutoff).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "synced actions pruned");
        }
        Ok(pruned)
    }

    async fn after_resolution(&self) {
        let stuck = self.blocked_count_or_last().await;
        self.transition(PhaseEvent::StuckChanged { stuck });
        self.refresh_status().await;
    }

    fn transition(&self, event: PhaseEvent) {
        let mut changed = None;
        self.phase.send_if_modified(|phase| {
            let next = phase.apply(event);
            if next == *phase {
                return false;
            }
            changed = Some((*phase, next));
            *phase = next;
            true
        });
        if let Some((from, to)) = changed {
            tracing::info!(%from, %to, "sync phase changed");
        }
    }

    async fn refresh_status(&self) {
        let current = self.status();
        let pending = match self.queue.pending_count().await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "cannot count pending actions");
                current.pending_count
            }
        };
        let stuck = self.blocked_count_or_last().await;
        self.status
            .send_replace(SyncStatus::new(self.phase(), pending, stuck));
    }

    async fn blocked_count_or_last(&self) -> usize {
        match self.queue.blocked_count().await {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "cannot count blocked actions");
                self.status().stuck_count
            }
        }
    }

    fn cancel_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
