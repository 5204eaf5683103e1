use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fieldbook_core::FieldbookClient;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;

use crate::sync::backoff::{Backoff, RetryPolicy};
use crate::sync::connectivity::{ConnectivitySignal, SyncTrigger};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::queue::ActionQueue;
use crate::sync::store::{self, LocalStore, StoreLocation, StoreWarning};

const DEFAULT_API_URL: &str = "https://api.fieldbook.app";
const DB_FILE_NAME: &str = "fieldbook.db";
const DEFAULT_PROBE_SECS: u64 = 15;
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_REFRESH_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_ATTEMPTS: u64 = 8;
const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;
const SYNCED_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub db_path: PathBuf,
    pub probe_interval: Duration,
    pub poll_interval: Duration,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = match lookup("FIELDBOOK_DATA_DIR") {
            Some(value) => match dirs::home_dir() {
                Some(home) => expand_with_home(&value, &home),
                None => PathBuf::from(value),
            }
            .join(DB_FILE_NAME),
            None => store::default_db_path().context("cannot locate the data directory")?,
        };
        let api_url = lookup("FIELDBOOK_API_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let token = lookup("FIELDBOOK_TOKEN").filter(|value| !value.trim().is_empty());

        Ok(Self {
            api_url,
            token,
            db_path,
            probe_interval: Duration::from_secs(read_u64_var(
                &lookup,
                "FIELDBOOK_PROBE_SECS",
                DEFAULT_PROBE_SECS,
            )),
            poll_interval: Duration::from_secs(read_u64_var(
                &lookup,
                "FIELDBOOK_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            refresh_interval: Duration::from_secs(read_u64_var(
                &lookup,
                "FIELDBOOK_REFRESH_SECS",
                DEFAULT_REFRESH_SECS,
            )),
            request_timeout: Duration::from_millis(read_u64_var(
                &lookup,
                "FIELDBOOK_REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )),
            max_attempts: read_u64_var(&lookup, "FIELDBOOK_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)
                .min(u64::from(u32::MAX)) as u32,
            backoff_base: Duration::from_millis(read_u64_var(
                &lookup,
                "FIELDBOOK_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )),
            backoff_max: Duration::from_secs(read_u64_var(
                &lookup,
                "FIELDBOOK_BACKOFF_MAX_SECS",
                DEFAULT_BACKOFF_MAX_SECS,
            )),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Backoff::new(self.backoff_base, self.backoff_max, true),
            self.max_attempts,
        )
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    orchestrator: Arc<SyncOrchestrator>,
    store_warning: Option<StoreWarning>,
    signal_tx: mpsc::UnboundedSender<ConnectivitySignal>,
    signal_rx: mpsc::UnboundedReceiver<ConnectivitySignal>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let token = config
            .token
            .clone()
            .context("FIELDBOOK_TOKEN is not set")?;
        let (store, store_warning) = LocalStore::open_or_fallback(&config.db_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open local store at {}; run with --reset-local-data to start over",
                    config.db_path.display()
                )
            })?;
        let client = FieldbookClient::with_timeout(&config.api_url, token, config.request_timeout)
            .context("invalid api configuration")?;
        let orchestrator = Arc::new(SyncOrchestrator::new(
            client,
            store,
            config.retry_policy(),
        ));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            orchestrator,
            store_warning,
            signal_tx,
            signal_rx,
        })
    }

    pub fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn store_warning(&self) -> Option<&StoreWarning> {
        self.store_warning.as_ref()
    }

    /// Channel for platform connectivity events from the embedding app.
    pub fn signal_sender(&self) -> mpsc::UnboundedSender<ConnectivitySignal> {
        self.signal_tx.clone()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let Self {
            config,
            orchestrator,
            store_warning,
            signal_tx,
            mut signal_rx,
        } = self;

        tracing::info!(
            api_url = %config.api_url,
            db = %config.db_path.display(),
            persistent = store_warning.is_none(),
            "fieldbookd started"
        );
        if let Some(warning) = &store_warning {
            tracing::warn!("{warning}");
        }

        let probe_orchestrator = Arc::clone(&orchestrator);
        let probe_interval = config.probe_interval;
        let probe_handle = tokio::spawn(async move {
            loop {
                if let Err(err) = probe_orchestrator.probe().await {
                    tracing::warn!(error = %err, "probe drain failed");
                }
                tokio::time::sleep(probe_interval).await;
            }
        });

        let poll_orchestrator = Arc::clone(&orchestrator);
        let poll_interval = config.poll_interval;
        let poll_handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if let Err(err) = poll_orchestrator.trigger(SyncTrigger::Poll).await {
                    tracing::warn!(error = %err, "poll drain failed");
                }
            }
        });

        let refresh_orchestrator = Arc::clone(&orchestrator);
        let refresh_interval = config.refresh_interval;
        let refresh_handle = tokio::spawn(async move {
            loop {
                if refresh_orchestrator.phase().is_online() {
                    match refresh_orchestrator.refresh_cache().await {
                        Ok(summary) => tracing::debug!(?summary, "background refresh done"),
                        Err(err) => tracing::warn!(error = %err, "background refresh failed"),
                    }
                    if let Err(err) = refresh_orchestrator.prune_synced(SYNCED_RETENTION).await {
                        tracing::warn!(error = %err, "pruning synced actions failed");
                    }
                }
                tokio::time::sleep(refresh_interval).await;
            }
        });

        let mut status_rx = orchestrator.subscribe();
        let status_handle = tokio::spawn(async move {
            while status_rx.changed().await.is_ok() {
                let status = *status_rx.borrow_and_update();
                tracing::info!(
                    online = status.is_online,
                    syncing = status.is_syncing,
                    pending = status.pending_count,
                    stuck = status.stuck_count,
                    "sync status"
                );
            }
        });

        let signal_orchestrator = Arc::clone(&orchestrator);
        let signal_handle = tokio::spawn(async move {
            while let Some(signal) = signal_rx.recv().await {
                tracing::debug!(?signal, "connectivity signal");
                if let Err(err) = signal_orchestrator.handle_signal(signal).await {
                    tracing::warn!(error = %err, ?signal, "signal handling failed");
                }
            }
        });

        let foreground_handle = spawn_foreground_listener(signal_tx.clone())?;

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutting down");

        orchestrator.connectivity_lost();
        probe_handle.abort();
        poll_handle.abort();
        refresh_handle.abort();
        status_handle.abort();
        signal_handle.abort();
        if let Some(handle) = foreground_handle {
            handle.abort();
        }
        drop(signal_tx);
        orchestrator.queue().store().close().await;
        Ok(())
    }
}

/// SIGUSR1 stands in for "app came to the foreground".
#[cfg(unix)]
fn spawn_foreground_listener(
    signal_tx: mpsc::UnboundedSender<ConnectivitySignal>,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 =
        signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
    Ok(Some(tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            if signal_tx.send(ConnectivitySignal::Foreground).is_err() {
                break;
            }
        }
    })))
}

#[cfg(not(unix))]
fn spawn_foreground_listener(
    _signal_tx: mpsc::UnboundedSender<ConnectivitySignal>,
) -> anyhow::Result<Option<tokio::task::JoinHandle<()>>> {
    Ok(None)
}

/// Human-readable summary of the local queue for `--status`.
pub async fn status_report(db_path: &Path) -> anyhow::Result<String> {
    let store = LocalStore::open(&StoreLocation::File(db_path.to_path_buf()))
        .await
        .with_context(|| format!("failed to open local store at {}", db_path.display()))?;
    let report = render_status_report(&ActionQueue::new(store.clone()), db_path).await;
    store.close().await;
    report
}

/// Wipes the local store. Returns how many unsynced actions were lost.
pub async fn reset_local_data(db_path: &Path) -> anyhow::Result<usize> {
    let lost = match LocalStore::open(&StoreLocation::File(db_path.to_path_buf())).await {
        Ok(store) => {
            let count = store.count_unsynced_actions().await.unwrap_or(0);
            store.close().await;
            count
        }
        Err(err) => {
            tracing::warn!(error = %err, "store unreadable, unsynced actions cannot be counted");
            0
        }
    };
    if lost > 0 {
        tracing::warn!(lost, "discarding unsynced actions");
    }
    let store = LocalStore::reset(db_path)
        .await
        .with_context(|| format!("failed to reset local store at {}", db_path.display()))?;
    store.close().await;
    Ok(lost)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
