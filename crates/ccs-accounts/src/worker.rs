use std::sync::{Arc, Mutex};
use std::time::Duration;

use ccs_provider::{Provider, ALL_PROVIDERS};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

use crate::refresh::RefreshEngine;
use crate::registry::AccountStore;
use crate::token::TokenDocument;
use crate::now_ms;

/// Default walk interval for the background refresh worker.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// One account's result from the latest worker cycle.
#[derive(Clone, Debug)]
pub struct WorkerCycleEntry {
    pub provider: Provider,
    pub account_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Periodic preemptive token refresh.
///
/// Every cycle walks all registered accounts and refreshes any token that is
/// inside the 45-minute horizon and not delegated to the sidecar. Network
/// errors are retried by the engine and logged; they never escape the worker
/// task. The worker stops cleanly on SIGINT/SIGTERM or an explicit shutdown.
pub struct RefreshWorker {
    store: AccountStore,
    engine: RefreshEngine,
    interval: Duration,
}

impl RefreshWorker {
    pub fn new(store: AccountStore, engine: RefreshEngine) -> Self {
        Self {
            store,
            engine,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawns the worker task and returns its handle.
    pub fn spawn(self) -> RefreshWorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let last_cycle: Arc<Mutex<Vec<WorkerCycleEntry>>> = Arc::new(Mutex::new(Vec::new()));

        let cycle_sink = Arc::clone(&last_cycle);
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a fresh launch
            // does not race the interactive flow for the same token files.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let entries = self.run_cycle().await;
                        if let Ok(mut sink) = cycle_sink.lock() {
                            *sink = entries;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("refresh worker stopping");
                        break;
                    }
                    _ = termination_signal() => {
                        info!("refresh worker stopping on termination signal");
                        break;
                    }
                }
            }
        });

        RefreshWorkerHandle {
            shutdown: shutdown_tx,
            task,
            last_cycle,
        }
    }

    async fn run_cycle(&self) -> Vec<WorkerCycleEntry> {
        let mut entries = Vec::new();
        let now = now_ms();

        // The Gemini CLI's own credential file is refreshed in place, in its
        // native shape, alongside the managed copies under auth/.
        if let Some(native) = RefreshEngine::gemini_native_credentials_path() {
            let due = TokenDocument::load(&native)
                .map(|token| token.within_refresh_horizon(now))
                .unwrap_or(false);
            if due {
                let result = self.engine.refresh_file(Provider::Gemini, &native).await;
                entries.push(WorkerCycleEntry {
                    provider: Provider::Gemini,
                    account_id: "gemini-cli-native".to_string(),
                    success: result.is_ok(),
                    error: result.err().map(|err| err.to_string()),
                });
            }
        }

        for provider in ALL_PROVIDERS {
            if provider.refresh_delegated() {
                continue;
            }
            for account in self.store.list(provider) {
                let Some(path) = self.store.locate_token_file(&account.token_file) else {
                    continue;
                };
                let due = match TokenDocument::load(&path) {
                    Ok(token) => token.within_refresh_horizon(now),
                    Err(err) => {
                        debug!(%provider, account = %account.id, error = %err, "token unreadable, skipping");
                        continue;
                    }
                };
                if !due {
                    continue;
                }
                let entry = match self.engine.refresh_file(provider, &path).await {
                    Ok(_) => WorkerCycleEntry {
                        provider,
                        account_id: account.id.clone(),
                        success: true,
                        error: None,
                    },
                    Err(err) => WorkerCycleEntry {
                        provider,
                        account_id: account.id.clone(),
                        success: false,
                        error: Some(err.to_string()),
                    },
                };
                if let Some(error) = &entry.error {
                    debug!(%provider, account = %entry.account_id, %error, "background refresh failed");
                }
                entries.push(entry);
            }
        }
        entries
    }
}

/// Running worker. Dropping the handle aborts the task; prefer
/// [`Self::shutdown`] for a clean stop.
pub struct RefreshWorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    last_cycle: Arc<Mutex<Vec<WorkerCycleEntry>>>,
}

impl RefreshWorkerHandle {
    /// Results from the most recent completed cycle, for diagnostics.
    pub fn last_cycle(&self) -> Vec<WorkerCycleEntry> {
        self.last_cycle
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Signals the worker and waits for it to finish its current step.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(unix)]
async fn termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(_) => return std::future::pending().await,
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
