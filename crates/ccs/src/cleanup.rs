//! Process-wide cleanup registry and termination handling.
//!
//! Anything that must not be left behind on an interrupt (session refcounts,
//! child processes) registers a closure here. SIGINT runs the set and exits
//! 130; SIGTERM runs it and exits 0.

use std::sync::{Mutex, OnceLock};

type Cleanup = Box<dyn FnOnce() + Send>;

fn registry() -> &'static Mutex<Vec<Cleanup>> {
    static REGISTRY: OnceLock<Mutex<Vec<Cleanup>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Registers a cleanup to run on normal exit or termination. Each closure
/// runs at most once.
pub fn register(cleanup: impl FnOnce() + Send + 'static) {
    let mut cleanups = registry().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    cleanups.push(Box::new(cleanup));
}

/// Runs and drains every registered cleanup.
pub fn run_all() {
    let drained: Vec<Cleanup> = {
        let mut cleanups = registry().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        cleanups.drain(..).collect()
    };
    for cleanup in drained {
        cleanup();
    }
}

/// Installs SIGINT → exit 130 and SIGTERM → exit 0, both running the
/// cleanup set first.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        tokio::spawn(async {
            let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
                return;
            };
            let Ok(mut terminate) = signal(SignalKind::terminate()) else {
                return;
            };
            let code = tokio::select! {
                _ = interrupt.recv() => 130,
                _ = terminate.recv() => 0,
            };
            run_all();
            std::process::exit(code);
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                run_all();
                std::process::exit(130);
            }
        });
    }
}
