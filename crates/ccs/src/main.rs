#![forbid(unsafe_code)]
//! `ccs` is a multi-profile launcher and credential broker for the Claude
//! Code CLI. One command resolves a profile to an execution strategy, keeps
//! the credentials behind it valid, supervises any helper processes, and
//! hands stdio to the downstream CLI with an environment that routes its
//! traffic.

mod classifier;
mod cleanup;
mod config;
mod dispatcher;
mod meta;
mod process;
mod thinking;
mod websearch;

use anyhow::Context;
use ccs_accounts::{AccountStore, RefreshEngine, RefreshWorker};
use ccs_provider::ConfigRoot;
use tracing_subscriber::EnvFilter;

use classifier::{classify, ClassifyError, Strategy};
use config::LauncherConfig;
use dispatcher::Dispatcher;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_env("CCS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    cleanup::run_all();
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let root = ConfigRoot::resolve().context("cannot determine a home directory")?;
    root.materialize()
        .with_context(|| format!("failed to prepare {}", root.root().display()))?;
    let config = LauncherConfig::load(&root);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let classified = match classify(&args, &root, &config) {
        Ok(classified) => classified,
        Err(ClassifyError::ProfileNotFound {
            name,
            candidates,
            suggestions,
        }) => {
            eprintln!("profile `{name}` not found");
            if candidates.is_empty() {
                eprintln!("no profiles are configured yet; see `ccs help`");
            } else {
                eprintln!("available profiles: {}", candidates.join(", "));
            }
            if let Some(best) = suggestions.first() {
                eprintln!("Did you mean: {best}?");
            }
            return Ok(1);
        }
    };

    if let Strategy::Meta { command } = &classified.strategy {
        let command = command.clone();
        return meta::run(&root, &config, &command, &classified.passthrough).await;
    }

    cleanup::install_signal_handlers();

    // Keep locally-owned tokens fresh for the lifetime of the session.
    let worker = RefreshWorker::new(AccountStore::new(root.clone()), RefreshEngine::new()).spawn();

    let dispatcher = Dispatcher::new(root, config);
    let code = dispatcher.dispatch(classified).await;
    worker.shutdown().await;
    code
}
