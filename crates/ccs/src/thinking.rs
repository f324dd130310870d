//! Runner for the short-lived thinking-mode proxy the `glmt` profile needs.
//!
//! The proxy itself is a collaborator binary (override with
//! `CCS_THINKING_PROXY`); its contract matches the sidecar's: print
//! `PROXY_READY:<port>` on stdout once listening. The runner forwards the
//! profile's credentials to the proxy, points the downstream CLI at it with
//! a pinned model, and tears the proxy down when the CLI exits.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use crate::config::SettingsProfile;
use crate::process;

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const GLMT_MODEL: &str = "glm-4.6";

fn proxy_binary() -> PathBuf {
    std::env::var_os("CCS_THINKING_PROXY")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("ccs-glmt-proxy"))
}

/// Launches the thinking proxy, hands stdio to the downstream CLI against
/// it, and propagates the CLI's exit. The proxy gets SIGTERM as soon as the
/// CLI is done; parent termination tears down both children.
pub async fn run_glmt(
    settings: &SettingsProfile,
    passthrough: &[String],
    extra_env: BTreeMap<String, String>,
) -> anyhow::Result<i32> {
    let proxy_path = proxy_binary();
    let mut proxy = Command::new(&proxy_path)
        .env("ANTHROPIC_AUTH_TOKEN", &settings.api_key)
        .env("ANTHROPIC_BASE_URL", &settings.base_url)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn thinking proxy `{}`", proxy_path.display()))?;

    let stdout = proxy
        .stdout
        .take()
        .context("thinking proxy stdout unavailable")?;
    let port = match read_ready(stdout).await {
        Ok(port) => port,
        Err(err) => {
            let _ = proxy.start_kill();
            let _ = proxy.wait().await;
            return Err(err);
        }
    };
    debug!(port, "thinking proxy ready");

    let mut env = extra_env;
    env.insert(
        "ANTHROPIC_BASE_URL".to_string(),
        format!("http://127.0.0.1:{port}"),
    );
    env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), settings.api_key.clone());
    env.insert("ANTHROPIC_MODEL".to_string(), GLMT_MODEL.to_string());
    env.insert("CCS_PROFILE_TYPE".to_string(), "glmt".to_string());

    let binary = process::claude_binary();
    let outcome = tokio::select! {
        outcome = process::run_downstream(&binary, passthrough, &env) => outcome?,
        _ = termination_signal() => {
            terminate_child(&proxy);
            let _ = proxy.start_kill();
            return Ok(130);
        }
    };

    terminate_child(&proxy);
    let _ = time::timeout(Duration::from_secs(2), proxy.wait()).await;

    Ok(outcome.exit_code())
}

/// Reads stdout lines until `PROXY_READY:<port>` or the 5 second deadline.
async fn read_ready(stdout: tokio::process::ChildStdout) -> anyhow::Result<u16> {
    let mut lines = BufReader::new(stdout).lines();
    let deadline = time::Instant::now() + READY_TIMEOUT;
    loop {
        let next = time::timeout_at(deadline, lines.next_line()).await;
        match next {
            Ok(Ok(Some(line))) => {
                if let Some(rest) = line.trim().strip_prefix("PROXY_READY:") {
                    if let Ok(port) = rest.trim().parse() {
                        return Ok(port);
                    }
                }
            }
            Ok(Ok(None)) => bail!("thinking proxy exited before becoming ready"),
            Ok(Err(err)) => return Err(err).context("failed reading thinking proxy output"),
            Err(_) => bail!("thinking proxy not ready within {READY_TIMEOUT:?}"),
        }
    }
}

fn terminate_child(child: &tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Ok(pid) = i32::try_from(pid) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
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
