use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ccs_provider::ConfigRoot;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config_gen::SidecarConfig;
use crate::error::CliproxyError;
use crate::lock::{pid_alive, port_open, SessionLock};

const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL: Duration = Duration::from_millis(100);
const READY_PREFIX: &str = "PROXY_READY:";

/// A sidecar that is up and accepting connections.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunningSidecar {
    pub pid: u32,
    pub port: u16,
    /// An already-running process was adopted instead of spawning.
    pub reused: bool,
}

/// Outcome of [`Supervisor::stop`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StopReport {
    pub was_running: bool,
    /// Session refcount recorded in the lock at stop time, for reporting.
    pub sessions_at_stop: u32,
}

/// Supervises the one-per-user sidecar process.
///
/// The session lock is the authoritative record of a running sidecar;
/// recovery re-checks `pid` liveness and the TCP port before trusting it.
/// The sidecar's stdio goes to `cliproxy/sidecar.log`, which also carries
/// the `PROXY_READY:<port>` readiness line; routing it through a file keeps
/// the process writable after this launcher exits, since the sidecar
/// persists past the last session by default.
#[derive(Clone, Debug)]
pub struct Supervisor {
    root: ConfigRoot,
    binary: PathBuf,
}

impl Supervisor {
    pub fn new(root: ConfigRoot, binary: PathBuf) -> Self {
        Self { root, binary }
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.cliproxy_dir().join("sidecar.log")
    }

    /// Ensures a live sidecar and takes a session reference on it.
    ///
    /// A live lock (pid alive, port open) is reused with its count bumped; a
    /// stale lock is recovered and a fresh process started on a free port
    /// with a readiness handshake.
    pub async fn ensure_running(
        &self,
        preferred_port: Option<u16>,
    ) -> Result<RunningSidecar, CliproxyError> {
        let lock_path = self.root.session_lock_path();
        if let Some(mut lock) = SessionLock::load(&lock_path) {
            if lock.is_live().await {
                lock.session_count = lock.session_count.saturating_add(1);
                lock.save(&lock_path).map_err(|source| CliproxyError::Io {
                    path: lock_path.clone(),
                    source,
                })?;
                debug!(pid = lock.pid, port = lock.port, sessions = lock.session_count, "reusing running sidecar");
                return Ok(RunningSidecar {
                    pid: lock.pid,
                    port: lock.port,
                    reused: true,
                });
            }
            warn!(pid = lock.pid, port = lock.port, "recovering stale session lock");
            SessionLock::remove(&lock_path);
        }

        self.start_new(preferred_port).await
    }

    async fn start_new(&self, preferred_port: Option<u16>) -> Result<RunningSidecar, CliproxyError> {
        let port = match preferred_port {
            Some(port) => {
                if port_open(port).await {
                    return Err(CliproxyError::ProxyStartFailed {
                        reason: format!("requested port {port} is already in use"),
                    });
                }
                port
            }
            None => free_port()?,
        };

        let mut config = SidecarConfig::load(&self.root);
        if config.port != port {
            config.port = port;
            config.write(&self.root)?;
        }

        let log_path = self.log_path();
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).map_err(|source| CliproxyError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        // Truncate so the readiness scan only sees this launch.
        let log_file = fs::File::create(&log_path).map_err(|source| CliproxyError::Io {
            path: log_path.clone(),
            source,
        })?;
        let log_clone = log_file.try_clone().map_err(|source| CliproxyError::Io {
            path: log_path.clone(),
            source,
        })?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(self.root.sidecar_config_path())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(log_clone));

        let mut child = command.spawn().map_err(|source| CliproxyError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let ready_port = match self.await_ready(&mut child, &log_path).await {
            Ok(port) => port,
            Err(err) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(err);
            }
        };
        if ready_port != port {
            debug!(expected = port, actual = ready_port, "sidecar chose a different port");
        }

        let lock = SessionLock {
            pid,
            port: ready_port,
            started_at: epoch_ms(),
            session_count: 1,
        };
        let lock_path = self.root.session_lock_path();
        lock.save(&lock_path).map_err(|source| CliproxyError::Io {
            path: lock_path,
            source,
        })?;
        info!(pid, port = ready_port, "sidecar started");
        Ok(RunningSidecar {
            pid,
            port: ready_port,
            reused: false,
        })
    }

    /// Scans the launch log for `PROXY_READY:<port>` within the readiness
    /// timeout. Early child exit or timeout fails with the drained output as
    /// the cause.
    async fn await_ready(
        &self,
        child: &mut tokio::process::Child,
        log_path: &std::path::Path,
    ) -> Result<u16, CliproxyError> {
        let deadline = time::Instant::now() + READY_TIMEOUT;
        loop {
            if let Some(port) = fs::read_to_string(log_path)
                .ok()
                .as_deref()
                .and_then(scan_ready)
            {
                return Ok(port);
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(CliproxyError::ProxyStartFailed {
                    reason: format!(
                        "sidecar exited with {status} before becoming ready: {}",
                        drained_output(log_path)
                    ),
                });
            }
            if time::Instant::now() >= deadline {
                return Err(CliproxyError::ProxyStartFailed {
                    reason: format!(
                        "no readiness signal within {READY_TIMEOUT:?}: {}",
                        drained_output(log_path)
                    ),
                });
            }
            time::sleep(READY_POLL).await;
        }
    }

    /// Drops one session reference. The sidecar keeps running; an explicit
    /// [`Self::stop`] is the only thing that terminates it.
    pub fn release_session(&self) {
        let lock_path = self.root.session_lock_path();
        let Some(mut lock) = SessionLock::load(&lock_path) else {
            return;
        };
        lock.session_count = lock.session_count.saturating_sub(1);
        if let Err(err) = lock.save(&lock_path) {
            debug!(error = %err, "failed to write session count");
        }
    }

    /// Terminates the sidecar and removes the lock. Idempotent: stopping a
    /// stopped sidecar reports `was_running: false`.
    pub async fn stop(&self) -> Result<StopReport, CliproxyError> {
        let lock_path = self.root.session_lock_path();
        let Some(lock) = SessionLock::load(&lock_path) else {
            return Ok(StopReport {
                was_running: false,
                sessions_at_stop: 0,
            });
        };

        let was_running = pid_alive(lock.pid);
        if was_running {
            terminate(lock.pid);
        }
        SessionLock::remove(&lock_path);
        info!(pid = lock.pid, sessions = lock.session_count, "sidecar stopped");
        Ok(StopReport {
            was_running,
            sessions_at_stop: lock.session_count,
        })
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Ok(pid) = i32::try_from(pid) {
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

fn free_port() -> Result<u16, CliproxyError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|source| {
        CliproxyError::ProxyStartFailed {
            reason: format!("could not reserve a loopback port: {source}"),
        }
    })?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|source| CliproxyError::ProxyStartFailed {
            reason: format!("could not read reserved port: {source}"),
        })
}

/// Extracts the port from the first `PROXY_READY:<port>` line.
fn scan_ready(output: &str) -> Option<u16> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix(READY_PREFIX) {
            if let Ok(port) = rest.trim().parse() {
                return Some(port);
            }
        }
    }
    None
}

fn drained_output(log_path: &std::path::Path) -> String {
    let contents = fs::read_to_string(log_path).unwrap_or_default();
    let tail: Vec<&str> = contents.lines().rev().take(10).collect();
    let mut lines: Vec<&str> = tail.into_iter().rev().collect();
    if lines.is_empty() {
        lines.push("(no output)");
    }
    lines.join(" | ")
}

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_line_parses() {
        assert_eq!(scan_ready("starting\nPROXY_READY:1317\n"), Some(1317));
        assert_eq!(scan_ready("  PROXY_READY: 8080  "), Some(8080));
        assert_eq!(scan_ready("PROXY_READY:"), None);
        assert_eq!(scan_ready("ready"), None);
    }
}
