use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// On-disk record of the running sidecar and its logical session refcount.
///
/// Presence means "at least one session is holding the sidecar open" (or the
/// sidecar was left to persist after the last session, which is the
/// default). Liveness is never assumed: recovery probes `pid` and `port`
/// before trusting the record.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLock {
    pub pid: u32,
    pub port: u16,
    pub started_at: i64,
    pub session_count: u32,
}

impl SessionLock {
    /// Reads the lock file; any read or parse failure counts as "no lock".
    pub fn load(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(lock) => Some(lock),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "session lock unreadable");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let contents = serde_json::to_vec_pretty(self)?;
        ccs_provider::write_atomic(path, &contents)
    }

    pub fn remove(path: &Path) {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), error = %err, "failed to remove session lock");
            }
        }
    }

    /// `pid` alive and the declared port accepting TCP.
    pub async fn is_live(&self) -> bool {
        pid_alive(self.pid) && port_open(self.port).await
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence without touching the process.
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Windows liveness falls through to the TCP probe.
    true
}

/// Whether anything is accepting connections on loopback `port`.
pub async fn port_open(port: u16) -> bool {
    matches!(
        time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}
