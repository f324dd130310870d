use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::process::Command;
use tracing::debug;

/// How the downstream CLI ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitOutcome {
    Code(i32),
    /// Died by signal (unix only).
    Signal(i32),
}

impl ExitOutcome {
    /// Shell-convention exit code: the code itself, or 128 plus the signal
    /// number for a signal death (130 for SIGINT).
    pub fn exit_code(self) -> i32 {
        match self {
            ExitOutcome::Code(code) => code,
            ExitOutcome::Signal(signal) => 128 + signal,
        }
    }
}

/// The downstream CLI binary: `CCS_CLAUDE_BINARY` when set, else `claude`
/// from PATH.
pub fn claude_binary() -> PathBuf {
    std::env::var_os("CCS_CLAUDE_BINARY")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("claude"))
}

/// Builds the downstream command, routing Windows script wrappers
/// (`.cmd`/`.bat`/`.ps1`) through their interpreter; everything else execs
/// directly. Arguments are always passed as separate argv entries, never
/// joined into a shell string.
pub fn downstream_command(binary: &Path, args: &[String]) -> Command {
    let extension = binary
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    let mut command = match extension.as_deref() {
        Some("cmd") | Some("bat") if cfg!(windows) => {
            let mut command = Command::new("cmd");
            command.arg("/C").arg(binary);
            command
        }
        Some("ps1") if cfg!(windows) => {
            let mut command = Command::new("powershell");
            command.args(["-NoProfile", "-File"]).arg(binary);
            command
        }
        _ => Command::new(binary),
    };
    command.args(args);
    command
}

/// Spawns the downstream CLI with inherited stdio and the given environment
/// overlay, waits for it, and reports how it ended.
pub async fn run_downstream(
    binary: &Path,
    args: &[String],
    env: &BTreeMap<String, String>,
) -> anyhow::Result<ExitOutcome> {
    let mut command = downstream_command(binary, args);
    for (key, value) in env {
        command.env(key, value);
    }
    debug!(binary = %binary.display(), ?args, "spawning downstream CLI");

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", binary.display()))?;
    let status = child.wait().await.context("failed to wait for downstream CLI")?;
    Ok(outcome_of(status))
}

pub fn outcome_of(status: std::process::ExitStatus) -> ExitOutcome {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitOutcome::Signal(signal);
        }
    }
    ExitOutcome::Code(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(ExitOutcome::Code(0).exit_code(), 0);
        assert_eq!(ExitOutcome::Code(3).exit_code(), 3);
        assert_eq!(ExitOutcome::Signal(2).exit_code(), 130);
        assert_eq!(ExitOutcome::Signal(15).exit_code(), 143);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn downstream_env_and_exit_propagate() {
        let mut env = BTreeMap::new();
        env.insert("CCS_TEST_MARKER".to_string(), "42".to_string());
        let outcome = run_downstream(
            Path::new("sh"),
            &["-c".to_string(), "exit $CCS_TEST_MARKER".to_string()],
            &env,
        )
        .await
        .unwrap();
        assert_eq!(outcome, ExitOutcome::Code(42));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_death_is_reported_as_signal() {
        let outcome = run_downstream(
            Path::new("sh"),
            &["-c".to_string(), "kill -TERM $$".to_string()],
            &BTreeMap::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ExitOutcome::Signal(15));
    }
}
