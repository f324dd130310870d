use std::net::TcpListener;

use ccs_provider::Provider;

/// Severity of one pre-flight finding. A fatal finding aborts the
/// authorization-code flow before anything is spawned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PreflightSeverity {
    Fatal,
    Warning,
    Info,
}

#[derive(Clone, Debug)]
pub struct PreflightFinding {
    pub severity: PreflightSeverity,
    pub message: String,
    pub remediation: Option<String>,
}

/// Checks the provider's callback port and the environment before an
/// authorization-code flow.
///
/// A busy port is only a warning (the driver kills the listener best-effort
/// before spawning); loopback being unbindable at all is fatal. A detected
/// SSH session gets a port-forwarding hint since the browser callback will
/// land on the wrong machine.
pub fn run_preflight(provider: Provider) -> Vec<PreflightFinding> {
    let mut findings = Vec::new();
    let port = provider.callback_port();

    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => drop(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            findings.push(PreflightFinding {
                severity: PreflightSeverity::Warning,
                message: format!("port {port} is already in use"),
                remediation: Some(format!(
                    "the process listening on {port} will be terminated before the flow starts"
                )),
            });
        }
        Err(err) => {
            findings.push(PreflightFinding {
                severity: PreflightSeverity::Fatal,
                message: format!("cannot bind 127.0.0.1:{port}: {err}"),
                remediation: Some(
                    "check local firewall rules or use the paste-callback flow".to_string(),
                ),
            });
        }
    }

    if std::env::var_os("SSH_CONNECTION").is_some() || std::env::var_os("SSH_TTY").is_some() {
        findings.push(PreflightFinding {
            severity: PreflightSeverity::Info,
            message: "SSH session detected; the browser callback cannot reach this host directly"
                .to_string(),
            remediation: Some(format!(
                "forward the callback port first: ssh -L {port}:127.0.0.1:{port} <host>"
            )),
        });
    }

    findings
}

pub fn has_fatal(findings: &[PreflightFinding]) -> bool {
    findings
        .iter()
        .any(|finding| finding.severity == PreflightSeverity::Fatal)
}
