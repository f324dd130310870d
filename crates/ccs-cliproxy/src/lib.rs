#![forbid(unsafe_code)]
//! Sidecar proxy integration for the `ccs` launcher.
//!
//! The sidecar is an external binary hosting an OpenAI-style API on loopback
//! and brokering to model vendors. This crate owns its whole lifecycle:
//! installing and pinning the binary, generating its config, starting it
//! with a readiness handshake and a session-refcounted lock, talking to its
//! management endpoints, and driving its interactive login flows.

mod config_gen;
mod error;
mod install;
mod lock;
mod management;
mod oauth;
mod supervisor;
mod upload;
mod version;

pub use config_gen::{ClaudeApiKeyEntry, SidecarConfig};
pub use error::CliproxyError;
pub use install::Installer;
pub use lock::{pid_alive, port_open, SessionLock};
pub use management::{
    build_base_url, ClaudeKeyRecord, ManagementClient, ManagementError, ModelDefinition,
    SidecarHealth,
};
pub use oauth::{
    cancel, has_fatal, run_preflight, FlowEvent, FlowEventBus, OauthDriver, OauthOptions,
    PreflightFinding, PreflightSeverity, Prompter, StdinPrompter,
};
pub use supervisor::{RunningSidecar, StopReport, Supervisor};
pub use upload::{publish_token, UploadTarget};
pub use version::{install_gate, InstallGate, SidecarVersion, MAX_STABLE};

#[cfg(test)]
mod tests;
