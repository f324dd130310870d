//! Drives the three sidecar login flows: authorization-code with a local
//! callback, device-code polling, and the paste-callback fallback for
//! headless hosts.
//!
//! Each flow is a small state machine over the sidecar's stdout milestones
//! (auth URL, callback readiness, project prompt, completion) with timeouts,
//! external cancellation, and signal cleanup. Whatever the path, completion
//! is always the same: the newest matching token file is registered in the
//! account registry, then best-effort published to an optional remote
//! endpoint.

mod events;
mod milestones;
mod paste;
mod preflight;

pub use events::{FlowEvent, FlowEventBus};
pub use preflight::{has_fatal, run_preflight, PreflightFinding, PreflightSeverity};

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ccs_accounts::{Account, AccountStore, TokenDocument};
use ccs_provider::{validate_nickname, ConfigRoot, Provider};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::CliproxyError;
use crate::upload::{publish_token, UploadTarget};
use milestones::{parse_milestone, Milestone};

const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const HEADLESS_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const ARE_YOU_THERE_AFTER: Duration = Duration::from_secs(2);

/// Per-invocation knobs for a login flow.
#[derive(Clone, Debug, Default)]
pub struct OauthOptions {
    /// Skip the existing-account prompt; the caller explicitly wants another
    /// account.
    pub add: bool,
    /// Mandatory for no-email providers; prompted for when missing.
    pub nickname: Option<String>,
    pub headless: bool,
    pub no_browser: bool,
    /// Kiro only: keep the browser profile instead of an incognito window.
    pub no_incognito: bool,
    /// The flow is driven from the web UI; prompts are published as events
    /// instead of auto-answered.
    pub from_ui: bool,
}

/// Interactive questions the driver may need answered mid-flow. The CLI
/// wires this to stdin; tests inject canned answers.
pub trait Prompter: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
    fn input(&self, message: &str) -> Option<String>;
}

/// Reads answers from the controlling terminal.
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&self, message: &str) -> bool {
        eprint!("{message} [y/N] ");
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }

    fn input(&self, message: &str) -> Option<String> {
        eprint!("{message}: ");
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer).ok()?;
        let trimmed = answer.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

/// States an interactive flow moves through; milestones, timeouts, child
/// exit, and external cancel drive the transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FlowState {
    Spawned,
    AwaitingUrl,
    AwaitingCallback,
    ProjectSelection,
    Completing,
}

fn cancel_registry() -> &'static StdMutex<HashMap<Provider, Arc<Notify>>> {
    static REGISTRY: OnceLock<StdMutex<HashMap<Provider, Arc<Notify>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

/// Requests cancellation of any in-flight login for `provider`. The flow's
/// auth child receives SIGTERM and the flow resolves to `None`.
pub fn cancel(provider: Provider) {
    let registry = cancel_registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(notify) = registry.get(&provider) {
        notify.notify_waiters();
    }
}

fn register_cancel(provider: Provider) -> Arc<Notify> {
    let mut registry = cancel_registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    registry
        .entry(provider)
        .or_insert_with(|| Arc::new(Notify::new()))
        .clone()
}

/// Drives sidecar login flows and lands the resulting credentials in the
/// account registry.
pub struct OauthDriver {
    root: ConfigRoot,
    store: AccountStore,
    binary: PathBuf,
    events: FlowEventBus,
    upload: Option<UploadTarget>,
    prompter: Arc<dyn Prompter>,
}

impl OauthDriver {
    pub fn new(root: ConfigRoot, store: AccountStore, binary: PathBuf) -> Self {
        Self {
            root,
            store,
            binary,
            events: FlowEventBus::disconnected(),
            upload: None,
            prompter: Arc::new(StdinPrompter),
        }
    }

    /// Connects the device-code / project-selection event bus.
    pub fn with_events(mut self, events: FlowEventBus) -> Self {
        self.events = events;
        self
    }

    /// Enables best-effort publication of new tokens to a remote endpoint.
    pub fn with_upload(mut self, upload: UploadTarget) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Runs the authorization-code flow with a local callback server.
    ///
    /// Returns `Ok(None)` when the user declined the existing-account
    /// prompt, cancelled, or the flow timed out (troubleshooting is printed
    /// first); `Ok(Some)` once the new account is registered.
    pub async fn login(
        &self,
        provider: Provider,
        options: OauthOptions,
    ) -> Result<Option<Account>, CliproxyError> {
        let Some(nickname) = self.resolve_gate_and_nickname(provider, &options)? else {
            return Ok(None);
        };

        let findings = run_preflight(provider);
        for finding in &findings {
            match finding.severity {
                PreflightSeverity::Fatal => {}
                _ => {
                    if let Some(remediation) = &finding.remediation {
                        eprintln!("note: {} ({remediation})", finding.message);
                    } else {
                        eprintln!("note: {}", finding.message);
                    }
                }
            }
        }
        if has_fatal(&findings) {
            let reasons: Vec<String> = findings
                .iter()
                .filter(|finding| finding.severity == PreflightSeverity::Fatal)
                .map(|finding| finding.message.clone())
                .collect();
            return Err(CliproxyError::PreflightFailed {
                reason: reasons.join("; "),
            });
        }

        kill_port_listener(provider.callback_port()).await;

        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(self.root.sidecar_config_path())
            .arg(provider.login_flag());
        if options.headless || options.no_browser {
            command.arg("--no-browser");
        }
        if provider == Provider::Kiro && options.no_incognito {
            command.arg("--no-incognito");
        }

        let started_at = epoch_ms();
        let outcome = self
            .run_interactive_flow(provider, command, &options, false)
            .await?;
        if !outcome {
            return Ok(None);
        }
        self.complete(provider, started_at, nickname.as_deref())
            .await
            .map(Some)
    }

    /// Runs the device-code flow: no local port, the user pairs with a code
    /// on another device while the sidecar polls.
    pub async fn login_device_code(
        &self,
        provider: Provider,
        options: OauthOptions,
    ) -> Result<Option<Account>, CliproxyError> {
        let Some(nickname) = self.resolve_gate_and_nickname(provider, &options)? else {
            return Ok(None);
        };

        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(self.root.sidecar_config_path())
            .arg(provider.login_flag())
            .arg("--device-auth");

        let started_at = epoch_ms();
        let outcome = self
            .run_interactive_flow(provider, command, &options, true)
            .await?;
        if !outcome {
            return Ok(None);
        }
        self.complete(provider, started_at, nickname.as_deref())
            .await
            .map(Some)
    }

    /// The shared milestone loop. Returns `Ok(true)` when the flow reached
    /// completion, `Ok(false)` on cancel/timeout (already reported).
    async fn run_interactive_flow(
        &self,
        provider: Provider,
        mut command: Command,
        options: &OauthOptions,
        device_flow: bool,
    ) -> Result<bool, CliproxyError> {
        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CliproxyError::Spawn {
            binary: self.binary.clone(),
            source,
        })?;
        let session_id = format!("{}-{}", provider.tag(), epoch_ms());

        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, line_tx.clone());
        }
        drop(line_tx);
        let mut stdin = child.stdin.take();

        let cancel_notify = register_cancel(provider);
        let timeout = if options.headless {
            HEADLESS_TIMEOUT
        } else {
            INTERACTIVE_TIMEOUT
        };
        let deadline = time::Instant::now() + timeout;
        let banner_at = time::Instant::now() + ARE_YOU_THERE_AFTER;

        let mut state = FlowState::Spawned;
        let mut saw_milestone = false;
        let mut banner_shown = false;
        let mut device_code: Option<String> = None;
        let mut failure: Option<String> = None;

        loop {
            let banner_sleep = if banner_shown || saw_milestone {
                time::sleep_until(deadline)
            } else {
                time::sleep_until(banner_at.min(deadline))
            };
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else {
                        // Output closed; wait for the exit status below.
                        break;
                    };
                    debug!(%provider, line = %line.trim_end(), "auth output");
                    let Some(milestone) = parse_milestone(&line) else {
                        continue;
                    };
                    saw_milestone = true;
                    let previous_state = state;
                    match milestone {
                        Milestone::AuthUrl(url) => {
                            if options.headless {
                                eprintln!();
                                eprintln!("==============================================");
                                eprintln!("Open this URL on a machine with a browser:");
                                eprintln!("  {url}");
                                eprintln!("==============================================");
                            } else {
                                eprintln!("Opening browser: {url}");
                            }
                            state = FlowState::AwaitingUrl;
                        }
                        Milestone::CallbackReady => {
                            state = FlowState::AwaitingCallback;
                        }
                        Milestone::UserCode(code) => {
                            eprintln!("Pairing code: {code}");
                            device_code = Some(code);
                        }
                        Milestone::VerificationUrl(url) => {
                            eprintln!("Verification URL: {url}");
                            if let Some(code) = &device_code {
                                self.events.publish(FlowEvent::DeviceCodeReceived {
                                    session_id: session_id.clone(),
                                    user_code: code.clone(),
                                    verification_url: url,
                                });
                            }
                        }
                        Milestone::ProjectPrompt(prompt) => {
                            state = FlowState::ProjectSelection;
                            if options.from_ui {
                                self.events.publish(FlowEvent::ProjectSelectionRequested {
                                    session_id: session_id.clone(),
                                    prompt,
                                });
                            } else if let Some(stdin) = stdin.as_mut() {
                                // Accept the provider's default project.
                                let _ = stdin.write_all(b"\n").await;
                                let _ = stdin.flush().await;
                            }
                        }
                        Milestone::Completed => {
                            state = FlowState::Completing;
                            break;
                        }
                        Milestone::Failed(reason) => {
                            failure = Some(reason);
                        }
                    }
                    if state != previous_state {
                        debug!(%provider, ?previous_state, ?state, "flow state advanced");
                    }
                }
                _ = banner_sleep => {
                    if !banner_shown && !saw_milestone && time::Instant::now() < deadline {
                        eprintln!("Still working... waiting for the {} login to start.", provider.display_name());
                        banner_shown = true;
                        continue;
                    }
                    // Deadline reached.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    print_timeout_troubleshooting(provider, options.headless);
                    if device_flow {
                        self.events.publish(FlowEvent::DeviceCodeFailed {
                            session_id,
                            reason: "timed out".to_string(),
                        });
                    }
                    return Ok(false);
                }
                _ = cancel_notify.notified() => {
                    info!(%provider, "login cancelled");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(false);
                }
                _ = termination_signal() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Ok(false);
                }
            }
        }

        // Drain until exit; the child decides success.
        let status = match time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(CliproxyError::Io {
                    path: self.binary.clone(),
                    source,
                })
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                print_timeout_troubleshooting(provider, options.headless);
                return Ok(false);
            }
        };

        if status.success() || state == FlowState::Completing {
            if device_flow {
                self.events.publish(FlowEvent::DeviceCodeCompleted { session_id });
            }
            return Ok(true);
        }
        let reason = failure.unwrap_or_else(|| format!("auth helper exited with {status}"));
        if device_flow {
            self.events.publish(FlowEvent::DeviceCodeFailed {
                session_id,
                reason: reason.clone(),
            });
        }
        Err(CliproxyError::AuthFlowFailed { provider, reason })
    }

    /// Existing-account interlock plus the no-email nickname requirement.
    /// `Ok(None)` means the user backed out; `Ok(Some(nickname_option))`
    /// carries the validated nickname when one is required.
    fn resolve_gate_and_nickname(
        &self,
        provider: Provider,
        options: &OauthOptions,
    ) -> Result<Option<Option<String>>, CliproxyError> {
        let existing = self.store.list(provider);
        if !existing.is_empty() && !options.add {
            let message = format!(
                "{} already has {} account(s). Log in again anyway?",
                provider.display_name(),
                existing.len()
            );
            if !self.prompter.confirm(&message) {
                return Ok(None);
            }
        }

        if provider.has_email() {
            return Ok(Some(options.nickname.clone()));
        }

        let taken: Vec<String> = existing.iter().map(|account| account.nickname.clone()).collect();
        if let Some(nickname) = &options.nickname {
            validate_nickname(nickname).map_err(ccs_accounts::AccountsError::from)?;
            if taken.iter().any(|existing| existing == nickname) {
                return Err(CliproxyError::Accounts(
                    ccs_accounts::AccountsError::NicknameTaken {
                        provider,
                        nickname: nickname.clone(),
                    },
                ));
            }
            return Ok(Some(Some(nickname.clone())));
        }

        // Prompt until valid and unique; an empty answer aborts.
        loop {
            let Some(answer) = self
                .prompter
                .input(&format!("Nickname for this {} account", provider.display_name()))
            else {
                return Ok(None);
            };
            if let Err(err) = validate_nickname(&answer) {
                eprintln!("{err}");
                continue;
            }
            if taken.iter().any(|existing| existing == &answer) {
                eprintln!("`{answer}` is already in use for {}", provider.display_name());
                continue;
            }
            return Ok(Some(Some(answer)));
        }
    }

    /// Completion action shared by every flow: locate the newest token file
    /// for the provider, register it, and kick off the best-effort upload.
    pub(crate) async fn complete(
        &self,
        provider: Provider,
        since_ms: i64,
        nickname: Option<&str>,
    ) -> Result<Account, CliproxyError> {
        let mut newest = self.newest_token(provider, since_ms);

        if newest.is_none() && provider == Provider::Kiro {
            // The Kiro helper sometimes exits 0 without writing a token;
            // fall back to importing from the Kiro IDE's storage.
            info!("no Kiro token appeared, trying IDE import");
            let status = Command::new(&self.binary)
                .arg("--config")
                .arg(self.root.sidecar_config_path())
                .arg("--kiro-import")
                .status()
                .await
                .map_err(|source| CliproxyError::Spawn {
                    binary: self.binary.clone(),
                    source,
                })?;
            if status.success() {
                newest = self.newest_token(provider, since_ms);
            }
        }

        let Some((path, token)) = newest else {
            return Err(CliproxyError::AuthFlowFailed {
                provider,
                reason: "flow finished but no token file appeared".to_string(),
            });
        };
        let basename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();

        let account = self.store.register(
            provider,
            &basename,
            token.email(),
            nickname,
            token.project_id(),
        )?;
        info!(%provider, account = %account.id, "account registered");

        if let Some(upload) = &self.upload {
            publish_token(upload.clone(), path);
        }
        Ok(account)
    }

    /// The newest token file in `auth/` whose `type` matches the provider
    /// and whose mtime is not older than the flow start (with slack for
    /// clock granularity).
    fn newest_token(&self, provider: Provider, since_ms: i64) -> Option<(PathBuf, TokenDocument)> {
        const SLACK_MS: i64 = 10_000;
        let auth_dir = self.root.auth_dir();
        let mut best: Option<(i64, PathBuf, TokenDocument)> = None;
        for entry in fs::read_dir(&auth_dir).ok()?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Ok(token) = TokenDocument::load(&path) else {
                continue;
            };
            let matches = token
                .auth_type()
                .is_some_and(|value| provider.auth_type_values().contains(&value));
            if !matches {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|dur| dur.as_millis() as i64)
                .unwrap_or(0);
            if mtime + SLACK_MS < since_ms {
                continue;
            }
            if best.as_ref().map_or(true, |(current, _, _)| mtime > *current) {
                best = Some((mtime, path, token));
            }
        }
        best.map(|(_, path, token)| (path, token))
    }
}

fn spawn_line_reader(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Best-effort removal of whatever already listens on the callback port.
async fn kill_port_listener(port: u16) {
    #[cfg(unix)]
    {
        let output = Command::new("lsof")
            .args(["-ti", &format!("tcp:{port}")])
            .output()
            .await;
        let Ok(output) = output else { return };
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if let Ok(pid) = line.trim().parse::<i32>() {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                warn!(pid, port, "terminating process holding the callback port");
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = port;
    }
}

fn print_timeout_troubleshooting(provider: Provider, headless: bool) {
    eprintln!();
    eprintln!("{} authentication timed out.", provider.display_name());
    if headless {
        eprintln!("Running headless? The callback cannot reach this machine directly:");
        eprintln!(
            "  - forward the port: ssh -L {port}:127.0.0.1:{port} <this-host>",
            port = provider.callback_port()
        );
        eprintln!("  - or use the paste-callback flow: --paste-callback");
    } else {
        eprintln!("  - make sure the browser window completed the consent screen");
        eprintln!(
            "  - check that nothing blocks 127.0.0.1:{}",
            provider.callback_port()
        );
        eprintln!("  - retry with --no-browser and open the URL manually");
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

fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as i64)
        .unwrap_or_default()
}
