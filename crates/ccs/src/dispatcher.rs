use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context};
use ccs_accounts::{
    Account, AccountStore, CooldownStore, QuotaClient, RefreshEngine, RotationEngine,
};
use ccs_cliproxy::{
    build_base_url, Installer, OauthDriver, OauthOptions, Supervisor, UploadTarget,
};
use ccs_provider::{ConfigRoot, Provider};
use tracing::{debug, info, warn};

use crate::classifier::{Classified, Strategy};
use crate::config::{resolve_proxy_port, LauncherConfig, SettingsProfile};
use crate::process;
use crate::websearch;

/// A fixed inbound key for the local sidecar; the sidecar brokers the real
/// provider credentials itself.
const LOCAL_PROXY_KEY: &str = "sk-ccs-cliproxy-local";

const API_VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

/// Orchestrates one classified invocation end to end and returns the exit
/// code to propagate.
pub struct Dispatcher {
    root: ConfigRoot,
    config: LauncherConfig,
}

impl Dispatcher {
    pub fn new(root: ConfigRoot, config: LauncherConfig) -> Self {
        Self { root, config }
    }

    pub async fn dispatch(&self, classified: Classified) -> anyhow::Result<i32> {
        match classified.strategy {
            Strategy::Default => self.run_default(&classified.passthrough).await,
            Strategy::Settings {
                profile,
                settings_path,
            } => {
                let settings = SettingsProfile::load(&settings_path, &profile)?;
                if profile == "glmt" {
                    let env = websearch::ensure_hook(&self.root)
                        .context("failed to install web-search hook")?;
                    return crate::thinking::run_glmt(&settings, &classified.passthrough, env)
                        .await;
                }
                self.run_settings(&profile, &settings_path, settings, &classified.passthrough)
                    .await
            }
            Strategy::Cliproxy {
                provider,
                settings_path,
                model,
            } => {
                self.run_cliproxy(provider, settings_path, model, &classified.passthrough)
                    .await
            }
            Strategy::Account { profile } => {
                self.run_account(&profile, &classified.passthrough).await
            }
            Strategy::Copilot => self.run_copilot(&classified.passthrough).await,
            Strategy::Meta { command } => {
                // Interception happens before dispatch; reaching this arm is
                // a programming error, not user input.
                bail!("meta command `{command}` escaped interception")
            }
        }
    }

    /// Native defaults: no brokering, web-search hook suppressed.
    async fn run_default(&self, passthrough: &[String]) -> anyhow::Result<i32> {
        let mut env = websearch::skip_env();
        env.insert("CCS_PROFILE_TYPE".to_string(), "default".to_string());
        let outcome =
            process::run_downstream(&process::claude_binary(), passthrough, &env).await?;
        Ok(outcome.exit_code())
    }

    /// Third-party API key profile: hook install, key preflight, layered
    /// environment, `--settings` passthrough.
    async fn run_settings(
        &self,
        profile: &str,
        settings_path: &std::path::Path,
        settings: SettingsProfile,
        passthrough: &[String],
    ) -> anyhow::Result<i32> {
        self.validate_api_key(&settings).await?;

        let hook_env =
            websearch::ensure_hook(&self.root).context("failed to install web-search hook")?;

        // Layering order: profile file env, computed settings env, hook env,
        // profile-type marker. Later layers win, and all of it dominates the
        // --settings file the CLI also reads.
        let mut env: BTreeMap<String, String> = settings.env.clone();
        env.insert("ANTHROPIC_BASE_URL".to_string(), settings.base_url.clone());
        env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), settings.api_key.clone());
        if let Some(model) = &settings.model {
            env.insert("ANTHROPIC_MODEL".to_string(), model.clone());
        }
        for (key, value) in [
            ("ANTHROPIC_DEFAULT_OPUS_MODEL", &settings.opus_model),
            ("ANTHROPIC_DEFAULT_SONNET_MODEL", &settings.sonnet_model),
            ("ANTHROPIC_DEFAULT_HAIKU_MODEL", &settings.haiku_model),
        ] {
            if let Some(value) = value {
                env.insert(key.to_string(), value.clone());
            }
        }
        env.extend(hook_env);
        env.insert("CCS_PROFILE_TYPE".to_string(), "settings".to_string());

        let mut args = vec![
            "--settings".to_string(),
            settings_path.display().to_string(),
        ];
        args.extend(passthrough.iter().cloned());

        debug!(profile, "launching settings profile");
        let outcome = process::run_downstream(&process::claude_binary(), &args, &env).await?;
        Ok(outcome.exit_code())
    }

    /// Lightweight GET against the provider's model listing to catch dead
    /// keys before spawning. `CCS_SKIP_API_VALIDATION=1` opts out.
    async fn validate_api_key(&self, settings: &SettingsProfile) -> anyhow::Result<()> {
        if std::env::var_os("CCS_SKIP_API_VALIDATION").is_some() {
            return Ok(());
        }
        let url = format!("{}/v1/models", settings.base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(API_VALIDATION_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        match client
            .get(&url)
            .bearer_auth(&settings.api_key)
            .header("x-api-key", &settings.api_key)
            .send()
            .await
        {
            Ok(response) if response.status().as_u16() == 401 || response.status().as_u16() == 403 => {
                bail!(
                    "the provider rejected this API key ({}); check the profile's settings file",
                    response.status()
                );
            }
            Ok(_) => Ok(()),
            Err(err) => {
                // Unreachable validation endpoints are not fatal; the real
                // request will surface the truth.
                warn!(error = %err, "API key validation skipped (endpoint unreachable)");
                Ok(())
            }
        }
    }

    /// OAuth provider through the sidecar: ensure binary, ensure process,
    /// ensure account + valid token, pick the account, compose env, spawn.
    async fn run_cliproxy(
        &self,
        provider: Provider,
        settings_path: Option<std::path::PathBuf>,
        model: Option<String>,
        passthrough: &[String],
    ) -> anyhow::Result<i32> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();

        if let Some(remote) = &self.config.remote {
            // Remote mode: no local supervision; local account mutations are
            // disabled over there (501), we only route.
            let base = build_base_url(&remote.protocol, &remote.host, remote.port);
            info!(%base, "using remote sidecar");
            env.insert("ANTHROPIC_BASE_URL".to_string(), base);
            env.insert(
                "ANTHROPIC_AUTH_TOKEN".to_string(),
                remote.management_key.clone(),
            );
        } else {
            let store = AccountStore::new(self.root.clone());
            let installer = Installer::new(self.root.clone());
            let binary = installer
                .ensure(false)
                .await
                .context("sidecar binary unavailable")?;

            let supervisor = Supervisor::new(self.root.clone(), binary.clone());
            let preferred_port = resolve_proxy_port(None, &self.config);
            let running = supervisor
                .ensure_running(preferred_port)
                .await
                .context("sidecar failed to start")?;

            let account = self
                .ensure_account(provider, &store, &binary)
                .await
                .context("no usable account")?;
            let account = self
                .select_with_failover(provider, &store, account)
                .await?;

            let engine = RefreshEngine::new();
            engine
                .ensure_valid(&store, provider, &account)
                .await
                .with_context(|| format!("{provider} token is unusable"))?;
            store.touch(provider, &account.id).ok();

            env.insert(
                "ANTHROPIC_BASE_URL".to_string(),
                format!("http://127.0.0.1:{}", running.port),
            );
            env.insert("ANTHROPIC_AUTH_TOKEN".to_string(), LOCAL_PROXY_KEY.to_string());
            env.insert("CCS_CLIPROXY_ACCOUNT".to_string(), account.id.clone());

            // The refcount drops on normal exit and on interrupt alike; the
            // cleanup registry runs in both paths.
            let supervisor_for_cleanup = supervisor.clone();
            crate::cleanup::register(move || supervisor_for_cleanup.release_session());

            return self
                .spawn_cliproxy_cli(provider, settings_path, model, passthrough, env)
                .await;
        }

        self.spawn_cliproxy_cli(provider, settings_path, model, passthrough, env)
            .await
    }

    async fn spawn_cliproxy_cli(
        &self,
        provider: Provider,
        settings_path: Option<std::path::PathBuf>,
        model: Option<String>,
        passthrough: &[String],
        mut env: BTreeMap<String, String>,
    ) -> anyhow::Result<i32> {
        if let Some(model) = model {
            env.insert("ANTHROPIC_MODEL".to_string(), model);
        }
        if let Some(path) = settings_path {
            if let Ok(settings) = SettingsProfile::load(&path, provider.tag()) {
                for (key, value) in [
                    ("ANTHROPIC_DEFAULT_OPUS_MODEL", &settings.opus_model),
                    ("ANTHROPIC_DEFAULT_SONNET_MODEL", &settings.sonnet_model),
                    ("ANTHROPIC_DEFAULT_HAIKU_MODEL", &settings.haiku_model),
                ] {
                    if let Some(value) = value {
                        env.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
        let hook_env =
            websearch::ensure_hook(&self.root).context("failed to install web-search hook")?;
        env.extend(hook_env);
        env.insert("CCS_PROFILE_TYPE".to_string(), "cliproxy".to_string());

        let outcome =
            process::run_downstream(&process::claude_binary(), passthrough, &env).await?;
        Ok(outcome.exit_code())
    }

    /// Guarantees at least one registered account, running the interactive
    /// login flow when the registry is empty.
    async fn ensure_account(
        &self,
        provider: Provider,
        store: &AccountStore,
        binary: &std::path::Path,
    ) -> anyhow::Result<Account> {
        if let Some(account) = store.default_account(provider) {
            return Ok(account);
        }

        // Nothing registered: maybe tokens exist on disk from a previous
        // install.
        let discovered = store.discover().unwrap_or_default();
        if !discovered.added.is_empty() {
            debug!(count = discovered.added.len(), "accounts discovered from auth directory");
        }
        if let Some(account) = store.default_account(provider) {
            return Ok(account);
        }

        info!(%provider, "no account registered, starting login flow");
        let mut driver =
            OauthDriver::new(self.root.clone(), store.clone(), binary.to_path_buf());
        if let Some(endpoint) = &self.config.upload_endpoint {
            driver = driver.with_upload(UploadTarget {
                endpoint: endpoint.clone(),
                bearer_token: self.config.upload_token.clone(),
            });
        }
        match driver.login(provider, OauthOptions::default()).await? {
            Some(account) => Ok(account),
            None => Err(ccs_cliproxy::CliproxyError::AuthRequired { provider }.into()),
        }
    }

    /// Applies the quota/cooldown policy: keep the default unless a probe
    /// says it is exhausted, then fail over in registry order; error out
    /// with guidance when the whole pool is dry.
    async fn select_with_failover(
        &self,
        provider: Provider,
        store: &AccountStore,
        preferred: Account,
    ) -> anyhow::Result<Account> {
        // Only these providers expose a quota surface worth probing.
        let probeable = matches!(provider, Provider::Agy | Provider::Codex | Provider::Gemini);
        let mut cooldowns = CooldownStore::load(&self.root);
        let mut engine = RotationEngine::new(store.clone());

        if !probeable {
            return Ok(preferred);
        }

        let quota = QuotaClient::new(RefreshEngine::new());
        let mut candidate = Some(preferred);
        let total = store.list(provider).len();
        for _ in 0..total.max(1) {
            let Some(account) = candidate else { break };
            if cooldowns.is_on_cooldown(provider, &account.id) {
                candidate = engine.select_account(&cooldowns, provider);
                continue;
            }
            let report = quota.fetch(store, provider, &account).await;
            if !report.success {
                // A failed probe is not exhaustion; use the account and let
                // the request surface any real problem.
                debug!(%provider, account = %account.id, error = ?report.error, "quota probe inconclusive");
                return Ok(account);
            }
            if report.exhausted() {
                let until = CooldownStore::until_from_reset(report.reset_time_ms);
                warn!(%provider, account = %account.id, "account exhausted, cooling down");
                cooldowns
                    .set(provider, &account.id, until, "quota exhausted")
                    .ok();
                engine.record_probe(report);
                candidate = engine.select_account(&cooldowns, provider);
                continue;
            }
            return Ok(account);
        }

        bail!(
            "every {provider} account is exhausted or cooling down; \
             add another account with `ccs auth {provider} --add` or wait for the quota reset"
        )
    }

    /// Isolated instance: its own CLAUDE_CONFIG_DIR, native web search.
    async fn run_account(&self, profile: &str, passthrough: &[String]) -> anyhow::Result<i32> {
        let instance = self.root.instance_dir(profile);
        std::fs::create_dir_all(&instance)
            .with_context(|| format!("failed to create instance dir for `{profile}`"))?;
        // Profile-level lastUsed stamp; the unified config is read-only to us.
        let stamp = instance.join(".last-used");
        let _ = std::fs::write(&stamp, epoch_secs().to_string());

        let mut env = websearch::skip_env();
        env.insert(
            "CLAUDE_CONFIG_DIR".to_string(),
            instance.display().to_string(),
        );
        env.insert("CCS_PROFILE_TYPE".to_string(), "account".to_string());

        let outcome =
            process::run_downstream(&process::claude_binary(), passthrough, &env).await?;
        Ok(outcome.exit_code())
    }

    /// Handoff to the copilot collaborator: it owns the proxy; we only
    /// compose the environment it documents.
    async fn run_copilot(&self, passthrough: &[String]) -> anyhow::Result<i32> {
        let Some(port) = self.config.copilot.port else {
            bail!("copilot is not configured; run `ccs copilot start` first");
        };
        if !ccs_cliproxy::port_open(port).await {
            bail!("the copilot proxy is not listening on 127.0.0.1:{port}; run `ccs copilot start`");
        }

        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert(
            "ANTHROPIC_BASE_URL".to_string(),
            format!("http://127.0.0.1:{port}"),
        );
        env.insert("CCS_PROFILE_TYPE".to_string(), "copilot".to_string());

        let outcome =
            process::run_downstream(&process::claude_binary(), passthrough, &env).await?;
        Ok(outcome.exit_code())
    }
}
