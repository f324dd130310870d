//! Handlers for reserved top-level subcommands. The ones whose logic lives
//! in this core (sync, doctor, auth, cliproxy, update) are implemented
//! against the library crates; the rest belong to the `ccs-admin` companion
//! and are delegated to it wholesale.

use anyhow::{bail, Context};
use ccs_accounts::{AccountStore, CooldownStore, RotationEngine, TokenDocument, TokenStatus};
use ccs_cliproxy::{
    ClaudeApiKeyEntry, Installer, ManagementClient, OauthDriver, OauthOptions, SessionLock,
    SidecarConfig, Supervisor, UploadTarget,
};
use ccs_provider::{ConfigRoot, Provider, ALL_PROVIDERS};
use tracing::info;

use crate::config::{
    resolve_proxy_port, resolve_proxy_protocol, LauncherConfig, ProfileSpec, SettingsProfile,
};

pub async fn run(
    root: &ConfigRoot,
    config: &LauncherConfig,
    command: &str,
    args: &[String],
) -> anyhow::Result<i32> {
    match command {
        "version" | "--version" | "-v" => {
            println!("ccs {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(0)
        }
        "sync" => sync(root, config).await,
        "doctor" => doctor(root).await,
        "update" => update(root, args).await,
        "auth" => auth(root, config, args).await,
        "cliproxy" => cliproxy(root, config, args).await,
        other => delegate(other, args).await,
    }
}

fn print_usage() {
    println!("usage: ccs [profile] [claude-args...]");
    println!();
    println!("Profiles select how the Claude Code CLI is routed:");
    println!("  (none) / leading flag   native defaults");
    println!("  <settings profile>      third-party API key");
    println!("  gemini|codex|agy|qwen|iflow|kiro|ghcp   OAuth via the cliproxy sidecar");
    println!("  <account profile>       isolated CLAUDE_CONFIG_DIR instance");
    println!("  copilot                 subscription proxy");
    println!();
    println!("Management: doctor, sync, update, auth <provider>, cliproxy <start|stop|status>");
}

/// Weighted-sync every provider's auth directory, then regenerate the
/// sidecar config (claude-api-key entries are synthesized from settings
/// profiles here). A changed config on a running sidecar forces a restart.
async fn sync(root: &ConfigRoot, config: &LauncherConfig) -> anyhow::Result<i32> {
    let store = AccountStore::new(root.clone());
    let engine = RotationEngine::new(store);
    for provider in ALL_PROVIDERS {
        engine.sync_weights(provider).await?;
    }

    let mut sidecar_config = SidecarConfig::load(root);
    sidecar_config.providers = ALL_PROVIDERS
        .into_iter()
        .filter(|provider| !engine.store().list(*provider).is_empty())
        .map(|provider| (provider.tag().to_string(), true))
        .collect();
    sidecar_config.claude_api_keys.clear();
    for (name, spec) in &config.profiles {
        if !matches!(spec, ProfileSpec::Settings { .. }) {
            continue;
        }
        let path = config.settings_path(root, name);
        if let Ok(settings) = SettingsProfile::load(&path, name) {
            sidecar_config.claude_api_keys.push(ClaudeApiKeyEntry {
                name: name.clone(),
                api_key: settings.api_key,
                base_url: Some(settings.base_url),
            });
        }
    }
    let changed = sidecar_config.write(root)?;

    if changed {
        if let Some(lock) = SessionLock::load(&root.session_lock_path()) {
            if lock.is_live().await {
                println!("sidecar config changed; restarting the running sidecar");
                let installer = Installer::new(root.clone());
                let binary = installer.ensure(false).await?;
                let supervisor = Supervisor::new(root.clone(), binary);
                supervisor.stop().await?;
                supervisor.ensure_running(Some(lock.port)).await?;
            }
        }
    }
    println!("sync complete");
    Ok(0)
}

/// Non-fatal diagnostics: token health per account, cooldowns, sidecar
/// liveness, and the shared-project warning.
async fn doctor(root: &ConfigRoot) -> anyhow::Result<i32> {
    let store = AccountStore::new(root.clone());
    let cooldowns = CooldownStore::load(root);
    let engine = RotationEngine::new(store.clone());

    for provider in ALL_PROVIDERS {
        let accounts = store.list(provider);
        if accounts.is_empty() {
            continue;
        }
        println!("{} ({}):", provider.display_name(), provider.tag());
        for account in &accounts {
            let status = match store.locate_token_file(&account.token_file) {
                Some(path) => match TokenDocument::load(&path) {
                    Ok(token) => match token.status() {
                        TokenStatus::Valid => "valid",
                        TokenStatus::ExpiringSoon => "expiring soon",
                        TokenStatus::Expired => "expired",
                        TokenStatus::Invalid => "invalid (no refresh token)",
                        TokenStatus::Missing => "missing",
                    },
                    Err(_) => "unreadable",
                },
                None => "missing",
            };
            let mut flags = Vec::new();
            if account.is_default {
                flags.push("default".to_string());
            }
            if account.paused {
                flags.push("paused".to_string());
            }
            if cooldowns.is_on_cooldown(provider, &account.id) {
                flags.push("on cooldown".to_string());
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            println!("  {}  token: {status}{flags}", account.id);
        }
        for group in engine.shared_project_groups(provider) {
            println!(
                "  warning: accounts {} share project {}; failover cannot help when the pool is shared",
                group.account_ids.join(", "),
                group.project_id
            );
        }
    }

    match SessionLock::load(&root.session_lock_path()) {
        Some(lock) if lock.is_live().await => {
            println!(
                "sidecar: running (pid {}, port {}, {} session(s))",
                lock.pid, lock.port, lock.session_count
            );
        }
        Some(_) => println!("sidecar: stale lock (will be recovered on next launch)"),
        None => println!("sidecar: not running"),
    }
    Ok(0)
}

/// Installs the latest stable sidecar (or the pin). `--yes` approves
/// faulty-range / beyond-max-stable versions.
async fn update(root: &ConfigRoot, args: &[String]) -> anyhow::Result<i32> {
    let approve = args.iter().any(|arg| arg == "--yes" || arg == "-y");
    let installer = Installer::new(root.clone());

    if let Some(pinned) = installer.pinned_version()? {
        println!("version pinned to {pinned}; installing the pin");
        installer.install_version(&pinned, approve).await?;
        println!("installed {pinned}");
        return Ok(0);
    }

    let Some(latest) = installer.latest_stable().await? else {
        println!("release lookup unavailable (rate limited); try again later");
        return Ok(0);
    };
    if installer.installed_version().as_ref() == Some(&latest) {
        println!("already on {latest}");
        return Ok(0);
    }
    installer.install_version(&latest, approve).await?;
    println!("installed {latest}");
    Ok(0)
}

/// `ccs auth <provider> [--add] [--nickname <n>] [--device] \
///  [--paste-callback] [--headless] [--no-browser] [--no-incognito]`
async fn auth(root: &ConfigRoot, config: &LauncherConfig, args: &[String]) -> anyhow::Result<i32> {
    if config.remote.is_some() {
        bail!("account management is disabled against a remote sidecar");
    }
    let Some(tag) = args.first() else {
        bail!("usage: ccs auth <provider> [--add] [--nickname <name>] [--device] [--paste-callback]");
    };
    let provider = Provider::from_tag(tag)
        .with_context(|| format!("`{tag}` is not a known provider"))?;

    let mut options = OauthOptions {
        headless: std::env::var_os("SSH_CONNECTION").is_some(),
        ..OauthOptions::default()
    };
    let mut flow = Flow::AuthCode;
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--add" => options.add = true,
            "--nickname" => {
                options.nickname = iter.next().cloned();
                if options.nickname.is_none() {
                    bail!("--nickname requires a value");
                }
            }
            "--device" => flow = Flow::Device,
            "--paste-callback" => flow = Flow::Paste,
            "--headless" => options.headless = true,
            "--no-browser" => options.no_browser = true,
            "--no-incognito" => options.no_incognito = true,
            other => bail!("unknown auth flag `{other}`"),
        }
    }

    let store = AccountStore::new(root.clone());
    let installer = Installer::new(root.clone());
    let binary = installer.ensure(false).await?;
    let mut driver = OauthDriver::new(root.clone(), store, binary.clone());
    if let Some(endpoint) = &config.upload_endpoint {
        driver = driver.with_upload(UploadTarget {
            endpoint: endpoint.clone(),
            bearer_token: config.upload_token.clone(),
        });
    }

    let account = match flow {
        Flow::AuthCode => driver.login(provider, options).await?,
        Flow::Device => driver.login_device_code(provider, options).await?,
        Flow::Paste => {
            // The paste flow goes through the sidecar's management port, so
            // the sidecar must be up first.
            let supervisor = Supervisor::new(root.clone(), binary);
            let running = supervisor
                .ensure_running(resolve_proxy_port(None, config))
                .await?;
            let management_key = SidecarConfig::load(root)
                .remote_management_key
                .unwrap_or_default();
            let management = ManagementClient::local(running.port, management_key)?;
            let result = driver.login_paste(provider, &management, options).await;
            supervisor.release_session();
            result?
        }
    };

    match account {
        Some(account) => {
            println!("logged in as {} ({})", account.id, provider.display_name());
            Ok(0)
        }
        None => {
            println!("authentication not completed");
            Ok(1)
        }
    }
}

enum Flow {
    AuthCode,
    Device,
    Paste,
}

/// `ccs cliproxy <start|stop|status> [--proxy-port <n>]`
async fn cliproxy(root: &ConfigRoot, config: &LauncherConfig, args: &[String]) -> anyhow::Result<i32> {
    let action = args.first().map(String::as_str).unwrap_or("status");
    let flag_value = |name: &str| {
        args.iter()
            .position(|arg| arg == name)
            .and_then(|index| args.get(index + 1))
    };
    let cli_port = flag_value("--proxy-port").and_then(|value| value.parse().ok());
    let cli_protocol = flag_value("--proxy-protocol").map(String::as_str);

    match action {
        "start" => {
            let installer = Installer::new(root.clone());
            let binary = installer.ensure(false).await?;
            let supervisor = Supervisor::new(root.clone(), binary);
            let running = supervisor
                .ensure_running(resolve_proxy_port(cli_port, config))
                .await?;
            let protocol = resolve_proxy_protocol(cli_protocol, config);
            println!(
                "sidecar {} at {protocol}://127.0.0.1:{} (pid {})",
                if running.reused { "already running" } else { "started" },
                running.port,
                running.pid
            );
            Ok(0)
        }
        "stop" => {
            let installer = Installer::new(root.clone());
            let binary = installer.binary_path();
            let supervisor = Supervisor::new(root.clone(), binary);
            let report = supervisor.stop().await?;
            if report.was_running {
                println!("sidecar stopped ({} session(s) were attached)", report.sessions_at_stop);
            } else {
                println!("sidecar was not running");
            }
            Ok(0)
        }
        "status" => {
            if let Some(remote) = &config.remote {
                let client = ManagementClient::new(
                    &remote.protocol,
                    &remote.host,
                    remote.port,
                    remote.management_key.clone(),
                    remote.accept_invalid_certs,
                )?;
                match client.health().await {
                    Ok(health) => {
                        println!("remote sidecar at {} is healthy", client.base_url());
                        if let Some(version) = health.version {
                            println!("version: {version}");
                        }
                    }
                    Err(err) => println!("remote sidecar at {}: {err}", client.base_url()),
                }
                return Ok(0);
            }
            match SessionLock::load(&root.session_lock_path()) {
                Some(lock) if lock.is_live().await => {
                    println!("running: pid {}, port {}, {} session(s)", lock.pid, lock.port, lock.session_count);
                    let management_key = SidecarConfig::load(root)
                        .remote_management_key
                        .unwrap_or_default();
                    if let Ok(client) = ManagementClient::local(lock.port, management_key) {
                        if let Ok(health) = client.health().await {
                            if let Some(version) = health.version {
                                println!("version: {version}{}", health.commit.map(|c| format!(" ({c})")).unwrap_or_default());
                            }
                        }
                    }
                }
                Some(_) => println!("stale lock; sidecar not actually running"),
                None => println!("not running"),
            }
            Ok(0)
        }
        other => bail!("unknown cliproxy action `{other}`"),
    }
}

/// Everything else belongs to the `ccs-admin` companion (config editing,
/// migration, setup wizards, the HTTP api, copilot management).
async fn delegate(command: &str, args: &[String]) -> anyhow::Result<i32> {
    let admin = std::env::var_os("CCS_ADMIN_BIN")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::path::PathBuf::from("ccs-admin"));
    info!(command, "delegating to companion");
    let mut spawned = tokio::process::Command::new(&admin);
    for part in command.split_whitespace() {
        spawned.arg(part.trim_start_matches('-'));
    }
    let status = spawned
        .args(args)
        .status()
        .await
        .with_context(|| {
            format!(
                "`{command}` is handled by the ccs-admin companion, which was not found at `{}`",
                admin.display()
            )
        })?;
    Ok(status.code().unwrap_or(1))
}
