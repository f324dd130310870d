#![cfg(unix)]

use std::sync::Arc;

use ccs_provider::Provider;
use serde_json::json;

use crate::error::CliproxyError;
use crate::oauth::{OauthDriver, OauthOptions, Prompter};

use super::support::{fixture, write_auth_token, write_fake_sidecar, Fixture};

struct CannedPrompter {
    confirm: bool,
    input: Option<String>,
}

impl Prompter for CannedPrompter {
    fn confirm(&self, _message: &str) -> bool {
        self.confirm
    }

    fn input(&self, _message: &str) -> Option<String> {
        self.input.clone()
    }
}

/// A login helper that prints the usual milestones, writes a token file the
/// way the real sidecar would, and exits clean.
fn successful_login_script(fx: &Fixture, token_basename: &str, token_body: &str) -> String {
    format!(
        "#!/bin/sh\n\
         echo 'Visit https://accounts.google.com/o/oauth2/v2/auth?client_id=x to login'\n\
         echo 'Callback server listening on 127.0.0.1:8085'\n\
         cat > '{dir}/{token_basename}' <<'EOF'\n{token_body}\nEOF\n\
         echo 'Authentication successful'\n\
         exit 0\n",
        dir = fx.root.auth_dir().display(),
    )
}

#[tokio::test]
async fn auth_code_flow_registers_the_new_account() {
    let fx = fixture();
    let token = r#"{"type":"gemini","access_token":"a","refresh_token":"r","email":"new@x.com","project_id":"proj-9"}"#;
    let binary = write_fake_sidecar(&fx, &successful_login_script(&fx, "gemini-new.json", token));

    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary);
    let account = driver
        .login(Provider::Gemini, OauthOptions::default())
        .await
        .unwrap()
        .expect("flow completes");

    assert_eq!(account.id, "new@x.com");
    assert_eq!(account.nickname, "new");
    assert_eq!(account.project_id.as_deref(), Some("proj-9"));
    assert!(account.is_default, "first account becomes default");
    assert_eq!(fx.store.list(Provider::Gemini).len(), 1);
}

#[tokio::test]
async fn existing_account_interlock_aborts_without_error() {
    let fx = fixture();
    write_auth_token(
        &fx,
        "gemini-old.json",
        json!({"type": "gemini", "access_token": "a", "refresh_token": "r"}),
    );
    fx.store
        .register(Provider::Gemini, "gemini-old.json", Some("old@x.com"), None, None)
        .unwrap();

    let binary = write_fake_sidecar(&fx, "#!/bin/sh\nexit 0\n");
    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary)
        .with_prompter(Arc::new(CannedPrompter {
            confirm: false,
            input: None,
        }));

    let result = driver
        .login(Provider::Gemini, OauthOptions::default())
        .await
        .unwrap();
    assert!(result.is_none(), "declining the prompt cancels quietly");
    assert_eq!(fx.store.list(Provider::Gemini).len(), 1);
}

#[tokio::test]
async fn kiro_requires_a_nickname_and_binds_id_to_it() {
    let fx = fixture();
    let token = r#"{"type":"kiro","access_token":"a","refresh_token":"r"}"#;
    let binary = write_fake_sidecar(&fx, &successful_login_script(&fx, "kiro-oauth-p1.json", token));

    // The nickname comes from the interactive prompt.
    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary)
        .with_prompter(Arc::new(CannedPrompter {
            confirm: true,
            input: Some("work".to_string()),
        }));
    let account = driver
        .login(Provider::Kiro, OauthOptions::default())
        .await
        .unwrap()
        .expect("flow completes");

    assert_eq!(account.id, "work");
    assert_eq!(account.nickname, "work");
}

#[tokio::test]
async fn reserved_nickname_is_rejected_up_front() {
    let fx = fixture();
    let binary = write_fake_sidecar(&fx, "#!/bin/sh\nexit 0\n");
    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary);

    let options = OauthOptions {
        nickname: Some("kiro-1".to_string()),
        ..OauthOptions::default()
    };
    match driver.login(Provider::Kiro, options).await {
        Err(CliproxyError::Accounts(_)) => {}
        other => panic!("expected nickname rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_helper_exit_is_an_error() {
    let fx = fixture();
    let binary = write_fake_sidecar(
        &fx,
        "#!/bin/sh\necho 'Error: authentication failed'\nexit 1\n",
    );
    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary);

    match driver.login(Provider::Gemini, OauthOptions::default()).await {
        Err(CliproxyError::AuthFlowFailed { provider, reason }) => {
            assert_eq!(provider, Provider::Gemini);
            assert!(reason.to_lowercase().contains("failed"), "{reason}");
        }
        other => panic!("expected AuthFlowFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn kiro_ide_import_fallback_kicks_in() {
    let fx = fixture();
    // Login exits 0 without writing a token; only --kiro-import produces one.
    let token_path = fx.root.auth_dir().join("kiro-oauth-ide.json");
    let script = format!(
        "#!/bin/sh\n\
         for arg in \"$@\"; do\n\
           if [ \"$arg\" = \"--kiro-import\" ]; then\n\
             printf '%s' '{{\"type\":\"kiro\",\"access_token\":\"a\",\"refresh_token\":\"r\"}}' > '{path}'\n\
             exit 0\n\
           fi\n\
         done\n\
         echo 'Authentication successful'\n\
         exit 0\n",
        path = token_path.display(),
    );
    let binary = write_fake_sidecar(&fx, &script);

    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary);
    let options = OauthOptions {
        nickname: Some("imported".to_string()),
        ..OauthOptions::default()
    };
    let account = driver
        .login(Provider::Kiro, options)
        .await
        .unwrap()
        .expect("import fallback completes the flow");
    assert_eq!(account.id, "imported");
    assert!(token_path.exists());
}

#[tokio::test]
async fn cancel_resolves_the_flow_to_none() {
    let fx = fixture();
    // A helper that never finishes on its own.
    let binary = write_fake_sidecar(
        &fx,
        "#!/bin/sh\necho 'Visit https://example.com/auth to login'\nsleep 120\n",
    );
    let driver = OauthDriver::new(fx.root.clone(), fx.store.clone(), binary);

    let login = driver.login(Provider::Gemini, OauthOptions::default());
    let cancel = async {
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        crate::oauth::cancel(Provider::Gemini);
    };
    let (result, ()) = tokio::join!(login, cancel);
    assert!(result.unwrap().is_none(), "cancel resolves to None");
}
