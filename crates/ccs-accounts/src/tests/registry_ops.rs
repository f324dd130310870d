use ccs_provider::{Provider, Tier};

use super::support::{auth_path, paused_path, store_fixture, write_token};
use crate::error::AccountsError;

#[test]
fn register_is_idempotent_and_first_becomes_default() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));

    let first = fx
        .store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    assert!(first.is_default);
    assert_eq!(first.id, "a@x.com");
    assert_eq!(first.nickname, "a");

    std::thread::sleep(std::time::Duration::from_millis(5));
    let second = fx
        .store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    assert_eq!(fx.store.list(Provider::Gemini).len(), 1);
    assert!(second.last_used_at.unwrap() >= first.last_used_at.unwrap());
}

#[test]
fn register_rejects_paths_and_requires_nickname_for_kiro() {
    let fx = store_fixture();
    assert!(matches!(
        fx.store
            .register(Provider::Gemini, "auth/evil.json", Some("a@x.com"), None, None),
        Err(AccountsError::TokenFileNotBasename { .. })
    ));
    assert!(matches!(
        fx.store.register(Provider::Kiro, "kiro-x.json", None, None, None),
        Err(AccountsError::NicknameRequired { .. })
    ));
    assert!(matches!(
        fx.store
            .register(Provider::Kiro, "kiro-x.json", None, Some("kiro-1"), None),
        Err(AccountsError::Nickname(_))
    ));
}

#[test]
fn no_email_id_equals_nickname_and_reregister_is_an_update() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Kiro, "kiro-x.json", None);
    write_token(&fx.root, Provider::Kiro, "kiro-y.json", None);

    let account = fx
        .store
        .register(Provider::Kiro, "kiro-x.json", None, Some("work"), None)
        .unwrap();
    assert_eq!(account.id, "work");
    assert_eq!(account.nickname, "work");

    // Same nickname means the same id for no-email providers, so this is
    // the idempotent re-registration path, not a conflict.
    let again = fx
        .store
        .register(Provider::Kiro, "kiro-y.json", None, Some("work"), None)
        .unwrap();
    assert_eq!(again.id, "work");
    assert_eq!(again.token_file, "kiro-y.json");
    assert_eq!(fx.store.list(Provider::Kiro).len(), 1);
}

#[test]
fn rename_rejects_a_taken_nickname() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Ghcp, "ghcp-a.json", None);
    write_token(&fx.root, Provider::Ghcp, "ghcp-b.json", None);
    fx.store
        .register(Provider::Ghcp, "ghcp-a.json", None, Some("one"), None)
        .unwrap();
    fx.store
        .register(Provider::Ghcp, "ghcp-b.json", None, Some("two"), None)
        .unwrap();

    assert!(matches!(
        fx.store.rename(Provider::Ghcp, "one", "two"),
        Err(AccountsError::NicknameTaken { .. })
    ));
}

#[test]
fn exactly_one_default_survives_removal() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    write_token(&fx.root, Provider::Gemini, "gemini-b.json", Some("b@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    fx.store
        .register(Provider::Gemini, "gemini-b.json", Some("b@x.com"), None, None)
        .unwrap();

    let defaults = |store: &crate::registry::AccountStore| {
        store
            .list(Provider::Gemini)
            .into_iter()
            .filter(|account| account.is_default)
            .count()
    };
    assert_eq!(defaults(&fx.store), 1);

    assert!(fx.store.remove(Provider::Gemini, "a@x.com").unwrap());
    let remaining = fx.store.list(Provider::Gemini);
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].is_default, "default was promoted");
    assert!(!auth_path(&fx.root, "gemini-a.json").exists());
}

#[test]
fn pause_and_resume_relocate_and_are_idempotent() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();

    for _ in 0..2 {
        assert!(fx.store.pause(Provider::Gemini, "a@x.com").unwrap());
        assert!(!auth_path(&fx.root, "gemini-a.json").exists());
        assert!(paused_path(&fx.root, "gemini-a.json").exists());
    }
    let paused = fx.store.find(Provider::Gemini, "a@x.com").unwrap();
    assert!(paused.paused && paused.paused_at.is_some());

    for _ in 0..2 {
        assert!(fx.store.resume(Provider::Gemini, "a@x.com").unwrap());
        assert!(auth_path(&fx.root, "gemini-a.json").exists());
        assert!(!paused_path(&fx.root, "gemini-a.json").exists());
    }
    let resumed = fx.store.find(Provider::Gemini, "a@x.com").unwrap();
    assert!(!resumed.paused && resumed.paused_at.is_none());
}

#[test]
fn stranded_token_file_is_healed_on_load() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();

    // Simulate a crash between the file move and the registry write: the
    // file sits in auth-paused/ while the record still says active.
    std::fs::rename(
        auth_path(&fx.root, "gemini-a.json"),
        paused_path(&fx.root, "gemini-a.json"),
    )
    .unwrap();

    let account = fx.store.find(Provider::Gemini, "a@x.com").unwrap();
    assert!(!account.paused);
    assert!(auth_path(&fx.root, "gemini-a.json").exists(), "file moved back");
    assert!(!paused_path(&fx.root, "gemini-a.json").exists());
}

#[test]
fn missing_token_file_drops_account_on_load() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();

    std::fs::remove_file(auth_path(&fx.root, "gemini-a.json")).unwrap();
    assert!(fx.store.list(Provider::Gemini).is_empty());
}

#[test]
fn find_matches_exact_then_prefix() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("alice@x.com"));
    write_token(&fx.root, Provider::Gemini, "gemini-b.json", Some("bob@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("alice@x.com"), None, None)
        .unwrap();
    fx.store
        .register(Provider::Gemini, "gemini-b.json", Some("bob@x.com"), None, None)
        .unwrap();

    assert_eq!(
        fx.store.find(Provider::Gemini, "bob@x.com").unwrap().id,
        "bob@x.com"
    );
    assert_eq!(fx.store.find(Provider::Gemini, "ALi").unwrap().id, "alice@x.com");
    assert!(fx.store.find(Provider::Gemini, "zzz").is_none());
}

#[test]
fn rename_moves_id_for_no_email_providers() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Ghcp, "ghcp-x.json", None);
    fx.store
        .register(Provider::Ghcp, "ghcp-x.json", None, Some("old"), None)
        .unwrap();

    assert!(fx.store.rename(Provider::Ghcp, "old", "new").unwrap());
    let account = fx.store.find(Provider::Ghcp, "new").unwrap();
    assert_eq!(account.id, "new");
    assert!(account.is_default, "default reference moved with the id");
    assert!(fx.store.find(Provider::Ghcp, "old").is_none());
}

#[test]
fn mutations_and_bulk_collect_failures() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();

    assert!(fx.store.set_weight(Provider::Gemini, "a@x.com", 3).unwrap());
    assert!(matches!(
        fx.store.set_weight(Provider::Gemini, "a@x.com", 100),
        Err(AccountsError::WeightOutOfRange { .. })
    ));
    assert!(fx.store.set_tier(Provider::Gemini, "a@x.com", Tier::Pro).unwrap());
    assert!(fx.store.touch(Provider::Gemini, "a@x.com").unwrap());
    let account = fx.store.find(Provider::Gemini, "a@x.com").unwrap();
    assert_eq!((account.weight, account.tier), (3, Tier::Pro));

    let outcome = fx.store.bulk_pause(
        Provider::Gemini,
        &["a@x.com".to_string(), "ghost".to_string()],
    );
    assert_eq!(outcome.succeeded, ["a@x.com"]);
    assert_eq!(outcome.failed.len(), 1);
}

#[tokio::test]
async fn solo_pauses_everyone_else() {
    let fx = store_fixture();
    for (file, email) in [
        ("gemini-a.json", "a@x.com"),
        ("gemini-b.json", "b@x.com"),
        ("gemini-c.json", "c@x.com"),
    ] {
        write_token(&fx.root, Provider::Gemini, file, Some(email));
        fx.store
            .register(Provider::Gemini, file, Some(email), None, None)
            .unwrap();
    }
    fx.store.pause(Provider::Gemini, "b@x.com").unwrap();

    let outcome = fx.store.solo(Provider::Gemini, "b@x.com").await.unwrap();
    assert_eq!(outcome.activated, "b@x.com");
    assert_eq!(outcome.paused.len(), 2);

    let accounts = fx.store.list(Provider::Gemini);
    for account in accounts {
        assert_eq!(account.paused, account.id != "b@x.com", "{}", account.id);
    }
}

#[test]
fn discovery_synthesizes_and_is_idempotent() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    write_token(&fx.root, Provider::Kiro, "kiro-oauth-prof1.json", None);
    write_token(&fx.root, Provider::Ghcp, "ghcp-token.json", None);

    let report = fx.store.discover().unwrap();
    assert_eq!(report.added.len(), 3);

    let gemini = fx.store.list(Provider::Gemini);
    assert_eq!(gemini[0].id, "a@x.com");
    assert_eq!(gemini[0].nickname, "a");

    let kiro = fx.store.list(Provider::Kiro);
    assert_eq!(kiro[0].id, "kiro-prof1");

    let ghcp = fx.store.list(Provider::Ghcp);
    assert_eq!(ghcp[0].id, "ghcp-1", "monotonic fallback id");

    let again = fx.store.discover().unwrap();
    assert!(again.added.is_empty(), "second pass adds nothing");
    assert_eq!(fx.store.list(Provider::Kiro).len(), 1);
}

#[test]
fn registry_round_trips_through_save_and_load() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(
            Provider::Gemini,
            "gemini-a.json",
            Some("a@x.com"),
            None,
            Some("proj-1"),
        )
        .unwrap();
    fx.store.set_weight(Provider::Gemini, "a@x.com", 2).unwrap();

    let before = fx.store.list(Provider::Gemini);
    // A fresh store over the same root must observe the same accounts.
    let reopened = crate::registry::AccountStore::new(fx.root.clone());
    assert_eq!(reopened.list(Provider::Gemini), before);
}

#[cfg(unix)]
#[test]
fn registry_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    let mode = std::fs::metadata(fx.root.accounts_path())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}
