use ccs_provider::{Provider, Tier};

use super::support::{auth_path, paused_path, store_fixture, write_token};
use crate::cooldown::CooldownStore;
use crate::quota::{ModelQuota, QuotaReport, QuotaStatus};
use crate::rotation::RotationEngine;

fn probe(provider: Provider, account_id: &str, fraction: f64) -> QuotaReport {
    QuotaReport {
        provider,
        account_id: account_id.to_string(),
        success: true,
        status: QuotaStatus::Ok,
        models: vec![ModelQuota::new("model", fraction)],
        buckets: Vec::new(),
        windows: Vec::new(),
        reset_time_ms: None,
        error: None,
    }
}

fn two_account_engine() -> (super::support::StoreFixture, RotationEngine) {
    let fx = store_fixture();
    for (file, email) in [("agy-a.json", "a@x.com"), ("agy-b.json", "b@x.com")] {
        write_token(&fx.root, Provider::Agy, file, Some(email));
        fx.store
            .register(Provider::Agy, file, Some(email), None, None)
            .unwrap();
    }
    let engine = RotationEngine::new(fx.store.clone());
    (fx, engine)
}

#[test]
fn default_wins_when_healthy() {
    let (fx, engine) = two_account_engine();
    let cooldowns = CooldownStore::load(&fx.root);
    let picked = engine.select_account(&cooldowns, Provider::Agy).unwrap();
    assert!(picked.is_default);
}

#[test]
fn exhausted_default_fails_over_in_registry_order() {
    let (fx, mut engine) = two_account_engine();
    let cooldowns = CooldownStore::load(&fx.root);
    let default_id = fx.store.default_account(Provider::Agy).unwrap().id;

    engine.record_probe(probe(Provider::Agy, &default_id, 0.03));
    let picked = engine.select_account(&cooldowns, Provider::Agy).unwrap();
    assert_ne!(picked.id, default_id);
}

#[test]
fn cooldown_short_circuits_selection() {
    let (fx, engine) = two_account_engine();
    let mut cooldowns = CooldownStore::load(&fx.root);
    let default_id = fx.store.default_account(Provider::Agy).unwrap().id;
    cooldowns
        .set(
            Provider::Agy,
            &default_id,
            crate::now_ms() + 60_000,
            "exhausted",
        )
        .unwrap();

    let picked = engine.select_account(&cooldowns, Provider::Agy).unwrap();
    assert_ne!(picked.id, default_id);
}

#[test]
fn everyone_exhausted_yields_none() {
    let (fx, mut engine) = two_account_engine();
    let cooldowns = CooldownStore::load(&fx.root);
    for account in fx.store.list(Provider::Agy) {
        engine.record_probe(probe(Provider::Agy, &account.id, 0.0));
    }
    assert!(engine.select_account(&cooldowns, Provider::Agy).is_none());
}

#[tokio::test]
async fn weighted_sync_duplicates_and_cleans_up() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    fx.store.set_weight(Provider::Gemini, "a@x.com", 3).unwrap();

    let engine = RotationEngine::new(fx.store.clone());
    engine.sync_weights(Provider::Gemini).await.unwrap();

    assert!(auth_path(&fx.root, "gemini-a.json").exists());
    assert!(auth_path(&fx.root, "gemini-a.w2.json").exists());
    assert!(auth_path(&fx.root, "gemini-a.w3.json").exists());

    // Idempotent: a second pass changes nothing.
    engine.sync_weights(Provider::Gemini).await.unwrap();
    let count = std::fs::read_dir(fx.root.auth_dir()).unwrap().count();
    assert_eq!(count, 3);

    // Weight reduction removes the out-of-range copy.
    fx.store.set_weight(Provider::Gemini, "a@x.com", 2).unwrap();
    engine.sync_weights(Provider::Gemini).await.unwrap();
    assert!(auth_path(&fx.root, "gemini-a.w2.json").exists());
    assert!(!auth_path(&fx.root, "gemini-a.w3.json").exists());
}

#[tokio::test]
async fn weight_zero_parks_the_canonical_file() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    fx.store.set_weight(Provider::Gemini, "a@x.com", 0).unwrap();

    let engine = RotationEngine::new(fx.store.clone());
    engine.sync_weights(Provider::Gemini).await.unwrap();
    assert!(!auth_path(&fx.root, "gemini-a.json").exists());
    assert!(paused_path(&fx.root, "gemini-a.json").exists());

    // The account is weighted out, not paused; the flag must not flip.
    let account = fx.store.find(Provider::Gemini, "a@x.com").unwrap();
    assert!(!account.paused);

    // Restoring the weight brings the file back.
    fx.store.set_weight(Provider::Gemini, "a@x.com", 1).unwrap();
    engine.sync_weights(Provider::Gemini).await.unwrap();
    assert!(auth_path(&fx.root, "gemini-a.json").exists());
}

#[tokio::test]
async fn tier_defaults_rewrite_weights_and_resync() {
    let fx = store_fixture();
    write_token(&fx.root, Provider::Gemini, "gemini-a.json", Some("a@x.com"));
    fx.store
        .register(Provider::Gemini, "gemini-a.json", Some("a@x.com"), None, None)
        .unwrap();
    fx.store
        .set_tier(Provider::Gemini, "a@x.com", Tier::Ultra)
        .unwrap();

    let engine = RotationEngine::new(fx.store.clone());
    let weights = [(Tier::Ultra, 3u32), (Tier::Free, 1u32)]
        .into_iter()
        .collect();
    engine.apply_tier_defaults(&weights).await.unwrap();

    assert_eq!(fx.store.find(Provider::Gemini, "a@x.com").unwrap().weight, 3);
    assert!(auth_path(&fx.root, "gemini-a.w3.json").exists());
}

#[test]
fn shared_project_groups_flag_multi_account_pools() {
    let fx = store_fixture();
    for (file, email) in [
        ("agy-a.json", "a@x.com"),
        ("agy-b.json", "b@x.com"),
        ("agy-c.json", "c@x.com"),
    ] {
        write_token(&fx.root, Provider::Agy, file, Some(email));
    }
    fx.store
        .register(Provider::Agy, "agy-a.json", Some("a@x.com"), None, Some("proj-1"))
        .unwrap();
    fx.store
        .register(Provider::Agy, "agy-b.json", Some("b@x.com"), None, Some("proj-1"))
        .unwrap();
    fx.store
        .register(Provider::Agy, "agy-c.json", Some("c@x.com"), None, Some("proj-2"))
        .unwrap();

    let engine = RotationEngine::new(fx.store.clone());
    let groups = engine.shared_project_groups(Provider::Agy);
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].project_id, "proj-1");
    assert_eq!(groups[0].account_ids.len(), 2);
}
