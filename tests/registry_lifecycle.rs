//! End-to-end lifecycle tests against a real (in-memory) SQLite store.
//!
//! These exercise the parts of the publish pipeline that don't require a
//! live network fetch — ownership/claim semantics, immutability, yank, and
//! discovery — plus the HTTPS-only guard, which rejects before any fetch is
//! attempted and so is safe to drive through the real coordinator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use wares_registry::coordinator::{Coordinator, DistributionRegistration, PublishRequest};
use wares_registry::discovery::{Discovery, SearchQuery};
use wares_registry::error::RegistryError;
use wares_registry::fetch::FetchLimits;
use wares_registry::identity::Principal;
use wares_registry::manifest::RawManifest;
use wares_registry::store::{DistributionRecord, Store, VersionRecord};

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

async fn memory_store() -> Arc<Store> {
    Arc::new(Store::connect("sqlite::memory:").await.expect("in-memory store connects"))
}

fn version_record(name: &str, version: &str, min: &str, max: Option<&str>) -> VersionRecord {
    VersionRecord {
        name: name.to_string(),
        version: version.parse().unwrap(),
        game: "Pokemon Emerald".to_string(),
        description: Some("a randomizer world".to_string()),
        minimum_ap_version: min.parse().unwrap(),
        maximum_ap_version: max.map(|m| m.parse().unwrap()),
        entry_points: [("pokemon_emerald".to_string(), "pokemon_emerald.world:World".to_string())]
            .into_iter()
            .collect(),
        manifest_snapshot: json!({ "name": name, "version": version }),
        distributions: vec![DistributionRecord {
            filename: format!("{name}-{version}-py3-none-any.island"),
            url: format!("https://dist.example.com/{name}-{version}.island"),
            sha256: EMPTY_SHA256.to_string(),
            size: 0,
            platform_tag: "py3-none-any".to_string(),
        }],
        published_by: "alice".to_string(),
        provenance_publisher: None,
        provenance_workflow: None,
        provenance_commit: None,
        yanked: false,
        yank_reason: None,
        created_at: Utc::now(),
    }
}

/// A distribution registration for `(name, version)`, matched by a
/// `DistributionRecord` with identical fields so a test can commit one
/// directly to the store and later submit the other through the coordinator
/// and expect them to compare equal.
fn distribution_registration(name: &str, version: &str) -> DistributionRegistration {
    DistributionRegistration {
        filename: format!("{name}-{version}-py3-none-any.island"),
        url: format!("https://dist.example.com/{name}-{version}.island"),
        sha256: EMPTY_SHA256.to_string(),
        size: 0,
        platform_tag: "py3-none-any".to_string(),
    }
}

fn distribution_record_from(registration: &DistributionRegistration) -> DistributionRecord {
    DistributionRecord {
        filename: registration.filename.clone(),
        url: registration.url.clone(),
        sha256: registration.sha256.clone(),
        size: registration.size,
        platform_tag: registration.platform_tag.clone(),
    }
}

/// Commits a version record the way `Coordinator::publish` would have
/// (manifest snapshot built via `serde_json::to_value`, matching the claimed
/// distribution), so a later `coordinator.publish()` call with the identical
/// `RawManifest`/`DistributionRegistration` can exercise the idempotency
/// comparison honestly.
async fn seed_committed_version(store: &Arc<Store>, name: &str, version: &str, min: &str) {
    let raw = raw_manifest(name, version, min);
    let snapshot = serde_json::to_value(&raw).unwrap();
    let manifest = wares_registry::manifest::validate(raw, snapshot).unwrap();
    let registration = distribution_registration(name, version);

    let record = VersionRecord {
        name: manifest.name,
        version: manifest.version,
        game: manifest.game,
        description: manifest.description,
        minimum_ap_version: manifest.minimum_compat,
        maximum_ap_version: manifest.maximum_compat,
        entry_points: manifest.entry_points,
        manifest_snapshot: manifest.snapshot,
        distributions: vec![distribution_record_from(&registration)],
        published_by: alice().key(),
        provenance_publisher: None,
        provenance_workflow: None,
        provenance_commit: None,
        yanked: false,
        yank_reason: None,
        created_at: Utc::now(),
    };
    store.commit_claim(&alice(), &record).await.unwrap();
}

fn raw_manifest(name: &str, version: &str, min: &str) -> RawManifest {
    RawManifest {
        name: name.to_string(),
        version: version.to_string(),
        game: "Pokemon Emerald".to_string(),
        description: None,
        authors: vec![],
        minimum_ap_version: min.to_string(),
        maximum_ap_version: None,
        entry_points: [("pokemon_emerald".to_string(), "pokemon_emerald.world:World".to_string())]
            .into_iter()
            .collect(),
        license: None,
        homepage: None,
        repository: None,
        keywords: vec![],
        platforms: vec![],
        maturity: None,
        extra: BTreeMap::new(),
    }
}

fn alice() -> Principal {
    Principal::ApiToken("alice".to_string())
}

fn mallory() -> Principal {
    Principal::ApiToken("mallory".to_string())
}

/// S1: the first publish of a name claims ownership for the publishing
/// principal, and the package is then visible via discovery.
#[tokio::test]
async fn first_publish_claims_ownership() {
    let store = memory_store().await;
    store.commit_claim(&alice(), &version_record("pokemon-emerald", "1.0.0", "0.5.0", None)).await.unwrap();

    let ownership = store.load_ownership("pokemon-emerald").await.unwrap().unwrap();
    assert_eq!(ownership.owner, "alice");

    let discovery = Discovery::new(&store);
    let (package, versions) = discovery.get_package("pokemon-emerald").await.unwrap();
    assert_eq!(package.owner, "alice");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, "1.0.0");
}

/// S2 / property 3: repeating a publish with the same (name, version) but a
/// *different* distribution URL is rejected as `version-exists`, driven
/// end-to-end through `Coordinator::publish` so the idempotency comparison
/// itself is exercised, not just the store's unique constraint.
#[tokio::test]
async fn duplicate_version_is_rejected() {
    let store = memory_store().await;
    seed_committed_version(&store, "pokemon-emerald", "1.0.0", "0.5.0").await;

    let coordinator = Coordinator::new(
        store.clone(),
        FetchLimits { max_size_bytes: 1024 * 1024, deadline: Duration::from_secs(5) },
        Duration::from_secs(30),
    );

    let mut distribution = distribution_registration("pokemon-emerald", "1.0.0");
    distribution.url = "https://dist.example.com/pokemon-emerald-1.0.0-mirror.island".to_string();
    let request = PublishRequest {
        manifest: raw_manifest("pokemon-emerald", "1.0.0", "0.5.0"),
        distributions: vec![distribution],
    };

    let err = coordinator.publish(&alice(), request).await.unwrap_err();
    assert!(matches!(err, RegistryError::VersionExists(name, version) if name == "pokemon-emerald" && version == "1.0.0"));
}

/// Property 3 exception: a byte-identical republish of an already-committed
/// version (same manifest, same distributions, same principal) is
/// recognized as an idempotent replay, not a conflict — driven through
/// `Coordinator::publish` so the full three-way comparison runs.
#[tokio::test]
async fn byte_identical_replay_is_recognized_as_idempotent() {
    let store = memory_store().await;
    seed_committed_version(&store, "pokemon-emerald", "1.0.0", "0.5.0").await;

    let coordinator = Coordinator::new(
        store.clone(),
        FetchLimits { max_size_bytes: 1024 * 1024, deadline: Duration::from_secs(5) },
        Duration::from_secs(30),
    );

    let request = PublishRequest {
        manifest: raw_manifest("pokemon-emerald", "1.0.0", "0.5.0"),
        distributions: vec![distribution_registration("pokemon-emerald", "1.0.0")],
    };

    let outcome = coordinator.publish(&alice(), request).await.unwrap();
    assert!(matches!(outcome, wares_registry::coordinator::PublishOutcome::IdempotentReplay));
}

/// Property 4: once a name is claimed, a different principal without
/// collaborator or trusted-publisher standing cannot publish under it.
#[tokio::test]
async fn unauthorized_principal_cannot_publish_a_new_version() {
    let store = memory_store().await;
    store.commit_claim(&alice(), &version_record("pokemon-emerald", "1.0.0", "0.5.0", None)).await.unwrap();

    let ownership = store.load_ownership("pokemon-emerald").await.unwrap().unwrap();
    let err = wares_registry::ownership::authorize(&mallory(), Some(&ownership)).unwrap_err();
    assert!(matches!(err, RegistryError::Forbidden(_)));
}

/// S4 / property 6: a registration whose URL is not HTTPS is rejected
/// before any fetch is attempted, so this is safe to drive through the real
/// coordinator without network access.
#[tokio::test]
async fn publish_with_non_https_url_is_rejected_pre_fetch() {
    let store = memory_store().await;
    let coordinator = Coordinator::new(
        store.clone(),
        FetchLimits { max_size_bytes: 1024 * 1024, deadline: Duration::from_secs(5) },
        Duration::from_secs(30),
    );

    let request = PublishRequest {
        manifest: raw_manifest("pokemon-emerald", "1.0.0", "0.5.0"),
        distributions: vec![DistributionRegistration {
            filename: "pokemon_emerald-1.0.0-py3-none-any.island".to_string(),
            url: "http://dist.example.com/pokemon_emerald-1.0.0.island".to_string(),
            sha256: EMPTY_SHA256.to_string(),
            size: 0,
            platform_tag: "py3-none-any".to_string(),
        }],
    };

    let err = coordinator.publish(&alice(), request).await.unwrap_err();
    assert!(matches!(err, RegistryError::UrlNotHttps(_)));

    assert!(store.load_ownership("pokemon-emerald").await.unwrap().is_none());
}

/// S5: compatibility-range search returns only versions whose declared
/// `[minimum, maximum]` covers the requested runtime version.
#[tokio::test]
async fn search_filters_by_compatibility_range() {
    let store = memory_store().await;
    store
        .commit_claim(&alice(), &version_record("pokemon-emerald", "1.0.0", "0.5.0", Some("0.6.99")))
        .await
        .unwrap();
    store.commit_version(&version_record("pokemon-emerald", "2.0.0", "0.6.0", None)).await.unwrap();

    let discovery = Discovery::new(&store);

    let narrow = discovery
        .search(&SearchQuery { compatible_with: Some("0.5.5".parse().unwrap()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(narrow.iter().map(|v| v.version.as_str()).collect::<Vec<_>>(), vec!["1.0.0"]);

    let broad = discovery
        .search(&SearchQuery { compatible_with: Some("0.6.50".parse().unwrap()), ..Default::default() })
        .await
        .unwrap();
    let mut versions: Vec<_> = broad.iter().map(|v| v.version.as_str()).collect();
    versions.sort();
    assert_eq!(versions, vec!["1.0.0", "2.0.0"]);
}

/// S6: yanking a version flags it rather than removing it; it still
/// appears both in direct lookups and in the full snapshot.
#[tokio::test]
async fn yank_flags_without_deleting() {
    let store = memory_store().await;
    store.commit_claim(&alice(), &version_record("pokemon-emerald", "1.0.0", "0.5.0", None)).await.unwrap();

    store.yank("pokemon-emerald", &"1.0.0".parse().unwrap(), "security issue").await.unwrap();

    let discovery = Discovery::new(&store);
    let version = discovery.get_version("pokemon-emerald", &"1.0.0".parse().unwrap()).await.unwrap();
    assert!(version.yanked);
    assert_eq!(version.yank_reason.as_deref(), Some("security issue"));

    let snapshot = discovery.snapshot().await.unwrap();
    let entries = snapshot["pokemon-emerald"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["yanked"], json!(true));
}

/// Property 7: every version a search can surface also appears in the full
/// snapshot, since both read from the same committed state.
#[tokio::test]
async fn search_results_are_a_subset_of_the_snapshot() {
    let store = memory_store().await;
    store.commit_claim(&alice(), &version_record("pokemon-emerald", "1.0.0", "0.5.0", None)).await.unwrap();
    store
        .commit_claim(&alice(), &version_record("zelda-randomizer", "0.9.0", "0.4.0", None))
        .await
        .unwrap();

    let discovery = Discovery::new(&store);
    let results = discovery
        .search(&SearchQuery { entry_point: Some("pokemon_emerald".to_string()), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(results.len(), 1);

    let snapshot = discovery.snapshot().await.unwrap();
    for result in &results {
        let entries = snapshot[&result.name].as_array().expect("package present in snapshot");
        assert!(entries.iter().any(|e| e["version"] == json!(result.version)));
    }
}
