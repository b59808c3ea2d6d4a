//! Read-only discovery queries over committed state.
//!
//! Filtering that the store's SQL schema can't express directly — semver
//! compatibility ranges, platform-tag suffix matching, relevance scoring —
//! is applied in memory over rows the store already returned, scoring
//! in-memory after a broad SQL fetch rather than pushing relevance logic
//! into SQLite.

use serde::Serialize;
use serde_json::Value;

use crate::error::RegistryError;
use crate::store::{PackageSummary, Store, VersionRecord};
use crate::version::Version;

#[derive(Debug, Clone, Serialize)]
pub struct PackageView {
    pub name: String,
    pub owner: String,
    pub game: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionView {
    pub name: String,
    pub version: String,
    pub game: String,
    pub description: Option<String>,
    pub minimum_ap_version: String,
    pub maximum_ap_version: Option<String>,
    pub entry_points: std::collections::BTreeMap<String, String>,
    pub distributions: Vec<DistributionView>,
    pub yanked: bool,
    pub yank_reason: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub provenance: Option<ProvenanceView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionView {
    pub filename: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
    pub url_status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvenanceView {
    pub publisher: String,
    pub workflow: Option<String>,
    pub commit: Option<String>,
    pub build_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct SearchQuery {
    pub q: Option<String>,
    pub game: Option<String>,
    pub entry_point: Option<String>,
    pub compatible_with: Option<Version>,
    pub platform: Option<String>,
}

pub struct Discovery<'a> {
    store: &'a Store,
}

impl<'a> Discovery<'a> {
    pub fn new(store: &'a Store) -> Self {
        Discovery { store }
    }

    pub async fn list_packages(&self, offset: i64, limit: i64) -> Result<Vec<PackageView>, RegistryError> {
        let summaries = self.store.list_packages(offset, limit).await?;
        Ok(summaries.into_iter().map(package_view).collect())
    }

    pub async fn get_package(&self, name: &str) -> Result<(PackageView, Vec<VersionView>), RegistryError> {
        let ownership = self
            .store
            .load_ownership(name)
            .await?
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_string()))?;
        let mut versions = self.store.list_versions(name).await?;
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        let latest_game = versions.first().map(|v| v.game.clone()).unwrap_or_default();
        let updated_at = versions.first().map(|v| v.created_at).unwrap_or_else(chrono::Utc::now);
        let package = PackageView { name: name.to_string(), owner: ownership.owner, game: latest_game, updated_at };
        Ok((package, versions.into_iter().map(version_view).collect()))
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<VersionView>, RegistryError> {
        let mut versions = self.store.list_versions(name).await?;
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions.into_iter().map(version_view).collect())
    }

    pub async fn get_version(&self, name: &str, version: &Version) -> Result<VersionView, RegistryError> {
        let record = self.store.get_version(name, version).await?;
        Ok(version_view(record))
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<VersionView>, RegistryError> {
        let all = self.store.all_versions().await?;
        let mut matches: Vec<(u32, VersionRecord)> = all
            .into_iter()
            .filter_map(|record| score(&record, query).map(|score| (score, record)))
            .collect();

        matches.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.created_at.cmp(&a.1.created_at)));
        Ok(matches.into_iter().map(|(_, record)| version_view(record)).collect())
    }

    /// A single JSON document enumerating every package, every non-yanked
    /// version (yanked ones included but flagged), and every distribution.
    pub async fn snapshot(&self) -> Result<Value, RegistryError> {
        let all = self.store.all_versions().await?;
        let mut by_package: std::collections::BTreeMap<String, Vec<Value>> = std::collections::BTreeMap::new();
        for record in all {
            let view = version_view(record);
            by_package.entry(view.name.clone()).or_default().push(serde_json::to_value(&view).unwrap_or(Value::Null));
        }
        Ok(serde_json::json!(by_package))
    }
}

fn package_view(summary: PackageSummary) -> PackageView {
    PackageView { name: summary.name, owner: summary.owner, game: summary.latest_game, updated_at: summary.updated_at }
}

fn version_view(record: VersionRecord) -> VersionView {
    let created_at = record.created_at;
    VersionView {
        name: record.name,
        version: record.version.to_string(),
        game: record.game,
        description: record.description,
        minimum_ap_version: record.minimum_ap_version.to_string(),
        maximum_ap_version: record.maximum_ap_version.as_ref().map(|v| v.to_string()),
        entry_points: record.entry_points,
        distributions: record
            .distributions
            .into_iter()
            .map(|d| DistributionView {
                filename: d.filename,
                url: d.url,
                sha256: d.sha256,
                size: d.size,
                platform_tag: d.platform_tag,
                url_status: "active",
            })
            .collect(),
        yanked: record.yanked,
        yank_reason: record.yank_reason,
        created_at,
        provenance: record.provenance_publisher.map(|publisher| ProvenanceView {
            publisher,
            workflow: record.provenance_workflow,
            commit: record.provenance_commit,
            build_time: created_at,
        }),
    }
}

/// Relevance score for a version against a search query's predicates,
/// combined with implicit AND. `None` means the version is excluded.
fn score(record: &VersionRecord, query: &SearchQuery) -> Option<u32> {
    let mut relevance = 0;

    if let Some(q) = &query.q {
        let q_lower = q.to_lowercase();
        let haystack = format!(
            "{} {} {}",
            record.name,
            record.game,
            record.description.clone().unwrap_or_default()
        )
        .to_lowercase();
        if !haystack.contains(&q_lower) {
            return None;
        }
        if record.name.to_lowercase() == q_lower {
            relevance += 100;
        } else if record.name.to_lowercase().contains(&q_lower) {
            relevance += 10;
        } else {
            relevance += 1;
        }
    }

    if let Some(game) = &query.game {
        if !record.game.eq_ignore_ascii_case(game) {
            return None;
        }
        relevance += 5;
    }

    if let Some(entry_point) = &query.entry_point {
        if !record.entry_points.contains_key(entry_point) {
            return None;
        }
        relevance += 5;
    }

    if let Some(compatible_with) = &query.compatible_with {
        if !compatible_with.in_range(&record.minimum_ap_version, record.maximum_ap_version.as_ref()) {
            return None;
        }
    }

    if let Some(platform) = &query.platform {
        if !record.distributions.iter().any(|d| d.platform_tag.ends_with(platform.as_str())) {
            return None;
        }
    }

    Some(relevance)
}
