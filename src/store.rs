//! Transactional SQLite-backed persistence.
//!
//! This registry never stores artifact bytes, only metadata: a `packages`
//! table unique on name, a `versions` table unique on `(package_id,
//! version)`, and child tables for distributions and trusted-publisher
//! rules. Runtime-built queries (`sqlx::query`, not the `query!` macro) are
//! used throughout since there is no database available at build time to
//! check against.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::RegistryError;
use crate::identity::Principal;
use crate::ownership::{OwnershipRecord, TrustedPublisher};
use crate::version::Version;

/// How many times `commit_claim`/`commit_version` retry after a transient
/// (non-unique-violation) database error before giving up.
const TRANSIENT_RETRY_BUDGET: u32 = 3;

#[derive(Debug, Clone)]
pub struct DistributionRecord {
    pub filename: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub name: String,
    pub version: Version,
    pub game: String,
    pub description: Option<String>,
    pub minimum_ap_version: Version,
    pub maximum_ap_version: Option<Version>,
    pub entry_points: BTreeMap<String, String>,
    pub manifest_snapshot: Value,
    pub distributions: Vec<DistributionRecord>,
    pub published_by: String,
    pub provenance_publisher: Option<String>,
    pub provenance_workflow: Option<String>,
    pub provenance_commit: Option<String>,
    pub yanked: bool,
    pub yank_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub name: String,
    pub owner: String,
    pub latest_game: String,
    pub updated_at: DateTime<Utc>,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let options: SqliteConnectOptions = database_url
            .parse::<SqliteConnectOptions>()
            .map_err(|e| RegistryError::Internal(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        let store = Store { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), RegistryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS packages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS collaborators (
                package_id INTEGER NOT NULL REFERENCES packages(id),
                principal TEXT NOT NULL,
                UNIQUE(package_id, principal)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS trusted_publishers (
                package_id INTEGER NOT NULL REFERENCES packages(id),
                provider TEXT NOT NULL,
                repository TEXT NOT NULL,
                workflow TEXT,
                environment TEXT
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id INTEGER NOT NULL REFERENCES packages(id),
                version TEXT NOT NULL,
                game TEXT NOT NULL,
                description TEXT,
                minimum_ap_version TEXT NOT NULL,
                maximum_ap_version TEXT,
                entry_points TEXT NOT NULL,
                manifest_snapshot TEXT NOT NULL,
                published_by TEXT NOT NULL DEFAULT '',
                provenance_publisher TEXT,
                provenance_workflow TEXT,
                provenance_commit TEXT,
                yanked INTEGER NOT NULL DEFAULT 0,
                yank_reason TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(package_id, version)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS distributions (
                version_id INTEGER NOT NULL REFERENCES versions(id),
                filename TEXT NOT NULL,
                url TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                size INTEGER NOT NULL,
                platform_tag TEXT NOT NULL,
                UNIQUE(version_id, filename)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS api_tokens (
                token TEXT PRIMARY KEY,
                principal TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn lookup_api_token(&self, token: &str) -> Result<Option<String>, RegistryError> {
        let row = sqlx::query("SELECT principal FROM api_tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("principal")))
    }

    /// Bind an opaque API token to a principal name. Out-of-band issuance
    /// (no HTTP endpoint mints these); revocation is row deletion.
    pub async fn issue_api_token(&self, token: &str, principal: &str) -> Result<(), RegistryError> {
        sqlx::query("INSERT OR REPLACE INTO api_tokens (token, principal) VALUES (?, ?)")
            .bind(token)
            .bind(principal)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_ownership(&self, name: &str) -> Result<Option<OwnershipRecord>, RegistryError> {
        let Some(package_id) = self.package_id(name).await? else { return Ok(None) };

        let owner_row = sqlx::query("SELECT owner FROM packages WHERE id = ?")
            .bind(package_id)
            .fetch_one(&self.pool)
            .await?;
        let owner: String = owner_row.get("owner");

        let collaborator_rows = sqlx::query("SELECT principal FROM collaborators WHERE package_id = ?")
            .bind(package_id)
            .fetch_all(&self.pool)
            .await?;
        let collaborators = collaborator_rows.into_iter().map(|r| r.get::<String, _>("principal")).collect();

        let publisher_rows =
            sqlx::query("SELECT provider, repository, workflow, environment FROM trusted_publishers WHERE package_id = ?")
                .bind(package_id)
                .fetch_all(&self.pool)
                .await?;
        let trusted_publishers = publisher_rows
            .into_iter()
            .map(|r| TrustedPublisher {
                provider: r.get("provider"),
                repository: r.get("repository"),
                workflow: r.get("workflow"),
                environment: r.get("environment"),
            })
            .collect();

        Ok(Some(OwnershipRecord { owner, collaborators, trusted_publishers }))
    }

    async fn package_id(&self, name: &str) -> Result<Option<i64>, RegistryError> {
        let row = sqlx::query("SELECT id FROM packages WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("id")))
    }

    /// The full stored record for `(name, version)`, if already committed —
    /// used to decide between `version-exists` and an idempotent-replay 200
    /// by comparing the candidate against the whole record, not just the
    /// manifest snapshot.
    pub async fn existing_version(
        &self,
        name: &str,
        version: &Version,
    ) -> Result<Option<VersionRecord>, RegistryError> {
        let Some(package_id) = self.package_id(name).await? else { return Ok(None) };
        let records = self.load_versions_for(package_id, name).await?;
        Ok(records.into_iter().find(|v| &v.version == version))
    }

    /// Commit a new package claim plus its first version atomically,
    /// retrying a bounded number of times on transient (non-conflict)
    /// database errors.
    pub async fn commit_claim(&self, principal: &Principal, record: &VersionRecord) -> Result<(), RegistryError> {
        let mut attempt = 0;
        loop {
            match self.commit_claim_once(principal, record).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < TRANSIENT_RETRY_BUDGET && is_transient_conflict(&err) => {
                    attempt += 1;
                    debug!(attempt, "retrying commit_claim after transient conflict");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn commit_claim_once(&self, principal: &Principal, record: &VersionRecord) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let insert = sqlx::query("INSERT INTO packages (name, owner, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&record.name)
            .bind(principal.key())
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await;

        let package_id = match insert {
            Ok(result) => result.last_insert_rowid(),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(RegistryError::NameClaimed(record.name.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Principal::Federated { provider, repository, .. } = principal {
            sqlx::query(
                "INSERT INTO trusted_publishers (package_id, provider, repository, workflow, environment) VALUES (?, ?, ?, NULL, NULL)",
            )
            .bind(package_id)
            .bind(provider)
            .bind(repository)
            .execute(&mut *tx)
            .await?;
        }

        insert_version(&mut tx, package_id, record).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Commit a new version of an already-owned package, retrying a bounded
    /// number of times on transient (non-conflict) database errors.
    pub async fn commit_version(&self, record: &VersionRecord) -> Result<(), RegistryError> {
        let mut attempt = 0;
        loop {
            match self.commit_version_once(record).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < TRANSIENT_RETRY_BUDGET && is_transient_conflict(&err) => {
                    attempt += 1;
                    debug!(attempt, "retrying commit_version after transient conflict");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn commit_version_once(&self, record: &VersionRecord) -> Result<(), RegistryError> {
        let mut tx = self.pool.begin().await?;
        let Some(package_id) = self.package_id(&record.name).await? else {
            return Err(RegistryError::PackageNotFound(record.name.clone()));
        };

        let exists = sqlx::query("SELECT 1 FROM versions WHERE package_id = ? AND version = ?")
            .bind(package_id)
            .bind(record.version.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_some() {
            return Err(RegistryError::VersionExists(record.name.clone(), record.version.to_string()));
        }

        insert_version(&mut tx, package_id, record).await?;
        sqlx::query("UPDATE packages SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(package_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn yank(&self, name: &str, version: &Version, reason: &str) -> Result<(), RegistryError> {
        let Some(package_id) = self.package_id(name).await? else {
            return Err(RegistryError::PackageNotFound(name.to_string()));
        };
        let result = sqlx::query("UPDATE versions SET yanked = 1, yank_reason = ? WHERE package_id = ? AND version = ?")
            .bind(reason)
            .bind(package_id)
            .bind(version.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RegistryError::VersionNotFound(name.to_string(), version.to_string()));
        }
        Ok(())
    }

    pub async fn list_packages(&self, offset: i64, limit: i64) -> Result<Vec<PackageSummary>, RegistryError> {
        let rows = sqlx::query(
            "SELECT p.name, p.owner, p.updated_at,
                    (SELECT game FROM versions v WHERE v.package_id = p.id ORDER BY v.created_at DESC LIMIT 1) AS latest_game
             FROM packages p ORDER BY p.updated_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PackageSummary {
                name: r.get("name"),
                owner: r.get("owner"),
                latest_game: r.get::<Option<String>, _>("latest_game").unwrap_or_default(),
                updated_at: parse_rfc3339(&r.get::<String, _>("updated_at")),
            })
            .collect())
    }

    pub async fn list_versions(&self, name: &str) -> Result<Vec<VersionRecord>, RegistryError> {
        let Some(package_id) = self.package_id(name).await? else {
            return Err(RegistryError::PackageNotFound(name.to_string()));
        };
        self.load_versions_for(package_id, name).await
    }

    pub async fn get_version(&self, name: &str, version: &Version) -> Result<VersionRecord, RegistryError> {
        self.list_versions(name)
            .await?
            .into_iter()
            .find(|v| &v.version == version)
            .ok_or_else(|| RegistryError::VersionNotFound(name.to_string(), version.to_string()))
    }

    pub async fn all_versions(&self) -> Result<Vec<VersionRecord>, RegistryError> {
        let rows = sqlx::query("SELECT id, name FROM packages").fetch_all(&self.pool).await?;
        let mut all = Vec::new();
        for row in rows {
            let package_id: i64 = row.get("id");
            let name: String = row.get("name");
            all.extend(self.load_versions_for(package_id, &name).await?);
        }
        Ok(all)
    }

    async fn load_versions_for(&self, package_id: i64, name: &str) -> Result<Vec<VersionRecord>, RegistryError> {
        let rows = sqlx::query(
            "SELECT id, version, game, description, minimum_ap_version, maximum_ap_version,
                    entry_points, manifest_snapshot, published_by, provenance_publisher,
                    provenance_workflow, provenance_commit, yanked, yank_reason, created_at
             FROM versions WHERE package_id = ?",
        )
        .bind(package_id)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let version_id: i64 = row.get("id");
            let dist_rows = sqlx::query("SELECT filename, url, sha256, size, platform_tag FROM distributions WHERE version_id = ?")
                .bind(version_id)
                .fetch_all(&self.pool)
                .await?;
            let distributions = dist_rows
                .into_iter()
                .map(|d| DistributionRecord {
                    filename: d.get("filename"),
                    url: d.get("url"),
                    sha256: d.get("sha256"),
                    size: d.get::<i64, _>("size") as u64,
                    platform_tag: d.get("platform_tag"),
                })
                .collect();

            let entry_points: BTreeMap<String, String> =
                serde_json::from_str(&row.get::<String, _>("entry_points")).unwrap_or_default();
            let manifest_snapshot: Value =
                serde_json::from_str(&row.get::<String, _>("manifest_snapshot")).unwrap_or(Value::Null);
            let version: Version = row
                .get::<String, _>("version")
                .parse()
                .map_err(|_| RegistryError::Internal("corrupt stored version".into()))?;
            let minimum_ap_version: Version = row
                .get::<String, _>("minimum_ap_version")
                .parse()
                .map_err(|_| RegistryError::Internal("corrupt stored version".into()))?;
            let maximum_ap_version = row
                .get::<Option<String>, _>("maximum_ap_version")
                .map(|s| s.parse::<Version>())
                .transpose()
                .map_err(|_| RegistryError::Internal("corrupt stored version".into()))?;

            records.push(VersionRecord {
                name: name.to_string(),
                version,
                game: row.get("game"),
                description: row.get("description"),
                minimum_ap_version,
                maximum_ap_version,
                entry_points,
                manifest_snapshot,
                distributions,
                published_by: row.get("published_by"),
                provenance_publisher: row.get("provenance_publisher"),
                provenance_workflow: row.get("provenance_workflow"),
                provenance_commit: row.get("provenance_commit"),
                yanked: row.get::<i64, _>("yanked") != 0,
                yank_reason: row.get("yank_reason"),
                created_at: parse_rfc3339(&row.get::<String, _>("created_at")),
            });
        }
        Ok(records)
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    package_id: i64,
    record: &VersionRecord,
) -> Result<(), RegistryError> {
    let entry_points_json = serde_json::to_string(&record.entry_points).unwrap_or_default();
    let snapshot_json = serde_json::to_string(&record.manifest_snapshot).unwrap_or_default();

    let result = sqlx::query(
        "INSERT INTO versions (package_id, version, game, description, minimum_ap_version, maximum_ap_version,
                                entry_points, manifest_snapshot, published_by, provenance_publisher,
                                provenance_workflow, provenance_commit, yanked, yank_reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, ?)",
    )
    .bind(package_id)
    .bind(record.version.to_string())
    .bind(&record.game)
    .bind(&record.description)
    .bind(record.minimum_ap_version.to_string())
    .bind(record.maximum_ap_version.as_ref().map(|v| v.to_string()))
    .bind(entry_points_json)
    .bind(snapshot_json)
    .bind(&record.published_by)
    .bind(&record.provenance_publisher)
    .bind(&record.provenance_workflow)
    .bind(&record.provenance_commit)
    .bind(record.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await;

    let version_id = match result {
        Ok(r) => r.last_insert_rowid(),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            return Err(RegistryError::VersionExists(record.name.clone(), record.version.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    for distribution in &record.distributions {
        sqlx::query(
            "INSERT INTO distributions (version_id, filename, url, sha256, size, platform_tag) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(version_id)
        .bind(&distribution.filename)
        .bind(&distribution.url)
        .bind(&distribution.sha256)
        .bind(distribution.size as i64)
        .bind(&distribution.platform_tag)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}

/// Distinguishes a genuinely transient database error (lock contention,
/// busy connection) from a permanent conflict that should fail immediately.
/// Unique-violation conflicts are already mapped to `NameClaimed`/
/// `VersionExists` before reaching this check, so only `Internal` lands here.
fn is_transient_conflict(err: &RegistryError) -> bool {
    match err {
        RegistryError::Internal(message) => {
            let lower = message.to_lowercase();
            lower.contains("database is locked") || lower.contains("busy") || lower.contains("conflict")
        }
        _ => false,
    }
}

#[async_trait::async_trait]
impl crate::identity::TokenLookup for Store {
    async fn resolve(&self, token: &str) -> Result<Option<String>, RegistryError> {
        self.lookup_api_token(token).await
    }
}
