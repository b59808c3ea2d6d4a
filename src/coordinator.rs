//! Registration coordinator: the publish pipeline.
//!
//! Generalizes a base64-tarball-upload handler into fetch-then-verify-by-URL,
//! with concurrent per-distribution fetches that cancel each other on first
//! failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::digest::ComputedDigest;
use crate::error::RegistryError;
use crate::fetch::{ArtifactFetcher, FetchLimits};
use crate::filename::{self, ParsedFilename};
use crate::identity::Principal;
use crate::manifest::{self, Manifest, RawManifest};
use crate::ownership::{self, Authorization};
use crate::store::{DistributionRecord, Store, VersionRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionRegistration {
    pub filename: String,
    pub url: String,
    pub sha256: String,
    pub size: u64,
    pub platform_tag: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    #[serde(flatten)]
    pub manifest: RawManifest,
    pub distributions: Vec<DistributionRegistration>,
}

/// Milestones a publish passes through, per the design's state machine.
/// Only used for logging; callers observe success/failure, not the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Received,
    Authenticated,
    Authorized,
    Validated,
    Fetching,
    Verified,
    Committed,
    Rejected,
}

pub enum PublishOutcome {
    Committed,
    IdempotentReplay,
}

pub struct Coordinator {
    store: Arc<Store>,
    fetcher: ArtifactFetcher,
    max_concurrent_fetches: usize,
    /// Overall deadline for a publish's distribution fan-out, distinct from
    /// `FetchLimits.deadline`'s per-fetch timeout on the underlying client.
    publish_deadline: Duration,
}

const MAX_CONCURRENT_FETCHES: usize = 8;
const SHA256_HEX_LEN: usize = 64;

impl Coordinator {
    pub fn new(store: Arc<Store>, limits: FetchLimits, publish_deadline: Duration) -> Self {
        Coordinator {
            store,
            fetcher: ArtifactFetcher::new(limits),
            max_concurrent_fetches: MAX_CONCURRENT_FETCHES,
            publish_deadline,
        }
    }

    pub async fn publish(
        &self,
        principal: &Principal,
        request: PublishRequest,
    ) -> Result<PublishOutcome, RegistryError> {
        tracing::debug!(state = ?PublishState::Received, principal = %principal.key(), "publish received");

        let snapshot = serde_json::to_value(&request.manifest).unwrap_or_default();
        let manifest = manifest::validate(request.manifest, snapshot)?;
        tracing::debug!(state = ?PublishState::Validated, name = %manifest.name, version = %manifest.version, "manifest validated");

        let ownership = self.store.load_ownership(&manifest.name).await?;
        let authorization = ownership::authorize(principal, ownership.as_ref())?;
        tracing::debug!(state = ?PublishState::Authorized, "principal authorized");

        for registration in &request.distributions {
            self.check_registration_shape(&manifest, registration)?;
        }

        if let Some(existing) = self.store.existing_version(&manifest.name, &manifest.version).await? {
            if existing.manifest_snapshot == manifest.snapshot
                && existing.published_by == principal.key()
                && distributions_match(&existing.distributions, &request.distributions)
            {
                return Ok(PublishOutcome::IdempotentReplay);
            }
            return Err(RegistryError::VersionExists(manifest.name.clone(), manifest.version.to_string()));
        }

        tracing::debug!(state = ?PublishState::Fetching, count = request.distributions.len(), "fetching distributions");
        let distributions = self.fetch_all(&request.distributions).await?;
        tracing::debug!(state = ?PublishState::Verified, "all distributions verified");

        let record = VersionRecord {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            game: manifest.game.clone(),
            description: manifest.description.clone(),
            minimum_ap_version: manifest.minimum_compat.clone(),
            maximum_ap_version: manifest.maximum_compat.clone(),
            entry_points: manifest.entry_points.clone(),
            manifest_snapshot: manifest.snapshot.clone(),
            distributions,
            published_by: principal.key(),
            provenance_publisher: provenance_publisher(principal),
            provenance_workflow: provenance_workflow(principal),
            provenance_commit: provenance_commit(principal),
            yanked: false,
            yank_reason: None,
            created_at: Utc::now(),
        };

        match authorization {
            Authorization::Claim => self.store.commit_claim(principal, &record).await?,
            Authorization::Authorized => self.store.commit_version(&record).await?,
        }
        tracing::debug!(state = ?PublishState::Committed, "publish committed");

        Ok(PublishOutcome::Committed)
    }

    pub async fn yank(&self, principal: &Principal, name: &str, version: &crate::version::Version, reason: &str) -> Result<(), RegistryError> {
        let ownership = self
            .store
            .load_ownership(name)
            .await?
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_string()))?;
        ownership::authorize(principal, Some(&ownership))?;
        self.store.yank(name, version, reason).await
    }

    fn check_registration_shape(
        &self,
        manifest: &Manifest,
        registration: &DistributionRegistration,
    ) -> Result<(), RegistryError> {
        let parsed = filename::parse_filename(&registration.filename)?;
        filename::check_agreement(
            &parsed,
            &manifest.name,
            &manifest.version,
            declared_tag(&parsed, registration),
        )?;

        if !registration.url.starts_with("https://") {
            return Err(RegistryError::UrlNotHttps(registration.url.clone()));
        }
        if registration.sha256.len() != SHA256_HEX_LEN || !registration.sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RegistryError::InvalidManifest(vec![crate::error::FieldError {
                field: "distributions.sha256".to_string(),
                message: "must be 64 lowercase hex characters".to_string(),
                offending_value: Some(serde_json::json!(registration.sha256)),
            }]));
        }
        Ok(())
    }

    /// Fetch every registered distribution concurrently, bounded to
    /// `max_concurrent_fetches` in flight, under a single shared deadline.
    /// The first failure cancels all siblings; no partial state is ever
    /// returned to the caller.
    async fn fetch_all(
        &self,
        registrations: &[DistributionRegistration],
    ) -> Result<Vec<DistributionRecord>, RegistryError> {
        let cancel = CancellationToken::new();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.max_concurrent_fetches));

        let tasks: Vec<_> = registrations
            .iter()
            .cloned()
            .map(|registration| {
                let cancel = cancel.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore is never closed");
                    let fetched = self.fetcher.fetch_and_verify(&registration.url, &cancel).await?;
                    let digest = ComputedDigest { hex: fetched.digest_hex, size: fetched.size };
                    digest.verify(&registration.url, &registration.sha256, Some(registration.size))?;
                    Ok::<_, RegistryError>(DistributionRecord {
                        filename: registration.filename,
                        url: registration.url,
                        sha256: digest.hex,
                        size: digest.size,
                        platform_tag: registration.platform_tag,
                    })
                }
            })
            .collect();

        let deadline_fut = tokio::time::timeout(self.publish_deadline, futures::future::join_all(tasks));
        let results = match deadline_fut.await {
            Ok(results) => results,
            Err(_) => {
                cancel.cancel();
                return Err(RegistryError::FetchTimeout("publish deadline exceeded".to_string()));
            }
        };

        let mut distributions = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(record) => distributions.push(record),
                Err(err) => {
                    cancel.cancel();
                    return Err(err);
                }
            }
        }
        Ok(distributions)
    }
}

fn declared_tag<'a>(parsed: &ParsedFilename, registration: &'a DistributionRegistration) -> Option<&'a str> {
    match parsed {
        ParsedFilename::Binary { .. } => Some(registration.platform_tag.as_str()),
        ParsedFilename::Source { .. } => None,
    }
}

fn provenance_publisher(principal: &Principal) -> Option<String> {
    match principal {
        Principal::Federated { repository, .. } => Some(repository.clone()),
        _ => None,
    }
}

fn provenance_workflow(principal: &Principal) -> Option<String> {
    match principal {
        Principal::Federated { workflow, .. } => workflow.clone(),
        _ => None,
    }
}

fn provenance_commit(principal: &Principal) -> Option<String> {
    match principal {
        Principal::Federated { commit, .. } => commit.clone(),
        _ => None,
    }
}

/// Whether a republish's distribution set is identical to what's already
/// committed for this version, filename/url/digest/size/platform_tag alike,
/// irrespective of submission order.
fn distributions_match(existing: &[DistributionRecord], candidates: &[DistributionRegistration]) -> bool {
    if existing.len() != candidates.len() {
        return false;
    }
    let mut existing_sorted: Vec<&DistributionRecord> = existing.iter().collect();
    existing_sorted.sort_by(|a, b| a.filename.cmp(&b.filename));
    let mut candidates_sorted: Vec<&DistributionRegistration> = candidates.iter().collect();
    candidates_sorted.sort_by(|a, b| a.filename.cmp(&b.filename));

    existing_sorted.iter().zip(candidates_sorted.iter()).all(|(e, c)| {
        e.filename == c.filename
            && e.url == c.url
            && e.sha256.eq_ignore_ascii_case(&c.sha256)
            && e.size == c.size
            && e.platform_tag == c.platform_tag
    })
}
