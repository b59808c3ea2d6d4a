//! Identity resolution: API tokens and federated JWTs to a principal.
//!
//! Splits opaque-token lookup from federated provider-claims verification,
//! using pure bearer-token verification rather than a browser OAuth dance,
//! since publish credentials arrive pre-minted (a CI-issued OIDC token or a
//! long-lived API token), never via redirect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::RegistryError;

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    ApiToken(String),
    Federated {
        provider: String,
        repository: String,
        workflow: Option<String>,
        environment: Option<String>,
        commit: Option<String>,
    },
    Anonymous(String),
}

impl Principal {
    /// The string recorded as package owner / collaborator / trusted-publisher
    /// match target.
    pub fn key(&self) -> String {
        match self {
            Principal::ApiToken(principal) => principal.clone(),
            Principal::Federated { provider, repository, .. } => format!("federated:{provider}:{repository}"),
            Principal::Anonymous(source) => format!("anon:{source}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FederatedClaims {
    iss: String,
    aud: String,
    #[serde(default)]
    repository: Option<String>,
    #[serde(rename = "ref", default)]
    workflow_ref: Option<String>,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    environment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

struct CachedKeys {
    keys: HashMap<String, Jwk>,
    fetched_at: Instant,
}

/// A single configured federated provider: where to fetch keys, what issuer
/// and audience a token must present.
#[derive(Debug, Clone)]
pub struct FederatedProvider {
    pub name: String,
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
}

pub struct IdentityService {
    http: reqwest::Client,
    providers: Vec<FederatedProvider>,
    key_cache: RwLock<HashMap<String, CachedKeys>>,
    cache_ttl: Duration,
    tokens: Arc<dyn TokenLookup>,
}

/// Store-backed resolution of an opaque API token to a principal name.
/// Kept as a trait so `identity` does not depend on `store`'s concrete type.
#[async_trait::async_trait]
pub trait TokenLookup: Send + Sync {
    async fn resolve(&self, token: &str) -> Result<Option<String>, RegistryError>;
}

impl IdentityService {
    pub fn new(providers: Vec<FederatedProvider>, cache_ttl: Duration, tokens: Arc<dyn TokenLookup>) -> Self {
        IdentityService {
            http: reqwest::Client::new(),
            providers,
            key_cache: RwLock::new(HashMap::new()),
            cache_ttl,
            tokens,
        }
    }

    /// Resolve a `Authorization: Bearer <credential>` value. Dispatch is
    /// purely structural: three dot-separated base64url segments mean JWT,
    /// anything else is looked up as an opaque API token.
    pub async fn resolve_bearer(&self, credential: &str) -> Result<Principal, RegistryError> {
        if looks_like_jwt(credential) {
            self.resolve_federated(credential).await
        } else {
            self.resolve_api_token(credential).await
        }
    }

    pub fn anonymous(&self, source_addr: &str) -> Principal {
        Principal::Anonymous(source_addr.to_string())
    }

    async fn resolve_api_token(&self, token: &str) -> Result<Principal, RegistryError> {
        match self.tokens.resolve(token).await? {
            Some(principal) => Ok(Principal::ApiToken(principal)),
            None => Err(RegistryError::TokenInvalid),
        }
    }

    async fn resolve_federated(&self, jwt: &str) -> Result<Principal, RegistryError> {
        let header = jsonwebtoken::decode_header(jwt).map_err(|_| RegistryError::TokenInvalid)?;
        let kid = header.kid.ok_or(RegistryError::TokenInvalid)?;

        for provider in &self.providers {
            let keys = self.keys_for(provider).await?;
            let Some(jwk) = keys.get(&kid) else { continue };

            let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
                .map_err(|_| RegistryError::TokenInvalid)?;

            let mut validation = Validation::new(Algorithm::RS256);
            validation.set_audience(&[provider.audience.clone()]);
            validation.set_issuer(&[provider.issuer.clone()]);

            let token_data = decode::<FederatedClaims>(jwt, &decoding_key, &validation).map_err(|err| {
                use jsonwebtoken::errors::ErrorKind;
                match err.kind() {
                    ErrorKind::ExpiredSignature => RegistryError::TokenExpired,
                    _ => RegistryError::TokenInvalid,
                }
            })?;

            let claims = token_data.claims;
            let repository = claims.repository.ok_or(RegistryError::TokenInvalid)?;
            return Ok(Principal::Federated {
                provider: provider.name.clone(),
                repository,
                workflow: claims.workflow_ref,
                environment: claims.environment,
                commit: claims.sha,
            });
        }

        Err(RegistryError::TokenInvalid)
    }

    /// Keys for one provider, served from cache within `cache_ttl`. On a
    /// refetch failure, falls back to the previous cached set rather than
    /// failing every in-flight verification.
    async fn keys_for(&self, provider: &FederatedProvider) -> Result<HashMap<String, Jwk>, RegistryError> {
        {
            let cache = self.key_cache.read();
            if let Some(cached) = cache.get(&provider.name) {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.keys.clone());
                }
            }
        }

        match self.fetch_jwks(provider).await {
            Ok(jwks) => {
                let keys: HashMap<String, Jwk> = jwks.keys.into_iter().map(|k| (k.kid.clone(), k)).collect();
                self.key_cache
                    .write()
                    .insert(provider.name.clone(), CachedKeys { keys: keys.clone(), fetched_at: Instant::now() });
                Ok(keys)
            }
            Err(err) => {
                let cache = self.key_cache.read();
                if let Some(cached) = cache.get(&provider.name) {
                    warn!(provider = %provider.name, "jwks fetch failed, serving stale cached keys");
                    Ok(cached.keys.clone())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn fetch_jwks(&self, provider: &FederatedProvider) -> Result<Jwks, RegistryError> {
        self.http
            .get(&provider.jwks_url)
            .send()
            .await
            .map_err(|_| RegistryError::Internal(format!("jwks fetch failed for {}", provider.name)))?
            .json::<Jwks>()
            .await
            .map_err(|_| RegistryError::Internal(format!("jwks decode failed for {}", provider.name)))
    }
}

fn looks_like_jwt(credential: &str) -> bool {
    credential.split('.').count() == 3
}

/// Constant-time comparison used by in-memory `TokenLookup` implementations
/// so an opaque-token database never leaks match length via timing.
pub fn tokens_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
