//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the registry resolves to one of these kinds.
//! The HTTP surface maps each variant to exactly one status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
    #[error("invalid manifest")]
    InvalidManifest(Vec<FieldError>),
    #[error("filename name disagrees with manifest name")]
    NameMismatch,
    #[error("filename version disagrees with manifest version")]
    VersionMismatch,
    #[error("filename platform tag disagrees with distribution platform_tag")]
    TagMismatch,

    #[error("authentication required")]
    Unauthenticated,
    #[error("invalid or unknown token")]
    TokenInvalid,
    #[error("token expired")]
    TokenExpired,
    #[error("forbidden: {0}")]
    Forbidden(ForbiddenReason),

    #[error("package not found: {0}")]
    PackageNotFound(String),
    #[error("version not found: {0}@{1}")]
    VersionNotFound(String, String),
    #[error("version already exists: {0}@{1}")]
    VersionExists(String, String),
    #[error("package name already claimed: {0}")]
    NameClaimed(String),

    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    DigestMismatch { url: String, expected: String, actual: String },
    #[error("size mismatch for {url}: expected {expected}, got {actual}")]
    SizeMismatch { url: String, expected: u64, actual: u64 },

    #[error("url scheme must be https: {0}")]
    UrlNotHttps(String),
    #[error("url unreachable: {0}")]
    UrlUnreachable(String),
    #[error("redirect limit exceeded fetching {0}")]
    UrlRedirectLimit(String),
    #[error("fetch timed out: {0}")]
    FetchTimeout(String),
    #[error("size limit exceeded for {url}: {size} > {limit}")]
    SizeLimitExceeded { url: String, size: u64, limit: u64 },

    #[error("rate limited")]
    RateLimited { limit: u32, remaining: u32, reset_epoch_seconds: i64 },

    #[error("internal error")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub offending_value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForbiddenReason {
    NotOwner,
    NoMatchingTrustedPublisher,
}

impl std::fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ForbiddenReason::NotOwner => "not-owner",
            ForbiddenReason::NoMatchingTrustedPublisher => "no-matching-trusted-publisher",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl RegistryError {
    fn code(&self) -> &'static str {
        match self {
            RegistryError::InvalidVersion(_) => "invalid-version",
            RegistryError::InvalidFilename(_) => "invalid-filename",
            RegistryError::InvalidManifest(_) => "invalid-manifest",
            RegistryError::NameMismatch => "name-mismatch",
            RegistryError::VersionMismatch => "version-mismatch",
            RegistryError::TagMismatch => "tag-mismatch",
            RegistryError::Unauthenticated => "unauthenticated",
            RegistryError::TokenInvalid => "token-invalid",
            RegistryError::TokenExpired => "token-expired",
            RegistryError::Forbidden(_) => "forbidden",
            RegistryError::PackageNotFound(_) => "package-not-found",
            RegistryError::VersionNotFound(_, _) => "version-not-found",
            RegistryError::VersionExists(_, _) => "version-exists",
            RegistryError::NameClaimed(_) => "name-claimed",
            RegistryError::DigestMismatch { .. } => "digest-mismatch",
            RegistryError::SizeMismatch { .. } => "size-mismatch",
            RegistryError::UrlNotHttps(_) => "url-not-https",
            RegistryError::UrlUnreachable(_) => "url-unreachable",
            RegistryError::UrlRedirectLimit(_) => "url-redirect-limit",
            RegistryError::FetchTimeout(_) => "fetch-timeout",
            RegistryError::SizeLimitExceeded { .. } => "size-limit-exceeded",
            RegistryError::RateLimited { .. } => "rate-limited",
            RegistryError::Internal(_) => "internal-error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RegistryError::InvalidVersion(_)
            | RegistryError::InvalidFilename(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
            RegistryError::NameMismatch
            | RegistryError::VersionMismatch
            | RegistryError::TagMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            RegistryError::Unauthenticated => StatusCode::UNAUTHORIZED,
            RegistryError::TokenInvalid | RegistryError::TokenExpired => StatusCode::UNAUTHORIZED,
            RegistryError::Forbidden(_) | RegistryError::NameClaimed(_) => StatusCode::FORBIDDEN,
            RegistryError::PackageNotFound(_) | RegistryError::VersionNotFound(_, _) => {
                StatusCode::NOT_FOUND
            }
            RegistryError::VersionExists(_, _) => StatusCode::CONFLICT,
            RegistryError::UrlNotHttps(_) => StatusCode::BAD_REQUEST,
            RegistryError::UrlUnreachable(_)
            | RegistryError::UrlRedirectLimit(_)
            | RegistryError::FetchTimeout(_) => StatusCode::BAD_REQUEST,
            RegistryError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            RegistryError::InvalidManifest(fields) => Some(serde_json::json!(fields)),
            RegistryError::DigestMismatch { url, expected, actual } => Some(serde_json::json!({
                "url": url, "expected": expected, "actual": actual,
            })),
            RegistryError::SizeMismatch { url, expected, actual } => Some(serde_json::json!({
                "url": url, "expected": expected, "actual": actual,
            })),
            RegistryError::UrlUnreachable(url)
            | RegistryError::UrlRedirectLimit(url)
            | RegistryError::FetchTimeout(url)
            | RegistryError::UrlNotHttps(url) => Some(serde_json::json!({ "url": url })),
            RegistryError::SizeLimitExceeded { url, size, limit } => Some(serde_json::json!({
                "url": url, "size": size, "limit": limit,
            })),
            RegistryError::RateLimited { limit, remaining, reset_epoch_seconds } => {
                Some(serde_json::json!({
                    "limit": limit,
                    "remaining": remaining,
                    "reset_epoch_seconds": reset_epoch_seconds,
                }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status();

        if matches!(self, RegistryError::Internal(_)) {
            let correlation_id = Uuid::new_v4();
            error!(%correlation_id, error = %self, "internal error");
            let body = ErrorBody {
                error: ErrorPayload {
                    code: self.code(),
                    message: format!("internal error (correlation id {correlation_id})"),
                    details: None,
                },
            };
            return (status, Json(body)).into_response();
        }

        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for RegistryError {
    fn from(e: sqlx::Error) -> Self {
        RegistryError::Internal(e.to_string())
    }
}
