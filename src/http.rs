//! Axum router and request handlers.
//!
//! Router construction follows the usual axum shape (CORS layer,
//! `TraceLayer`, `State<Arc<AppState>>` extractor) under a `/v1` prefix.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

const REQUEST_ID_HEADER: &str = "x-request-id";

use crate::coordinator::{Coordinator, PublishOutcome, PublishRequest};
use crate::discovery::{Discovery, SearchQuery as DiscoverySearchQuery};
use crate::error::RegistryError;
use crate::identity::{IdentityService, Principal};
use crate::ratelimit::{Operation, RateLimiter};
use crate::store::Store;
use crate::version::Version;

pub struct AppState {
    pub store: Arc<Store>,
    pub coordinator: Coordinator,
    pub identity: IdentityService,
    pub rate_limiter: RateLimiter,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::ACCEPT, header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/v1/packages", get(list_packages))
        .route("/v1/packages/:name", get(get_package))
        .route("/v1/packages/:name/versions", get(list_versions))
        .route("/v1/packages/:name/:version", get(get_version))
        .route("/v1/packages/:name/:version/yank", delete(yank_version))
        .route("/v1/search", get(search))
        .route("/v1/index.json", get(snapshot))
        .route("/v1/register", post(register))
        .route("/v1/health", get(health))
        .layer(cors)
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER.parse().unwrap(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(REQUEST_ID_HEADER.parse().unwrap()))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    offset: Option<i64>,
    limit: Option<i64>,
}

async fn list_packages(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, RegistryError> {
    state.rate_limiter.check(&addr.ip().to_string(), Operation::Read)?;
    let discovery = Discovery::new(&state.store);
    let packages = discovery.list_packages(page.offset.unwrap_or(0), page.limit.unwrap_or(50)).await?;
    Ok(Json(json!({ "packages": packages })))
}

async fn get_package(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, RegistryError> {
    state.rate_limiter.check(&addr.ip().to_string(), Operation::Read)?;
    let discovery = Discovery::new(&state.store);
    let (package, versions) = discovery.get_package(&name).await?;
    Ok(Json(json!({ "package": package, "versions": versions })))
}

async fn list_versions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, RegistryError> {
    state.rate_limiter.check(&addr.ip().to_string(), Operation::Read)?;
    let discovery = Discovery::new(&state.store);
    let versions = discovery.list_versions(&name).await?;
    Ok(Json(json!({ "versions": versions })))
}

async fn get_version(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, RegistryError> {
    state.rate_limiter.check(&addr.ip().to_string(), Operation::Read)?;
    let version = parse_version(&version)?;
    let discovery = Discovery::new(&state.store);
    let record = discovery.get_version(&name, &version).await?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
    game: Option<String>,
    entry_point: Option<String>,
    compatible_with: Option<String>,
    platform: Option<String>,
}

async fn search(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, RegistryError> {
    state.rate_limiter.check(&addr.ip().to_string(), Operation::Read)?;
    let query = DiscoverySearchQuery {
        q: params.q,
        game: params.game,
        entry_point: params.entry_point,
        compatible_with: params.compatible_with.map(|v| parse_version(&v)).transpose()?,
        platform: params.platform,
    };
    let discovery = Discovery::new(&state.store);
    let results = discovery.search(&query).await?;
    Ok(Json(json!({ "results": results })))
}

async fn snapshot(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, RegistryError> {
    state.rate_limiter.check(&addr.ip().to_string(), Operation::Read)?;
    let discovery = Discovery::new(&state.store);
    Ok(Json(discovery.snapshot().await?))
}

async fn register(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<impl IntoResponse, RegistryError> {
    let principal = authenticate(&state, &headers).await?;
    state.rate_limiter.check(&principal_rate_key(&principal, &addr), Operation::Publish)?;

    match state.coordinator.publish(&principal, request).await? {
        PublishOutcome::Committed => Ok((StatusCode::OK, Json(json!({ "status": "committed" })))),
        PublishOutcome::IdempotentReplay => Ok((StatusCode::OK, Json(json!({ "status": "already-published" })))),
    }
}

#[derive(Debug, Deserialize)]
struct YankRequest {
    reason: String,
}

async fn yank_version(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Path((name, version)): Path<(String, String)>,
    Json(body): Json<YankRequest>,
) -> Result<impl IntoResponse, RegistryError> {
    let principal = authenticate(&state, &headers).await?;
    state.rate_limiter.check(&principal_rate_key(&principal, &addr), Operation::Publish)?;
    let version = parse_version(&version)?;
    state.coordinator.yank(&principal, &name, &version, &body.reason).await?;
    Ok(StatusCode::OK)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, RegistryError> {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(RegistryError::Unauthenticated)?;
    state.identity.resolve_bearer(credential).await
}

fn principal_rate_key(principal: &Principal, addr: &SocketAddr) -> String {
    match principal {
        Principal::Anonymous(_) => format!("anon:{}", addr.ip()),
        other => other.key(),
    }
}

fn parse_version(raw: &str) -> Result<Version, RegistryError> {
    raw.parse()
}
