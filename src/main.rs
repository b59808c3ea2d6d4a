//! Process entry point: load configuration, wire up the registry's
//! components, and serve the HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use wares_registry::config::Config;
use wares_registry::coordinator::Coordinator;
use wares_registry::http::{self, AppState};
use wares_registry::identity::IdentityService;
use wares_registry::ratelimit::RateLimiter;
use wares_registry::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("wares_registry=debug,tower_http=debug")
        .init();

    let config = Config::from_env();

    let store = Arc::new(Store::connect(&config.database_url).await?);
    let coordinator = Coordinator::new(store.clone(), config.fetch_limits(), config.publish_deadline);
    let identity = IdentityService::new(
        config.federated_providers.clone(),
        config.signing_key_cache_ttl,
        store.clone(),
    );
    let rate_limiter = RateLimiter::new(config.rate_limit);

    let state = Arc::new(AppState { store, coordinator, identity, rate_limiter });

    let app = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Wares registry listening on {}", listener.local_addr()?);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
