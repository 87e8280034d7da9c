mod auth;
mod catalog;
mod client_ip;
mod config;
mod error;
mod rate_limit;
mod routes;
mod updates;


use std::net::SocketAddr;
use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parcel_api=info".parse()?)
                .add_directive("parcel_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting parcel-api with config: {:?}", config);

    let state = AppState::from_config(config)?;
    if let Err(error) = state.auth().check_existing().await {
        tracing::warn!("Could not check relay session at startup: {}", error);
    }
    if let Some(source) = state.update_source() {
        updates::spawn_update_pump(source, state.auth());
    }

    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("parcel-api listening on {}", bind_addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
