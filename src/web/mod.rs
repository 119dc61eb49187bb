//! Web server module

mod middleware;
mod routes;

pub use routes::warm_cache;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue},
    routing::get,
    Router,
};
use std::{net::SocketAddr, path::Path, sync::Arc};
use tower_http::{cors::CorsLayer, services::ServeDir, set_header::SetResponseHeaderLayer};
use tracing::info;

use crate::config::{ApiConfig, Config};
use crate::db::Database;
use middleware::RequestLoggingLayer;

pub struct AppState {
    pub db: Database,
    pub config: ApiConfig,
}

/// Clients may reuse an API response for as long as the server caches it
const API_CACHE_CONTROL: &str = "public, max-age=300";

pub fn router(state: Arc<AppState>, dashboard_dir: Option<&Path>) -> Router {
    let api = Router::new()
        .route("/date_range", get(routes::api_date_range))
        .route("/total_attacks", get(routes::api_total_attacks))
        .route("/country_attacks", get(routes::api_country_attacks))
        .route("/unusual_countries", get(routes::api_unusual_countries))
        .route("/ip_attacks", get(routes::api_ip_attacks))
        .route("/ip_attacks_volatile", get(routes::api_ip_attacks_volatile))
        .route("/username_attacks", get(routes::api_username_attacks))
        .route("/username_attacks_volatile", get(routes::api_username_attacks_volatile))
        .route("/asn_attacks", get(routes::api_asn_attacks))
        .route("/asn_attacks_volatile", get(routes::api_asn_attacks_volatile))
        .route("/country_summary", get(routes::api_country_summary))
        .route("/asn_summary", get(routes::api_asn_summary))
        .route("/ip_summary", get(routes::api_ip_summary))
        .route("/username_summary", get(routes::api_username_summary))
        .route("/hourly_patterns", get(routes::api_hourly_patterns))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static(API_CACHE_CONTROL),
        ));

    let mut app = Router::new()
        .route("/", get(routes::index))
        .nest("/api", api);

    if let Some(dir) = dashboard_dir {
        app = app.nest_service("/dashboard", ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(RequestLoggingLayer::new())
        .with_state(state)
}

pub async fn start_server(config: &Config, db: Database) -> Result<()> {
    let state = Arc::new(AppState {
        db,
        config: config.api.clone(),
    });

    warm_cache(&state).await;

    let app = router(state, config.server.dashboard_dir.as_deref());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("API server starting on http://{}", addr);
    if let Some(dir) = &config.server.dashboard_dir {
        info!("Serving dashboard from {} at /dashboard", dir.display());
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
