//! HTTP server startup
//!
//! Startup order is fixed: configuration, tracing, database open (which runs
//! the schema migrator), then the listener. If migration fails the process
//! exits before binding, so no request ever reaches an unmigrated table.

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::api;
use crate::chat_db::ChatDatabase;
use crate::config::Config;
use crate::metrics;
use crate::shared_state::AppState;
use crate::telemetry;

/// Run the HTTP server until ctrl-c
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    telemetry::init_tracing();
    metrics::init_metrics()?;
    cfg.print_config();

    let options = cfg.database_options();
    let db = tokio::task::spawn_blocking(move || ChatDatabase::open(&options)).await??;
    info!("{}", db.migration_report());

    let addr = cfg.api_addr()?;
    let state = AppState::new(db, cfg);
    let app = build_router(state.clone(), &state.config);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Router with every endpoint and the shared middleware stack
pub fn build_router(state: AppState, cfg: &Config) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/stats", get(api::stats))
        .route("/api/chats", get(api::list_chats).post(api::save_chat))
        .route("/api/chats/last", get(api::get_last_chat))
        .route("/api/chats/:id", get(api::get_chat).delete(api::delete_chat))
        .route("/api/chats/:id/context", put(api::update_context))
        .route("/api/chats/:id/rename", put(api::rename_chat))
        .route("/api/chats/:id/messages/:message_id", delete(api::delete_message))
        .route("/save-context", post(api::save_context))
        .route("/metrics", get(metrics::get_metrics))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(cfg.max_body_bytes))
        .layer(cors_layer(&cfg.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(cfg.request_timeout_seconds)))
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    if allowed_origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
