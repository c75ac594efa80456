use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use medina_api::breaker::{Breaker, BreakerConfig};
use medina_api::budget::BudgetEnforcer;
use medina_api::config::MedinaConfig;
use medina_api::gateway::{Gateway, GatewayConfig, ReqwestTransport};
use medina_api::load_shed::{LoadShedder, ShedConfig};
use medina_api::service_mode::ModeController;
use medina_api::store::Store;
use medina_api::{AppState, alert_engine, handlers, metrics, retention, searches, service_mode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("medina_api=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("MEDINA_CONFIG").unwrap_or_else(|_| "./medina.toml".to_string());
    let config = MedinaConfig::load(&config_path)?;

    let db_path = std::env::var("MEDINA_DB").unwrap_or_else(|_| "./medina.db".to_string());
    let store = Arc::new(Store::open(&db_path)?);
    tracing::info!("store opened at {db_path}");

    let api_key = std::env::var("GOOGLE_PLACES_API_KEY").ok();
    if api_key.is_none() {
        tracing::warn!("GOOGLE_PLACES_API_KEY is not set; provider calls will fail");
    }

    let metrics_sink = metrics::spawn(store.clone());
    let shedder = LoadShedder::new(
        store.clone(),
        metrics_sink.clone(),
        ShedConfig {
            max_concurrent: config.load.max_concurrent,
            queue_caps: config.queue_caps(),
        },
    );
    let budget = Arc::new(BudgetEnforcer::new(store.clone(), config.budget_overrides()));
    let gateway = Arc::new(Gateway::new(
        store.clone(),
        Breaker::new(
            store.clone(),
            BreakerConfig {
                failure_threshold: config.breaker.failure_threshold,
                half_open_delay_secs: config.breaker.half_open_delay_secs,
            },
        ),
        budget.clone(),
        shedder.clone(),
        metrics_sink.clone(),
        Arc::new(ReqwestTransport::new()),
        GatewayConfig {
            timeout_secs: config.gateway.timeout_secs,
            base_url: config.gateway.base_url.clone(),
            api_key,
        },
    ));
    let mode = ModeController::new(store.clone(), budget);

    // Background engines
    service_mode::spawn_mode_controller(mode.clone());
    alert_engine::spawn_alert_engine(store.clone(), mode.clone());
    searches::spawn_search_maintenance(store.clone());
    retention::spawn_retention_enforcer(store.clone(), config.retention.metrics_days);

    let state = AppState {
        store,
        gateway,
        mode,
        shedder,
    };

    let app = Router::new()
        // Provider gateway
        .route("/api/v1/provider/request", post(handlers::provider::provider_request))
        // Service mode
        .route(
            "/api/v1/service-mode",
            get(handlers::service_mode::get_service_mode)
                .put(handlers::service_mode::set_service_mode),
        )
        .route(
            "/api/v1/service-mode/history",
            get(handlers::service_mode::get_service_mode_history),
        )
        // Tile cache
        .route("/api/v1/tiles/check", post(handlers::tiles::check_tile_cache))
        .route("/api/v1/tiles/write", post(handlers::tiles::write_tile_cache))
        .route("/api/v1/tiles/viewport", post(handlers::tiles::tiles_for_viewport))
        // Popular searches
        .route("/api/v1/searches/log", post(handlers::searches::log_search))
        .route("/api/v1/searches/popular", get(handlers::searches::popular_searches))
        .route(
            "/api/v1/searches/recent",
            get(handlers::searches::my_recent_searches)
                .delete(handlers::searches::clear_my_search_history),
        )
        // Observability
        .route("/api/v1/load", get(handlers::load::get_load_state))
        .route("/api/v1/metrics/summary", get(handlers::metrics::metric_summary))
        .route("/api/v1/metrics/cache-hit-rate", get(handlers::metrics::cache_hit_rate))
        .route("/api/v1/alerts", get(handlers::alerts::list_alerts))
        // Health
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("medina-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
