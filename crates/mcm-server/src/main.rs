use mcm_provider::engine::EngineConfig;
use mcm_server::config::AppConfig;
use mcm_server::routes::api_router;
use mcm_server::state::AppState;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Machine backends
    let providers = mcm_provider::build_providers().expect("failed to build machine backends");
    tracing::info!(providers = ?providers.available(), "machine backends ready");

    let engine_config = EngineConfig::from_env();
    tracing::info!(?engine_config, auth = config.api_key.is_some(), "lifecycle engine configured");

    let state = AppState {
        providers,
        engine_config,
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting machine provider API");

    axum::serve(listener, app).await.expect("server error");
}
