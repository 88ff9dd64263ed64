//! Saga server entry point.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use saga::{EngineConfig, Orchestrator, StepRegistry, TracingPublisher};
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use server::AppState;
use server::config::{LogFormat, ServerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve<S: SagaStore>(
    store: S,
    registry: StepRegistry,
    engine_config: EngineConfig,
    config: &ServerConfig,
    metrics: PrometheusHandle,
) {
    let orchestrator = Orchestrator::new(store, registry, engine_config);
    let (engine, tasks) = saga::engine::spawn(orchestrator.clone(), TracingPublisher);

    let state = Arc::new(AppState {
        orchestrator,
        engine: engine.clone(),
        metrics,
    });
    let app = server::create_app(state);

    let addr = config.addr();
    tracing::info!(%addr, "starting saga server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Workers finish the item in hand; queued work is answered with ShuttingDown.
    engine.shutdown();
    tasks.join().await;
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = ServerConfig::from_env();
    init_tracing(&config);
    let engine_config = EngineConfig::from_env().expect("invalid engine configuration");
    let registry = server::load_registry(&config).expect("invalid step registry");

    // 2. Install Prometheus metrics recorder
    let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store and run until a shutdown signal arrives
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresSagaStore::new(pool);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga store");
            serve(store, registry, engine_config, &config, metrics).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory saga store");
            serve(InMemorySagaStore::new(), registry, engine_config, &config, metrics).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
