//! HTTP surface for the saga orchestration engine.
//!
//! Start, inspect and abort sagas, feed worker replies in, and look at the
//! dead-letter sink. Writes go through the engine's worker pool; reads hit
//! the store directly. Structured logging (tracing) and Prometheus metrics
//! are wired in by the binary.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{EngineHandle, Orchestrator, StepDescriptor, StepRegistry};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::ServerConfig;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore> {
    pub orchestrator: Orchestrator<S>,
    pub engine: EngineHandle,
    pub metrics: PrometheusHandle,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/metrics", get(routes::metrics::get::<S>))
        .route("/processes", post(routes::processes::start::<S>))
        .route("/processes/{id}", get(routes::processes::get::<S>))
        .route("/processes/{id}/abort", post(routes::processes::abort::<S>))
        .route("/events", post(routes::events::submit::<S>))
        .route("/dead-letters", get(routes::dead_letters::list::<S>))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Loads the step registry named by the configuration, or the built-in one.
pub fn load_registry(config: &ServerConfig) -> saga::Result<StepRegistry> {
    match &config.registry_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading step registry");
            StepRegistry::load(path)
        }
        None => default_registry(),
    }
}

/// The order fulfillment saga: reserve inventory, charge payment, ship.
pub fn default_registry() -> saga::Result<StepRegistry> {
    let mut registry = StepRegistry::new();
    registry.register_step(StepDescriptor::new("ReserveInventory").compensated_by("ReleaseInventory"))?;
    registry.register_step(StepDescriptor::new("ChargePayment").compensated_by("RefundPayment"))?;
    registry.register_step(StepDescriptor::new("CreateShipment").compensated_by("CancelShipment"))?;
    registry.define_saga(
        "OrderFulfillment",
        ["ReserveInventory", "ChargePayment", "CreateShipment"],
    )?;
    Ok(registry)
}
