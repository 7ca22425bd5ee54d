use crate::app_state::{AppState, SharedAppState, StatusBoard, StatusReport};
use crate::error::EnsembleError;
use crate::metrics::{metrics_handler, record_response_metrics, request_counter};
use crate::simulation::SimulationRecord;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// The service served over HTTP.
pub type Service = Router;

/// Returns a [Router] for the status and metrics endpoints.
pub fn router(status: StatusBoard) -> Router {
    let state: SharedAppState = Arc::new(AppState::new(status));

    fn v1() -> Router<SharedAppState> {
        Router::new().route("/simulations/:id", get(simulation))
    }

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_report))
        .nest("/v1", v1())
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .on_request(request_counter)
                    .on_response(record_response_metrics),
            ),
        )
        .with_state(state)
}

/// Returns the [Service] that serves the status board.
pub fn service(status: StatusBoard) -> Service {
    router(status)
}

async fn status_report(State(state): State<SharedAppState>) -> Json<StatusReport> {
    Json(state.status.snapshot())
}

async fn simulation(
    State(state): State<SharedAppState>,
    Path(id): Path<usize>,
) -> Result<Json<SimulationRecord>, EnsembleError> {
    state
        .status
        .simulation(id)
        .map(Json)
        .ok_or(EnsembleError::UnknownSimulation { id })
}
