//! Read-only HTTP status API.

use std::sync::Arc;

use accord_catchup::CatchUpStatus;
use accord_objectivity::KvBackend;
use accord_subjectivity::{Edge, NodeIdentity, Subjectivity};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::driver::CatchUpDriver;

pub struct ApiState<B: KvBackend + 'static> {
    pub view: Arc<Subjectivity>,
    pub driver: Arc<CatchUpDriver<B>>,
}

impl<B: KvBackend + 'static> Clone for ApiState<B> {
    fn clone(&self) -> Self {
        Self {
            view: Arc::clone(&self.view),
            driver: Arc::clone(&self.driver),
        }
    }
}

/// Build the API router.
pub fn build_router<B: KvBackend + 'static>(state: ApiState<B>) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status::<B>))
        .route("/api/v1/neighbors", get(neighbors::<B>))
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub identity: NodeIdentity,
    pub confirmed_neighbors: usize,
    pub tentative_neighbors: usize,
    pub active_tasks: usize,
    pub catch_up: Vec<CatchUpStatus>,
}

async fn status<B: KvBackend + 'static>(State(state): State<ApiState<B>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        identity: state.view.me(),
        confirmed_neighbors: state.view.confirmed_count(),
        tentative_neighbors: state.view.tentative_count(),
        active_tasks: state.view.active_task_count(),
        catch_up: state.driver.statuses(),
    })
}

#[derive(Debug, Serialize)]
pub struct NeighborsResponse {
    pub confirmed: Vec<Edge>,
    pub tentative: Vec<Edge>,
}

async fn neighbors<B: KvBackend + 'static>(
    State(state): State<ApiState<B>>,
) -> Json<NeighborsResponse> {
    Json(NeighborsResponse {
        confirmed: state.view.confirmed(),
        tentative: state.view.tentative(),
    })
}
