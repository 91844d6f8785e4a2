//! API routes and handlers

pub mod inference;
pub mod session;

use axum::{
    routing::{get, post},
    Router,
};
use cactus_core::{DeviceRegistry, Engine};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the main API router.
pub fn create_router<E: Engine, R: DeviceRegistry>(state: AppState<E, R>, cors: bool) -> Router {
    let v1_routes = Router::new()
        .route("/health", get(session::health::<E, R>))
        .route("/device", get(session::device::<E, R>))
        .route("/session/init", post(session::init::<E, R>))
        .route("/session/reset", post(session::reset::<E, R>))
        .route("/session/stop", post(session::stop::<E, R>))
        .route("/session/destroy", post(session::destroy::<E, R>))
        .route("/complete", post(inference::complete::<E, R>))
        .route("/transcribe", post(inference::transcribe::<E, R>))
        .route("/embeddings", post(inference::embeddings::<E, R>));

    let router = Router::new()
        .nest("/v1", v1_routes)
        .layer(TraceLayer::new_for_http());

    let router = if cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}
