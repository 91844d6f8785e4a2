//! Session lifecycle and device endpoints

use axum::{extract::State, Json};
use cactus_core::{DeviceRegistry, Engine};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Model load request
#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub model_path: String,
    #[serde(default)]
    pub context_size: Option<usize>,
    #[serde(default)]
    pub corpus_dir: Option<String>,
}

/// Session status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub initialized: bool,
}

/// Device id response
#[derive(Debug, Serialize)]
pub struct DeviceResponse {
    pub device_id: Option<String>,
}

/// Health check endpoint. Answers while a generation is running.
pub async fn health<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        initialized: state.session.is_loaded(),
    })
}

/// Load a model into the session
pub async fn init<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
    Json(request): Json<InitRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let model_path = state.config.model_path(&request.model_path);
    let context_size = request.context_size.unwrap_or(state.config.context_size);
    info!("Loading model {:?} (context {})", model_path, context_size);

    state
        .session
        .init(
            &model_path.to_string_lossy(),
            context_size,
            request.corpus_dir.as_deref(),
        )
        .await?;

    Ok(Json(StatusResponse {
        status: "initialized",
        initialized: true,
    }))
}

/// Clear the conversation state of the loaded model
pub async fn reset<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.session.reset().await?;
    Ok(Json(StatusResponse {
        status: "reset",
        initialized: true,
    }))
}

/// Ask an in-flight generation to stop early
pub async fn stop<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.session.stop().await?;
    Ok(Json(StatusResponse {
        status: "stopped",
        initialized: state.session.is_loaded(),
    }))
}

/// Release the loaded model
pub async fn destroy<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
) -> Result<Json<StatusResponse>, ApiError> {
    state.session.destroy().await?;
    info!("Model released");
    Ok(Json(StatusResponse {
        status: "destroyed",
        initialized: false,
    }))
}

/// Device id assigned at registration, if any
pub async fn device<E: Engine, R: DeviceRegistry>(
    State(state): State<AppState<E, R>>,
) -> Result<Json<DeviceResponse>, ApiError> {
    let device_id = state.utility.get_device_id().await?;
    Ok(Json(DeviceResponse { device_id }))
}
