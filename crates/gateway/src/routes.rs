use crate::{
    auth::{AccessGate, require_credentials},
    decode::decode_base64_image,
    error::{ApiError, INTERNAL_ERROR},
    state::AppState,
};
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tagger::{Caption, TaggerError};
use tokio::task::{JoinError, spawn_blocking};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

#[derive(Debug, Default, Deserialize)]
pub struct InterrogateRequest {
    #[serde(default)]
    pub model: String,
    /// Base64 image, raw or as a `data:` URL
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InterrogateResponse {
    pub caption: Caption,
}

#[derive(Debug, Serialize)]
pub struct InterrogatorsResponse {
    pub models: Vec<String>,
}

/// Assemble every route under `prefix` behind the access gate.
///
/// `prefix` is expected normalized: empty, or a leading slash and no trailing
/// one.
pub fn build_router(
    state: AppState,
    gate: AccessGate,
    prefix: &str,
    max_body_bytes: usize,
) -> Router {
    let api = Router::new()
        .route("/interrogate", post(interrogate))
        .route("/interrogators", get(interrogators))
        .route("/unload-interrogators", post(unload_interrogators))
        .with_state(state);

    let app = if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    };

    app.layer(middleware::from_fn_with_state(
        Arc::new(gate),
        require_credentials,
    ))
    .layer(DefaultBodyLimit::max(max_body_bytes))
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive())
}

async fn interrogate(
    State(state): State<AppState>,
    Json(request): Json<InterrogateRequest>,
) -> Result<Json<InterrogateResponse>, ApiError> {
    let InterrogateRequest { model, image } = request;

    // Reject cheaply before paying for a decode.
    let Some(encoded) = image else {
        return Err(TaggerError::ImageNotFound.into());
    };
    if !state.service.registry().contains(&model) {
        return Err(TaggerError::ModelNotFound(model).into());
    }

    let service = Arc::clone(&state.service);
    let caption = spawn_blocking(move || {
        let image = decode_base64_image(&encoded)?;
        service
            .interrogate(image.as_ref(), &model)
            .map_err(ApiError::from)
    })
    .await
    .map_err(task_failed)??;

    Ok(Json(InterrogateResponse { caption }))
}

async fn interrogators(State(state): State<AppState>) -> Json<InterrogatorsResponse> {
    Json(InterrogatorsResponse {
        models: state.service.interrogators(),
    })
}

async fn unload_interrogators(State(state): State<AppState>) -> Result<Json<String>, ApiError> {
    let service = Arc::clone(&state.service);
    let unloaded = spawn_blocking(move || service.unload_all())
        .await
        .map_err(task_failed)?;

    Ok(Json(format!("Successfully unload {} model(s)", unloaded)))
}

fn task_failed(e: JoinError) -> ApiError {
    tracing::error!(error = %e, "Blocking task did not complete");
    ApiError::Internal(INTERNAL_ERROR.to_string())
}
