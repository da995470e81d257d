//! HTTP service for typing predictions, drawing predictions and explanations.
//!
//! # Routes
//!
//! ```text
//! GET  /health           liveness and version
//! POST /predict/typing   {log, gender} JSON        -> {prediction, probability}
//! POST /predict/spiral   raw image bytes           -> {prediction, probability}
//! POST /predict/wave     raw image bytes           -> {prediction, probability}
//! POST /predict/voice    21 voice measurements     -> {prediction, probability}
//! POST /predict/combined {typing?, spiral?, wave?, voice?} -> {outcomes, combined}
//! POST /explain          raw image bytes           -> {source, preview, layers}
//! GET  /status           usage counters and loaded models
//! ```
//!
//! Inference runs on the blocking pool so large images never stall the
//! async workers.

use crate::classifier::Prediction;
use crate::explain::{Explanation, ImageInputError};
use crate::keystroke::{deserialize_log, KeystrokeEvent};
use crate::pipeline::{CombinedInputs, CombinedReport, DrawingKind, Pipeline, PipelineError};
use crate::usage::UsageStats;
use crate::voice::VoiceInput;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pipeline: Arc<Pipeline>,
}

impl ServerState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

/// Typing prediction request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRequest {
    #[serde(deserialize_with = "deserialize_log")]
    pub log: Vec<KeystrokeEvent>,
    pub gender: String,
}

/// Combined prediction request. Images are base64 encoded; absent inputs
/// are not run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CombinedRequest {
    #[serde(default)]
    pub typing: Option<TypingRequest>,
    #[serde(default)]
    pub spiral: Option<String>,
    #[serde(default)]
    pub wave: Option<String>,
    #[serde(default)]
    pub voice: Option<serde_json::Value>,
}

impl CombinedRequest {
    fn into_inputs(self) -> Result<CombinedInputs, PipelineError> {
        let image = |encoded: Option<String>| -> Result<Option<Vec<u8>>, PipelineError> {
            encoded
                .map(|data| {
                    STANDARD
                        .decode(data.trim())
                        .map_err(|e| {
                            PipelineError::from(ImageInputError::Decode(format!(
                                "invalid base64: {e}"
                            )))
                        })
                })
                .transpose()
        };
        Ok(CombinedInputs {
            typing: self.typing.map(|t| (t.log, t.gender)),
            spiral: image(self.spiral)?,
            wave: image(self.wave)?,
            voice: self.voice.map(VoiceInput::from_value).transpose()?,
        })
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub models: Vec<&'static str>,
    pub usage: UsageStats,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(e: PipelineError) -> ApiError {
    let status = match &e {
        PipelineError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(code = e.code(), error = %e, "request failed");
    } else {
        tracing::debug!(code = e.code(), error = %e, "request rejected");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: e.code().to_string(),
        }),
    )
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    tracing::error!("inference task failed: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: format!("Inference task failed: {e}"),
            code: "INFERENCE_ERROR".to_string(),
        }),
    )
}

/// Run `f` against the pipeline on the blocking pool.
async fn blocking<T, F>(state: &ServerState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Pipeline) -> Result<T, PipelineError> + Send + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    tokio::task::spawn_blocking(move || f(&pipeline))
        .await
        .map_err(join_error)?
        .map_err(api_error)
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /status
async fn status(State(state): State<ServerState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        models: state.pipeline.loaded_models(),
        usage: state.pipeline.usage().stats(),
    })
}

/// POST /predict/typing
async fn predict_typing(
    State(state): State<ServerState>,
    Json(request): Json<TypingRequest>,
) -> Result<Json<Prediction>, ApiError> {
    blocking(&state, move |p| p.predict_typing(&request.log, &request.gender))
        .await
        .map(Json)
}

async fn predict_drawing(
    state: ServerState,
    kind: DrawingKind,
    body: Bytes,
) -> Result<Json<Prediction>, ApiError> {
    blocking(&state, move |p| p.predict_image(kind, &body))
        .await
        .map(Json)
}

/// POST /predict/spiral
async fn predict_spiral(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Prediction>, ApiError> {
    predict_drawing(state, DrawingKind::Spiral, body).await
}

/// POST /predict/wave
async fn predict_wave(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Prediction>, ApiError> {
    predict_drawing(state, DrawingKind::Wave, body).await
}

/// POST /predict/voice
async fn predict_voice(
    State(state): State<ServerState>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Prediction>, ApiError> {
    blocking(&state, move |p| p.predict_voice(&VoiceInput::from_value(body)?))
        .await
        .map(Json)
}

/// POST /predict/combined
async fn predict_combined(
    State(state): State<ServerState>,
    Json(request): Json<CombinedRequest>,
) -> Result<Json<CombinedReport>, ApiError> {
    blocking(&state, move |p| {
        let inputs = request.into_inputs()?;
        Ok(p.predict_combined(&inputs))
    })
    .await
    .map(Json)
}

/// POST /explain
async fn explain(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Explanation>, ApiError> {
    blocking(&state, move |p| p.explain(&body)).await.map(Json)
}

/// Build the router without binding.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/predict/typing", post(predict_typing))
        .route("/predict/spiral", post(predict_spiral))
        .route("/predict/wave", post(predict_wave))
        .route("/predict/voice", post(predict_voice))
        .route("/predict/combined", post(predict_combined))
        .route("/explain", post(explain))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    state: ServerState,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("motorsense server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
