use std::collections::VecDeque;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response, sse::{Event, KeepAlive, Sse}},
    routing::{get, post},
};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    models::{GeneratedImage, GenerationRequest, ProgressEvent, ReferenceImage, ReferenceImageError},
    orchestrator::{BatchError, BatchOrchestrator, BatchOutcome, FrameFailure},
};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BatchOrchestrator>,
    pub config: Arc<AppConfig>,
    /// Camera roll for this process, newest first, capped at `config.camera_roll_limit`.
    pub roll: Arc<RwLock<VecDeque<GeneratedImage>>>,
}

impl AppState {
    pub fn new(orchestrator: BatchOrchestrator, config: AppConfig) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(config),
            roll: Arc::default(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/presets", get(list_presets))
        .route("/api/batch", post(create_batch))
        .route("/api/batch/stream", post(stream_batch))
        .route("/api/images", get(list_images))
        .route("/api/images/:id", get(get_image))
        .route("/api/images/:id/download", get(download_image))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchRequestBody {
    /// Base64 or `data:` URL of the reference photo.
    pub reference_image: String,
    #[serde(flatten)]
    pub request: GenerationRequest,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
pub struct BatchResponse {
    pub images: Vec<GeneratedImage>,
    pub requested: u32,
    pub partial: bool,
    pub notice: Option<String>,
    pub seed: u32,
    pub stopped_early: Option<FrameFailure>,
}

impl From<BatchOutcome> for BatchResponse {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            partial: outcome.is_partial(),
            notice: outcome.notice().map(str::to_string),
            images: outcome.images,
            requested: outcome.requested,
            seed: outcome.seed,
            stopped_early: outcome.stopped_early,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    RateLimited(String),
    Upstream(String),
    Unavailable(String),
}

impl From<BatchError> for ApiError {
    fn from(err: BatchError) -> Self {
        let message = err.to_string();
        match err {
            BatchError::MissingReference | BatchError::InvalidFrameCount => ApiError::BadRequest(message),
            BatchError::MissingCredential => ApiError::Unauthorized(message),
            BatchError::RateLimited { .. } => ApiError::RateLimited(message),
            BatchError::CaptureFailed { .. } => ApiError::Upstream(message),
            BatchError::Cancelled => ApiError::Unavailable(message),
        }
    }
}

impl From<ReferenceImageError> for ApiError {
    fn from(err: ReferenceImageError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &str) {
        match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.as_str()),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.as_str()),
            ApiError::RateLimited(m) => (StatusCode::TOO_MANY_REQUESTS, m.as_str()),
            ApiError::Upstream(m) => (StatusCode::BAD_GATEWAY, m.as_str()),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.as_str()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.parts();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

struct PreparedBatch {
    reference: ReferenceImage,
    request: GenerationRequest,
    credential: String,
}

// Everything here is rejected before the orchestrator makes an external call.
fn prepare(state: &AppState, body: BatchRequestBody) -> Result<PreparedBatch, ApiError> {
    if body.request.outfit.trim().is_empty() || body.request.location.trim().is_empty() {
        return Err(ApiError::BadRequest("Outfit and location are required.".into()));
    }
    let reference = ReferenceImage::from_base64(&body.reference_image)?;
    let credential = state.config
        .credential_for(body.request.model_tier, body.api_key.as_deref())
        .ok_or(BatchError::MissingCredential)?;
    Ok(PreparedBatch { reference, request: body.request, credential })
}

fn record(state: &AppState, outcome: &BatchOutcome) {
    let mut roll = state.roll.write();
    for image in outcome.images.iter().rev() {
        roll.push_front(image.clone());
    }
    roll.truncate(state.config.camera_roll_limit);
}

fn log_progress(event: ProgressEvent) {
    tracing::debug!(percent = event.percent, "{}", event.message);
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequestBody>,
) -> Result<Json<BatchResponse>, ApiError> {
    let batch = prepare(&state, body)?;
    tracing::info!("🚀 Capture requested: {} ({} frames)", batch.request.caption(), batch.request.frame_count);

    let cancel = CancellationToken::new();
    let outcome = state.orchestrator
        .run_batch(&batch.reference, &batch.request, &batch.credential, &log_progress, &cancel)
        .await?;

    record(&state, &outcome);
    if let Some(notice) = outcome.notice() {
        tracing::warn!(captured = outcome.images.len(), requested = outcome.requested, "{}", notice);
    }
    Ok(Json(outcome.into()))
}

#[derive(Debug)]
enum StreamEvent {
    Progress(ProgressEvent),
    Done(BatchResponse),
    Failed(String),
}

impl From<ProgressEvent> for StreamEvent {
    fn from(event: ProgressEvent) -> Self {
        StreamEvent::Progress(event)
    }
}

impl StreamEvent {
    fn into_sse(self) -> Result<Event, axum::Error> {
        match self {
            StreamEvent::Progress(p) => Event::default().event("progress").json_data(p),
            StreamEvent::Done(r) => Event::default().event("result").json_data(r),
            StreamEvent::Failed(m) => Event::default().event("error").json_data(json!({ "error": m })),
        }
    }
}

/// Same batch as [`create_batch`], reported as server-sent events. Dropping
/// the connection cancels the batch.
pub async fn stream_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchRequestBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let batch = prepare(&state, body)?;
    tracing::info!("🚀 Streaming capture requested: {} ({} frames)", batch.request.caption(), batch.request.frame_count);

    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    tokio::spawn(async move {
        let result = state.orchestrator
            .run_batch(&batch.reference, &batch.request, &batch.credential, &tx, &cancel)
            .await;
        let event = match result {
            Ok(outcome) => {
                record(&state, &outcome);
                StreamEvent::Done(outcome.into())
            }
            Err(BatchError::Cancelled) => {
                tracing::info!("Streaming capture abandoned by client");
                return;
            }
            Err(err) => StreamEvent::Failed(err.to_string()),
        };
        let _ = tx.send(event);
    });

    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((event.into_sse(), (rx, guard)))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Quick-pick outfit and location pairs offered by the client.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct StylePreset {
    pub name: &'static str,
    pub outfit: &'static str,
    pub location: &'static str,
}

pub fn style_presets() -> Vec<StylePreset> {
    vec![
        StylePreset { name: "Cafe Date", outfit: "Beige knit top", location: "Aesthetic minimalist cafe" },
        StylePreset { name: "Desi Vibe", outfit: "Traditional yellow kurti", location: "Old Haveli balcony" },
        StylePreset { name: "Gym Look", outfit: "Black yoga set", location: "Modern bright gym" },
        StylePreset { name: "Night Out", outfit: "Sequin black dress", location: "Neon lit city street" },
    ]
}

pub async fn list_presets() -> Json<Vec<StylePreset>> {
    Json(style_presets())
}

pub async fn list_images(State(state): State<AppState>) -> Json<Vec<GeneratedImage>> {
    Json(state.roll.read().iter().cloned().collect())
}

pub async fn get_image(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    let found = state.roll.read().iter().find(|img| img.id == id).cloned();
    match found {
        Some(img) => Json(img).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn download_image(Path(id): Path<Uuid>, State(state): State<AppState>) -> Response {
    let Some(img) = state.roll.read().iter().find(|img| img.id == id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(bytes) = img.decode() else {
        tracing::error!(%id, "Stored image has an unreadable data URL");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    tracing::info!("📥 Download {} ({} bytes)", img.file_name(), bytes.len());
    (
        [
            (header::CONTENT_TYPE, img.mime_type.clone()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", img.file_name())),
        ],
        bytes,
    ).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::GeminiError;
    use crate::orchestrator::BatchSettings;
    use crate::test_support::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn app(generator: Arc<ScriptedGenerator>) -> (Router, AppState) {
        app_with(generator, &[])
    }

    fn app_with(generator: Arc<ScriptedGenerator>, vars: &[(&str, &str)]) -> (Router, AppState) {
        let config = AppConfig::from_lookup(|name| match name {
            "GEMINI_API_KEY" => Some("flash-key".to_string()),
            _ => vars.iter().find(|(k, _)| *k == name).map(|(_, v)| v.to_string()),
        });
        let orchestrator = BatchOrchestrator::new(generator, Arc::new(RecordingClock::default()), BatchSettings::default());
        let state = AppState::new(orchestrator, config);
        (router(state.clone()), state)
    }

    fn body(frames: u32, model: &str) -> serde_json::Value {
        let jpeg = base64::engine::general_purpose::STANDARD.encode(b"\xff\xd8\xff\xe0\x00\x10JFIF\x00");
        json!({
            "reference_image": format!("data:image/jpeg;base64,{jpeg}"),
            "outfit": "Sequin black dress",
            "location": "Neon lit city street",
            "aspect_ratio": "9:16",
            "frame_count": frames,
            "model_tier": model
        })
    }

    async fn post(router: Router, uri: &str, payload: serde_json::Value) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn batch_returns_images_and_fills_camera_roll() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (router, state) = app(generator.clone());

        let (status, bytes) = post(router.clone(), "/api/batch", body(2, "fast")).await;
        assert_eq!(status, StatusCode::OK);
        let response: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response["images"].as_array().unwrap().len(), 2);
        assert_eq!(response["partial"], false);
        assert_eq!(response["notice"], serde_json::Value::Null);
        assert_eq!(generator.calls()[0].credential, "flash-key");

        let roll: Vec<GeneratedImage> = state.roll.read().iter().cloned().collect();
        assert_eq!(roll.len(), 2);
        assert_eq!(roll[0].frame_index, 0);

        let id = roll[1].id;
        let request = Request::builder().uri(format!("/api/images/{id}")).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn partial_batch_is_a_soft_notice() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Ok(image(1)), Err(GeminiError::Http("connection reset".into()))]));
        let (router, _) = app(generator);

        let (status, bytes) = post(router, "/api/batch", body(4, "fast")).await;
        assert_eq!(status, StatusCode::OK);
        let response: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response["partial"], true);
        assert_eq!(response["notice"], "Note: Batch partially completed due to server load.");
        assert_eq!(response["stopped_early"]["frame_index"], 1);
    }

    #[tokio::test]
    async fn high_quality_without_key_is_rejected_before_calling_out() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (router, _) = app(generator.clone());

        let (status, bytes) = post(router, "/api/batch", body(1, "high_quality")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let response: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response["error"], "API Key is missing.");
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn bad_reference_image_is_a_bad_request() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (router, _) = app(generator.clone());
        let mut payload = body(1, "fast");
        payload["reference_image"] = json!("");

        let (status, _) = post(router, "/api/batch", payload).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn exhausted_rate_limit_maps_to_429() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Err(rate_limited()), Err(rate_limited())]));
        let (router, state) = app(generator);

        let (status, bytes) = post(router, "/api/batch", body(1, "fast")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let response: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(response["error"].as_str().unwrap().contains("wait 60s"));
        assert!(state.roll.read().is_empty());
    }

    #[tokio::test]
    async fn stream_reports_progress_then_result() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (router, state) = app(generator);

        let (status, bytes) = post(router, "/api/batch/stream", body(2, "fast")).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("event: progress"));
        assert!(text.contains("Capturing frame 2/2..."));
        let result_at = text.find("event: result").unwrap();
        assert!(text.rfind("event: progress").unwrap() < result_at);
        assert_eq!(state.roll.read().len(), 2);
    }

    #[tokio::test]
    async fn unknown_image_is_not_found() {
        let (router, _) = app(Arc::new(ScriptedGenerator::default()));
        let request = Request::builder().uri(format!("/api/images/{}", Uuid::new_v4())).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    async fn get_path(router: Router, uri: &str) -> Response {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        router.oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn camera_roll_keeps_only_the_newest_images() {
        let generator = Arc::new(ScriptedGenerator::default());
        let (router, state) = app_with(generator, &[("CAMERA_ROLL_LIMIT", "3")]);

        post(router.clone(), "/api/batch", body(2, "fast")).await;
        let first_batch: Vec<Uuid> = state.roll.read().iter().map(|img| img.id).collect();
        post(router.clone(), "/api/batch", body(2, "fast")).await;

        let roll: Vec<GeneratedImage> = state.roll.read().iter().cloned().collect();
        assert_eq!(roll.len(), 3);
        assert_eq!(roll.iter().map(|img| img.frame_index).collect::<Vec<_>>(), vec![0, 1, 0]);
        assert_eq!(roll[2].id, first_batch[0]);
        assert!(!roll.iter().any(|img| img.id == first_batch[1]));

        let response = get_path(router, "/api/images").await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn presets_pair_outfits_with_locations() {
        let (router, _) = app(Arc::new(ScriptedGenerator::default()));
        let response = get_path(router, "/api/presets").await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let presets: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(presets.as_array().unwrap().len(), 4);
        assert_eq!(presets[1], json!({
            "name": "Desi Vibe",
            "outfit": "Traditional yellow kurti",
            "location": "Old Haveli balcony"
        }));
        assert_eq!(presets[3]["location"], "Neon lit city street");
    }

    #[tokio::test]
    async fn download_returns_decoded_bytes_as_attachment() {
        let (router, state) = app(Arc::new(ScriptedGenerator::default()));
        post(router.clone(), "/api/batch", body(1, "fast")).await;
        let id = state.roll.read()[0].id;

        let response = get_path(router.clone(), &format!("/api/images/{id}/download")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap(),
            format!("attachment; filename=\"snaplock-{id}.png\"")
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let expected = base64::engine::general_purpose::STANDARD.decode("iVBORw0KGgo1").unwrap();
        assert_eq!(bytes.to_vec(), expected);

        let missing = get_path(router, &format!("/api/images/{}/download", Uuid::new_v4())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
