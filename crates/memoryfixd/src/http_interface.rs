//! HTTP JSON interface for the MemoryFix daemon.
//!
//! Stateless provider endpoints live under `/api/`; the session state
//! machine under `/api/sessions`. Session transitions that call a provider
//! return `202 Accepted` with the intermediate stage and settle on a spawned
//! task; clients poll `GET /api/sessions/{id}`.

use crate::engine::{Engine, EngineError};
use crate::error::ApiError;
use axum::{
    extract::{FromRequest, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use memoryfix_core::config::SynthesisMode;
use memoryfix_core::delivery::OutputPreferences;
use memoryfix_core::pipeline::Session;
use memoryfix_core::synthesis::{SynthesisFailure, SynthesisRequest};
use memoryfix_core::types::is_remote_url;
use memoryfix_core::{Confidence, Garment, Gender, ImageData, InferenceResult, ResultImage, Stage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

const RESTORE_MESSAGE: &str = "Simulated restoration: the original image is returned unchanged.";

type AppState = Arc<Engine>;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/api/analyze-gender", post(analyze_gender))
        .route("/api/try-on", post(try_on))
        .route("/api/restore", post(restore))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session).delete(delete_session))
        .route("/api/sessions/{id}/image", post(upload_image))
        .route("/api/sessions/{id}/garment", post(select_garment))
        .route("/api/sessions/{id}/reset", post(reset_session))
        .route("/api/sessions/{id}/download", get(download))
        .with_state(engine)
}

// --- Request / response bodies -----------------------------------------------

/// JSON body extractor whose rejections render as `400 invalid_request`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct ApiJson<T>(T);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageBody {
    image_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TryOnBody {
    person_image: Option<String>,
    garment_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GarmentBody {
    garment_type: Option<String>,
}

#[derive(Deserialize)]
struct RestoreBody {
    #[serde(rename = "imageUrl")]
    image_url: Option<String>,
    clothing: Option<String>,
}

#[derive(Deserialize)]
struct DownloadQuery {
    format: Option<String>,
    quality: Option<String>,
}

#[derive(Serialize)]
struct FailureView {
    kind: &'static str,
    message: String,
}

impl From<&SynthesisFailure> for FailureView {
    fn from(f: &SynthesisFailure) -> Self {
        Self {
            kind: f.kind(),
            message: f.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TryOnResponse {
    result: String,
    degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureView>,
    mock: bool,
}

/// Client-facing session state. The source image is omitted.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    id: Uuid,
    generation: u64,
    stage: Stage,
    has_source_image: bool,
    detected_gender: Gender,
    confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    inference: Option<InferenceResult>,
    selected_garment: Option<Garment>,
    result_image: Option<String>,
    degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<FailureView>,
    created_at: DateTime<Utc>,
}

impl SessionView {
    fn new(id: Uuid, s: &Session) -> Self {
        Self {
            id,
            generation: s.generation(),
            stage: s.stage(),
            has_source_image: s.source_image().is_some(),
            detected_gender: s.detected_gender(),
            confidence: s.confidence(),
            inference: s.inference().cloned(),
            selected_garment: s.selected_garment(),
            result_image: s.result_image().map(ResultImage::to_uri),
            degraded: s.is_degraded(),
            failure: s.synthesis_failure().map(FailureView::from),
            created_at: s.created_at(),
        }
    }
}

/// Decode a data URI, or fetch an http(s) URL once.
async fn image_field(engine: &Engine, value: Option<String>, field: &str) -> Result<ImageData, ApiError> {
    let value = value.filter(|v| !v.is_empty()).ok_or_else(|| ApiError::missing(field))?;
    if is_remote_url(&value) {
        return Ok(engine.fetch_image(value.trim()).await?);
    }
    Ok(ImageData::from_data_uri(&value)?)
}

fn garment_field(value: Option<String>, field: &str) -> Result<Garment, ApiError> {
    let value = value.filter(|v| !v.is_empty()).ok_or_else(|| ApiError::missing(field))?;
    Ok(value.parse()?)
}

// --- Stateless endpoints -----------------------------------------------------

async fn status(State(engine): State<AppState>) -> Json<Value> {
    let config = engine.config();
    let inference = match engine.inference() {
        Ok(adapter) => json!(adapter.strategy()),
        Err(e) => json!({ "unavailable": e.to_string() }),
    };
    let synthesis = match engine.synthesizer() {
        Ok(s) => json!(s.mode().as_str()),
        Err(e) => json!({ "unavailable": e.to_string() }),
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "appId": config.app_id,
        "inference": inference,
        "synthesis": synthesis,
        "sessions": engine.session_count(),
    }))
}

async fn analyze_gender(
    State(engine): State<AppState>,
    ApiJson(body): ApiJson<ImageBody>,
) -> Result<Json<InferenceResult>, ApiError> {
    let image = image_field(&engine, body.image_url, "imageUrl").await?;
    Ok(Json(engine.analyze(&image).await?))
}

async fn try_on(
    State(engine): State<AppState>,
    ApiJson(body): ApiJson<TryOnBody>,
) -> Result<Json<TryOnResponse>, ApiError> {
    let garment = garment_field(body.garment_type, "garmentType")?;
    let person = image_field(&engine, body.person_image, "personImage").await?;
    tracing::info!(%garment, bytes = person.len(), "try-on requested");

    let outcome = engine.try_on(SynthesisRequest { person, garment }).await?;
    Ok(Json(TryOnResponse {
        result: outcome.result.to_uri(),
        degraded: outcome.failure.is_some(),
        failure: outcome.failure.as_ref().map(FailureView::from),
        mock: outcome.mode == SynthesisMode::Simulated,
    }))
}

async fn restore(
    State(engine): State<AppState>,
    ApiJson(body): ApiJson<RestoreBody>,
) -> Result<Json<Value>, ApiError> {
    let url = body
        .image_url
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::missing("imageUrl"))?;
    let image = if is_remote_url(&url) {
        ResultImage::Remote(url)
    } else {
        ResultImage::Inline(ImageData::from_data_uri(&url)?)
    };
    let clothing = body.clothing.map(|c| c.parse::<Garment>()).transpose()?;
    tracing::info!(clothing = ?clothing, "restore requested");

    let result = engine.restore(image).await;
    Ok(Json(json!({
        "result": result.to_uri(),
        "mock": true,
        "message": RESTORE_MESSAGE,
    })))
}

// --- Sessions ----------------------------------------------------------------

async fn create_session(State(engine): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let (id, pipeline) = engine.create_session()?;
    Ok((StatusCode::CREATED, Json(SessionView::new(id, &pipeline.snapshot()))))
}

async fn get_session(
    State(engine): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let pipeline = engine.session(id)?;
    Ok(Json(SessionView::new(id, &pipeline.snapshot())))
}

async fn delete_session(
    State(engine): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    engine.remove_session(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upload_image(
    State(engine): State<AppState>,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<ImageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = engine.session(id)?;
    let image = image_field(&engine, body.image_url, "imageUrl").await?;
    let ticket = pipeline.start_upload(image).map_err(EngineError::from)?;
    let view = SessionView::new(id, &pipeline.snapshot());

    let worker = pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.complete_analysis(ticket).await {
            tracing::debug!(session = %id, error = %e, "analysis outcome dropped");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(view)))
}

async fn select_garment(
    State(engine): State<AppState>,
    Path(id): Path<Uuid>,
    ApiJson(body): ApiJson<GarmentBody>,
) -> Result<impl IntoResponse, ApiError> {
    let pipeline = engine.session(id)?;
    let garment = garment_field(body.garment_type, "garmentType")?;
    let ticket = pipeline.start_selection(garment).map_err(EngineError::from)?;
    let view = SessionView::new(id, &pipeline.snapshot());

    let worker = pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.complete_synthesis(ticket).await {
            tracing::debug!(session = %id, error = %e, "synthesis outcome dropped");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(view)))
}

async fn reset_session(
    State(engine): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, ApiError> {
    let pipeline = engine.session(id)?;
    Ok(Json(SessionView::new(id, &pipeline.reset())))
}

async fn download(
    State(engine): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let mut prefs = OutputPreferences::default();
    if let Some(format) = query.format {
        prefs.format = format.parse()?;
    }
    if let Some(quality) = query.quality {
        prefs.quality = quality.parse()?;
    }

    let artifact = engine.export(id, prefs).await?;
    let disposition = format!("attachment; filename=\"{}\"", artifact.filename);
    Ok((
        [
            (header::CONTENT_TYPE, artifact.mime_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}
