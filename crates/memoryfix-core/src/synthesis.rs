//! Garment synthesis adapter.
//!
//! Two modes behind [`GarmentSynthesizer`]: a simulated mode that waits and
//! echoes the person image, and a live mode that drives a hosted Gradio
//! IDM-VTON app. Neither raises: failures come back as a
//! [`SynthesisFailure`] which the pipeline turns into a passthrough result.

use crate::config::{ConfigError, SynthesisConfig, SynthesisMode};
use crate::garments;
use crate::types::{is_remote_url, Garment, ImageData, ResultImage};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Gradio endpoint name of the try-on function.
const VTON_API_NAME: &str = "tryon";
/// Fixed invocation parameters: auto-masking on, auto-crop off.
const VTON_AUTO_MASK: bool = true;
const VTON_AUTO_CROP: bool = false;
const VTON_DENOISE_STEPS: u32 = 30;
const VTON_SEED: u64 = 42;
/// First retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Input to one synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub person: ImageData,
    pub garment: Garment,
}

/// Why a synthesis call produced no image. Timeouts are reported apart from
/// every other failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisFailure {
    #[error("synthesis timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("unrecognized provider output: {0}")]
    MalformedOutput(String),
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("garment asset unavailable: {0}")]
    AssetUnavailable(String),
}

impl SynthesisFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SynthesisFailure::TimedOut(_))
    }

    /// Stable machine-readable failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SynthesisFailure::TimedOut(_) => "timedOut",
            SynthesisFailure::Transport(_) => "transport",
            SynthesisFailure::Provider(_) => "provider",
            SynthesisFailure::MalformedOutput(_) => "malformedOutput",
            SynthesisFailure::MissingConfiguration(_) => "missingConfiguration",
            SynthesisFailure::AssetUnavailable(_) => "assetUnavailable",
        }
    }
}

pub type SynthesisResult = Result<ResultImage, SynthesisFailure>;

/// Composites a garment onto a person image.
#[async_trait]
pub trait GarmentSynthesizer: Send + Sync {
    fn mode(&self) -> SynthesisMode;

    async fn synthesize(&self, request: &SynthesisRequest) -> SynthesisResult;
}

/// Build the synthesizer selected by `config`.
pub fn from_config(config: &SynthesisConfig) -> Result<Arc<dyn GarmentSynthesizer>, ConfigError> {
    let synthesizer: Arc<dyn GarmentSynthesizer> = match config.mode {
        SynthesisMode::Simulated => Arc::new(SimulatedSynthesizer::new(config.simulated_delay)),
        SynthesisMode::Live => {
            let garment_base_url = config
                .garment_base_url
                .clone()
                .ok_or(ConfigError::MissingSetting("MEMORYFIX_GARMENT_BASE_URL"))?;
            if config.hf_token.is_none() {
                tracing::warn!("HF_TOKEN is not set; using anonymous quota which may be limited");
            }
            Arc::new(LiveSynthesizer::new(
                &config.vton_endpoint,
                &garment_base_url,
                config.hf_token.clone(),
                config.request_timeout,
                config.max_attempts,
            ))
        }
    };
    tracing::info!(mode = %synthesizer.mode(), "garment synthesis configured");
    Ok(synthesizer)
}

// --- Simulated ---------------------------------------------------------------

/// Waits `delay`, then returns the person image unchanged.
pub struct SimulatedSynthesizer {
    delay: Duration,
}

impl SimulatedSynthesizer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl GarmentSynthesizer for SimulatedSynthesizer {
    fn mode(&self) -> SynthesisMode {
        SynthesisMode::Simulated
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> SynthesisResult {
        tracing::info!(garment = %request.garment, delay_ms = self.delay.as_millis() as u64, "simulating synthesis");
        tokio::time::sleep(self.delay).await;
        Ok(ResultImage::Inline(request.person.clone()))
    }
}

// --- Live (Gradio IDM-VTON) --------------------------------------------------

/// Hosted IDM-VTON app reached through the Gradio HTTP API.
pub struct LiveSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    garment_base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    max_attempts: u32,
}

impl LiveSynthesizer {
    pub fn new(
        endpoint: &str,
        garment_base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            garment_base_url: garment_base_url.to_string(),
            token,
            request_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn transport(&self, err: reqwest::Error) -> SynthesisFailure {
        if err.is_timeout() {
            SynthesisFailure::TimedOut(self.request_timeout)
        } else {
            SynthesisFailure::Transport(err.to_string())
        }
    }

    async fn fetch_asset(&self, url: &str) -> Result<bytes::Bytes, SynthesisFailure> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SynthesisFailure::AssetUnavailable(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(SynthesisFailure::AssetUnavailable(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }
        response
            .bytes()
            .await
            .map_err(|e| SynthesisFailure::AssetUnavailable(format!("{url}: {e}")))
    }

    /// Upload one file and return its server-side path.
    async fn upload(&self, bytes: bytes::Bytes, filename: &str, mime: &str) -> Result<String, SynthesisFailure> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| self.transport(e))?;
        let form = reqwest::multipart::Form::new().part("files", part);

        let response = self
            .authorized(self.client.post(format!("{}/upload", self.endpoint)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let payload = self.read_json(response).await?;

        payload
            .get(0)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SynthesisFailure::MalformedOutput(format!("upload response {payload}")))
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, SynthesisFailure> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SynthesisFailure::Provider(format!("HTTP {status}: {body}")));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| SynthesisFailure::MalformedOutput(e.to_string()))
    }

    /// Queue the try-on call and return its event id.
    async fn submit(&self, person_path: &str, garment_path: &str, description: &str) -> Result<String, SynthesisFailure> {
        let body = json!({
            "data": [
                { "background": file_data(person_path), "layers": [], "composite": null },
                file_data(garment_path),
                description,
                VTON_AUTO_MASK,
                VTON_AUTO_CROP,
                VTON_DENOISE_STEPS,
                VTON_SEED,
            ]
        });
        let response = self
            .authorized(
                self.client
                    .post(format!("{}/call/{VTON_API_NAME}", self.endpoint)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let payload = self.read_json(response).await?;

        payload
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SynthesisFailure::MalformedOutput(format!("submit response {payload}")))
    }

    /// Read the server-sent event stream until the call settles.
    async fn await_output(&self, event_id: &str) -> Result<Value, SynthesisFailure> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/call/{VTON_API_NAME}/{event_id}", self.endpoint)),
            )
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SynthesisFailure::Provider(format!("HTTP {status} on result stream")));
        }
        let body = response.text().await.map_err(|e| self.transport(e))?;
        parse_event_stream(&body)
    }

    async fn attempt(&self, request: &SynthesisRequest) -> SynthesisResult {
        let asset = garments::lookup(request.garment).ok_or_else(|| {
            SynthesisFailure::MissingConfiguration(format!("no catalog entry for {}", request.garment))
        })?;
        let garment_bytes = self.fetch_asset(&asset.url(&self.garment_base_url)).await?;
        let garment_mime = image::guess_format(&garment_bytes)
            .map(|f| f.to_mime_type())
            .unwrap_or("application/octet-stream");

        let person_path = self
            .upload(request.person.bytes().clone(), "person", request.person.mime_type())
            .await?;
        let garment_path = self
            .upload(garment_bytes, request.garment.as_str(), garment_mime)
            .await?;
        tracing::debug!(person_path, garment_path, "uploaded synthesis inputs");

        let event_id = self
            .submit(&person_path, &garment_path, &asset.description)
            .await?;
        tracing::debug!(event_id, "try-on call queued");

        let output = self.await_output(&event_id).await?;
        normalize_output(&output, &self.endpoint)
            .ok_or_else(|| SynthesisFailure::MalformedOutput(truncate(&output.to_string(), 200)))
    }
}

#[async_trait]
impl GarmentSynthesizer for LiveSynthesizer {
    fn mode(&self) -> SynthesisMode {
        SynthesisMode::Live
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> SynthesisResult {
        tracing::info!(garment = %request.garment, endpoint = %self.endpoint, "requesting live synthesis");
        let mut delay = RETRY_BASE_DELAY;

        for attempt in 1..=self.max_attempts {
            let outcome = match tokio::time::timeout(self.request_timeout, self.attempt(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SynthesisFailure::TimedOut(self.request_timeout)),
            };

            match outcome {
                Ok(image) => {
                    tracing::info!(attempt, "live synthesis complete");
                    return Ok(image);
                }
                Err(SynthesisFailure::Transport(msg)) if attempt < self.max_attempts => {
                    tracing::warn!(attempt, error = %msg, retry_in_ms = delay.as_millis() as u64, "synthesis transport failure; retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(failure) => {
                    tracing::warn!(attempt, kind = failure.kind(), error = %failure, "live synthesis failed");
                    return Err(failure);
                }
            }
        }

        Err(SynthesisFailure::Transport("no attempts made".into()))
    }
}

fn file_data(path: &str) -> Value {
    json!({ "path": path, "meta": { "_type": "gradio.FileData" } })
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

/// Extract the payload of the `complete` event from a Gradio SSE body.
fn parse_event_stream(body: &str) -> Result<Value, SynthesisFailure> {
    let mut event = "";
    for line in body.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event = name.trim();
        } else if let Some(data) = line.strip_prefix("data:") {
            match event {
                "complete" => {
                    return serde_json::from_str(data.trim())
                        .map_err(|e| SynthesisFailure::MalformedOutput(format!("complete event: {e}")));
                }
                "error" => {
                    return Err(SynthesisFailure::Provider(format!(
                        "provider reported error: {}",
                        data.trim()
                    )));
                }
                _ => {}
            }
        }
    }
    Err(SynthesisFailure::MalformedOutput(
        "event stream ended without a complete event".into(),
    ))
}

/// Reduce any supported provider output shape to one [`ResultImage`].
///
/// Accepts a URL or data URI string, a bare base64 payload, an object with
/// `url` or `path` (resolved against `endpoint`), an object wrapping one of
/// those in `value`, or a list whose first element is any of the above.
pub fn normalize_output(output: &Value, endpoint: &str) -> Option<ResultImage> {
    match output {
        Value::Array(items) => items.first().and_then(|v| normalize_output(v, endpoint)),
        Value::String(s) => image_from_str(s),
        Value::Object(map) => {
            if let Some(url) = map.get("url").and_then(Value::as_str).filter(|u| !u.is_empty()) {
                image_from_str(url)
            } else if let Some(path) = map.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) {
                Some(ResultImage::Remote(format!(
                    "{}/file={path}",
                    endpoint.trim_end_matches('/')
                )))
            } else {
                map.get("value").and_then(|v| normalize_output(v, endpoint))
            }
        }
        _ => None,
    }
}

fn image_from_str(s: &str) -> Option<ResultImage> {
    let s = s.trim();
    if is_remote_url(s) {
        Some(ResultImage::Remote(s.to_string()))
    } else {
        ImageData::from_data_uri(s).ok().map(ResultImage::Inline)
    }
}
