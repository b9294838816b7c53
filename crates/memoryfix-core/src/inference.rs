//! Gender inference adapter.
//!
//! Normalizes interchangeable inference backends into one
//! [`InferenceResult`]. Backends are fallible; the adapter is not: every
//! backend error (transport, credentials, malformed output, timeout) is
//! logged and replaced with [`InferenceResult::fallback`].

use crate::config::{ConfigError, InferenceConfig, InferenceStrategy};
use crate::types::{Confidence, Gender, ImageData, InferenceResult, Provenance};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Instruction sent with the image to the generative backend.
const GENERATIVE_PROMPT: &str = "Look at the person in this photo and estimate their apparent gender. \
Respond with JSON only, shaped exactly as {\"gender\": \"male\" | \"female\", \
\"confidence\": <number between 0 and 1>, \"reasoning\": <short string>}.";

/// Confidence when the model answers structurally but omits a numeric confidence.
const STRUCTURED_DEFAULT_CONFIDENCE: f32 = 0.9;
/// Confidence for a label recovered by keyword scan.
const KEYWORD_SCAN_CONFIDENCE: f32 = 0.8;
/// Confidence when the model answered but nothing usable was found.
const UNPARSEABLE_CONFIDENCE: f32 = 0.0;

const FEMALE_KEYWORDS: &[&str] = &["female", "woman", "women", "girl", "lady"];
const MALE_KEYWORDS: &[&str] = &["male", "man", "men", "boy", "gentleman"];

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider error: {0}")]
    Provider(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("provider did not answer within {0:?}")]
    TimedOut(Duration),
}

/// A fallible gender inference backend.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Short backend identifier used in results and log events.
    fn name(&self) -> &'static str;

    async fn detect(&self, image: &ImageData) -> Result<InferenceResult, InferenceError>;
}

/// Infallible front for an [`InferenceBackend`].
pub struct GenderInferenceAdapter {
    backend: Box<dyn InferenceBackend>,
    timeout: Duration,
}

impl GenderInferenceAdapter {
    pub fn new(backend: Box<dyn InferenceBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Build the backend selected by `config`.
    ///
    /// Missing credentials for the selected backend are a configuration
    /// error, not a fallback.
    pub fn from_config(config: &InferenceConfig) -> Result<Self, ConfigError> {
        let backend: Box<dyn InferenceBackend> = match config.resolved_strategy()? {
            InferenceStrategy::Generative => Box::new(GenerativeBackend::new(
                http_client(config.timeout),
                &config.gemini_base_url,
                &config.gemini_model,
                config.gemini_api_key.clone().unwrap_or_default(),
            )),
            InferenceStrategy::FaceDetection => Box::new(FaceDetectionBackend::new(
                http_client(config.timeout),
                &config.vision_base_url,
                config.vision_api_key.clone().unwrap_or_default(),
            )),
            InferenceStrategy::None | InferenceStrategy::Auto => Box::new(NoBackend),
        };
        tracing::info!(strategy = backend.name(), "gender inference configured");
        Ok(Self::new(backend, config.timeout))
    }

    pub fn strategy(&self) -> &'static str {
        self.backend.name()
    }

    /// Infer the subject's gender. Never fails and never blocks longer than
    /// the configured timeout.
    pub async fn infer(&self, image: &ImageData) -> InferenceResult {
        let strategy = self.backend.name();
        let outcome = match tokio::time::timeout(self.timeout, self.backend.detect(image)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(InferenceError::TimedOut(self.timeout)),
        };

        match outcome {
            Ok(result) => {
                tracing::info!(
                    strategy,
                    gender = %result.gender,
                    confidence = %result.confidence,
                    provenance = ?result.provenance,
                    face_detected = ?result.face_detected,
                    "gender inference settled"
                );
                result
            }
            Err(err) => {
                tracing::warn!(strategy, error = %err, "gender inference failed; using fallback");
                InferenceResult::fallback(strategy)
            }
        }
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "HTTP client builder failed; using defaults");
            reqwest::Client::new()
        })
}

async fn read_json(response: reqwest::Response) -> Result<Value, InferenceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(InferenceError::Status {
            status: status.as_u16(),
            body,
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| InferenceError::MalformedResponse(e.to_string()))
}

/// Backend used when inference is disabled; always the fallback.
pub struct NoBackend;

#[async_trait]
impl InferenceBackend for NoBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn detect(&self, _image: &ImageData) -> Result<InferenceResult, InferenceError> {
        Ok(InferenceResult::fallback(self.name()))
    }
}

// --- Generative vision model -------------------------------------------------

/// Vision-capable generative model (Gemini `generateContent`).
pub struct GenerativeBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GenerativeBackend {
    pub fn new(client: reqwest::Client, base_url: &str, model: &str, api_key: String) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/models/{}:generateContent",
                base_url.trim_end_matches('/'),
                model
            ),
            api_key,
        }
    }
}

#[async_trait]
impl InferenceBackend for GenerativeBackend {
    fn name(&self) -> &'static str {
        "generative"
    }

    async fn detect(&self, image: &ImageData) -> Result<InferenceResult, InferenceError> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": GENERATIVE_PROMPT },
                    { "inline_data": { "mime_type": image.mime_type(), "data": image.to_base64() } }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let payload = read_json(response).await?;

        let text = candidate_text(&payload).ok_or_else(|| {
            InferenceError::MalformedResponse("response carries no candidate text".into())
        })?;
        tracing::debug!(len = text.len(), "generative model answered");

        Ok(interpret_generative_text(self.name(), &text))
    }
}

/// Concatenate the text parts of the first candidate.
fn candidate_text(payload: &Value) -> Option<String> {
    let parts = payload
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

#[derive(Deserialize)]
struct GenerativeVerdict {
    gender: String,
    #[serde(default)]
    confidence: Option<Value>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Turn free-form model output into an [`InferenceResult`].
///
/// Tries a structured JSON verdict first, then a keyword scan, then the
/// zero-confidence fallback.
pub fn interpret_generative_text(strategy: &str, text: &str) -> InferenceResult {
    if let Some(verdict) = parse_verdict(text) {
        if let Some(gender) = parse_gender(&verdict.gender) {
            let confidence = verdict
                .confidence
                .as_ref()
                .and_then(numeric_confidence)
                .map(Confidence::score)
                .unwrap_or(Confidence::Score(STRUCTURED_DEFAULT_CONFIDENCE));
            return InferenceResult {
                gender,
                confidence,
                face_detected: None,
                reasoning: verdict.reasoning,
                strategy: strategy.to_string(),
                provenance: Provenance::Model,
                provider_metadata: Value::Null,
            };
        }
    }

    let raw = json!({ "rawText": text });
    match keyword_scan(text) {
        Some(gender) => InferenceResult {
            gender,
            confidence: Confidence::Score(KEYWORD_SCAN_CONFIDENCE),
            face_detected: None,
            reasoning: None,
            strategy: strategy.to_string(),
            provenance: Provenance::KeywordScan,
            provider_metadata: raw,
        },
        None => InferenceResult {
            confidence: Confidence::Score(UNPARSEABLE_CONFIDENCE),
            provider_metadata: raw,
            ..InferenceResult::fallback(strategy)
        },
    }
}

/// First verdict object in `text`; trailing text after it is ignored.
fn parse_verdict(text: &str) -> Option<GenerativeVerdict> {
    text.match_indices('{').find_map(|(start, _)| {
        serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<GenerativeVerdict>()
            .next()
            .and_then(Result::ok)
    })
}

fn parse_gender(s: &str) -> Option<Gender> {
    match s.trim().to_ascii_lowercase().as_str() {
        "male" => Some(Gender::Male),
        "female" => Some(Gender::Female),
        _ => None,
    }
}

fn numeric_confidence(value: &Value) -> Option<f32> {
    match value {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse::<f32>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

/// Best-effort gender keyword search over whole words. Female words win
/// over male words, so "male" inside "female" never misfires.
pub fn keyword_scan(text: &str) -> Option<Gender> {
    let lower = text.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();

    if words.iter().any(|w| FEMALE_KEYWORDS.contains(w)) {
        Some(Gender::Female)
    } else if words.iter().any(|w| MALE_KEYWORDS.contains(w)) {
        Some(Gender::Male)
    } else {
        None
    }
}

// --- Face feature detection --------------------------------------------------

/// Facial feature detection (Cloud Vision `FACE_DETECTION`).
///
/// The provider reports faces and landmarks but no gender, so this backend
/// never claims a classification: any outcome carries the fallback label at
/// low confidence, annotated with whether a face was found.
pub struct FaceDetectionBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl FaceDetectionBackend {
    pub fn new(client: reqwest::Client, base_url: &str, api_key: String) -> Self {
        Self {
            client,
            endpoint: format!("{}/images:annotate", base_url.trim_end_matches('/')),
            api_key,
        }
    }
}

#[async_trait]
impl InferenceBackend for FaceDetectionBackend {
    fn name(&self) -> &'static str {
        "face-detection"
    }

    async fn detect(&self, image: &ImageData) -> Result<InferenceResult, InferenceError> {
        let body = json!({
            "requests": [{
                "image": { "content": image.to_base64() },
                "features": [{ "type": "FACE_DETECTION", "maxResults": 5 }]
            }]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let payload = read_json(response).await?;

        interpret_face_annotations(self.name(), &payload)
    }
}

fn interpret_face_annotations(strategy: &str, payload: &Value) -> Result<InferenceResult, InferenceError> {
    let first = payload
        .get("responses")
        .and_then(|r| r.get(0))
        .ok_or_else(|| InferenceError::MalformedResponse("missing responses[0]".into()))?;

    if let Some(message) = first
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Err(InferenceError::Provider(message.to_string()));
    }

    let faces = first
        .get("faceAnnotations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let Some(primary) = faces.first() else {
        tracing::debug!("no faces detected");
        return Ok(InferenceResult {
            face_detected: Some(false),
            provenance: Provenance::FaceOnly,
            provider_metadata: json!({ "faceCount": 0 }),
            ..InferenceResult::fallback(strategy)
        });
    };

    let detection_confidence = primary.get("detectionConfidence").cloned().unwrap_or(Value::Null);
    Ok(InferenceResult {
        face_detected: Some(true),
        provenance: Provenance::FaceOnly,
        provider_metadata: json!({
            "faceCount": faces.len(),
            "detectionConfidence": detection_confidence,
        }),
        ..InferenceResult::fallback(strategy)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::png;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Serve `router` on an ephemeral local port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gemini_reply(text: &str) -> Value {
        json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
    }

    fn generative_adapter(base_url: &str) -> GenderInferenceAdapter {
        GenderInferenceAdapter::new(
            Box::new(GenerativeBackend::new(
                reqwest::Client::new(),
                base_url,
                "gemini-test",
                "key".into(),
            )),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_structured_verdict_passes_confidence_through() {
        let r = interpret_generative_text(
            "generative",
            r#"{"gender":"male","confidence":0.95,"reasoning":"short hair, beard"}"#,
        );
        assert_eq!(r.gender, Gender::Male);
        assert_eq!(r.confidence, Confidence::Score(0.95));
        assert_eq!(r.reasoning.as_deref(), Some("short hair, beard"));
        assert_eq!(r.provenance, Provenance::Model);
    }

    #[test]
    fn test_verdict_followed_by_braced_text_keeps_model_confidence() {
        let r = interpret_generative_text(
            "generative",
            r#"{"gender":"male","confidence":0.95,"reasoning":"beard"} {note: low light}"#,
        );
        assert_eq!(r.gender, Gender::Male);
        assert_eq!(r.confidence, Confidence::Score(0.95));
        assert_eq!(r.provenance, Provenance::Model);
        assert_eq!(r.reasoning.as_deref(), Some("beard"));
    }

    #[test]
    fn test_verdict_after_prose_with_braces() {
        let r = interpret_generative_text(
            "generative",
            "Sure {here you go}:\n```json\n{\"gender\":\"female\",\"confidence\":0.7}\n```",
        );
        assert_eq!(r.gender, Gender::Female);
        assert_eq!(r.confidence, Confidence::Score(0.7));
        assert_eq!(r.provenance, Provenance::Model);
    }

    #[test]
    fn test_structured_verdict_without_numeric_confidence_defaults() {
        let r = interpret_generative_text("generative", r#"{"gender":"Female","confidence":"high"}"#);
        assert_eq!(r.gender, Gender::Female);
        assert_eq!(r.confidence, Confidence::Score(0.9));

        let fenced = "```json\n{\"gender\": \"male\"}\n```";
        let r = interpret_generative_text("generative", fenced);
        assert_eq!(r.gender, Gender::Male);
        assert_eq!(r.confidence, Confidence::Score(0.9));
    }

    #[test]
    fn test_unstructured_text_uses_keyword_scan() {
        let r = interpret_generative_text("generative", "I think it's probably male");
        assert_eq!(r.gender, Gender::Male);
        assert_eq!(r.confidence, Confidence::Score(0.8));
        assert_eq!(r.provenance, Provenance::KeywordScan);

        let r = interpret_generative_text("generative", "Looks like a young woman to me");
        assert_eq!(r.gender, Gender::Female);
        assert_eq!(r.confidence, Confidence::Score(0.8));
    }

    #[test]
    fn test_unknown_gender_in_json_falls_through_to_scan() {
        let r = interpret_generative_text("generative", r#"{"gender":"unknown","reasoning":"a man"}"#);
        assert_eq!(r.gender, Gender::Male);
        assert_eq!(r.provenance, Provenance::KeywordScan);
    }

    #[test]
    fn test_unusable_text_is_zero_confidence_fallback() {
        let r = interpret_generative_text("generative", "I cannot help with that.");
        assert_eq!(r.gender, Gender::Female);
        assert_eq!(r.confidence, Confidence::Score(0.0));
        assert!(r.is_fallback());
    }

    #[test]
    fn test_keyword_scan_word_boundaries() {
        assert_eq!(keyword_scan("FEMALE subject"), Some(Gender::Female));
        assert_eq!(keyword_scan("male and female"), Some(Gender::Female));
        assert_eq!(keyword_scan("a human being"), None);
        assert_eq!(keyword_scan("manifestly unclear"), None);
        assert_eq!(keyword_scan("the man, smiling"), Some(Gender::Male));
    }

    #[test]
    fn test_face_annotations_never_claim_a_label() {
        let with_face = json!({ "responses": [{ "faceAnnotations": [{ "detectionConfidence": 0.97 }] }] });
        let r = interpret_face_annotations("face-detection", &with_face).unwrap();
        assert_eq!(r.gender, Gender::Female);
        assert_eq!(r.confidence, Confidence::LOW);
        assert_eq!(r.face_detected, Some(true));
        assert_eq!(r.provenance, Provenance::FaceOnly);
        assert_eq!(r.provider_metadata["detectionConfidence"], 0.97);

        let no_face = json!({ "responses": [{}] });
        let r = interpret_face_annotations("face-detection", &no_face).unwrap();
        assert_eq!(r.face_detected, Some(false));
        assert_eq!(r.confidence, Confidence::LOW);
    }

    #[test]
    fn test_face_annotation_errors() {
        let err = json!({ "responses": [{ "error": { "message": "quota exceeded" } }] });
        assert!(matches!(
            interpret_face_annotations("face-detection", &err),
            Err(InferenceError::Provider(_))
        ));
        assert!(matches!(
            interpret_face_annotations("face-detection", &json!({})),
            Err(InferenceError::MalformedResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider_returns_fixed_fallback() {
        // Port 1 on loopback refuses connections.
        let adapter = generative_adapter("http://127.0.0.1:1");
        for _ in 0..3 {
            let r = adapter.infer(&png([1, 2, 3])).await;
            assert_eq!(r.gender, Gender::Female);
            assert_eq!(r.confidence, Confidence::LOW);
            assert!(r.is_fallback());
        }
    }

    #[tokio::test]
    async fn test_generative_backend_against_mock_provider() {
        let router = Router::new().route(
            "/models/gemini-test:generateContent",
            post(|Json(body): Json<Value>| async move {
                // The image travels inline as base64.
                let data = body["contents"][0]["parts"][1]["inline_data"]["data"]
                    .as_str()
                    .unwrap_or_default();
                assert!(!data.is_empty());
                Json(gemini_reply(r#"{"gender":"male","confidence":0.95,"reasoning":"..."}"#))
            }),
        );
        let base = serve(router).await;

        let r = generative_adapter(&base).infer(&png([9, 9, 9])).await;
        assert_eq!(r.gender, Gender::Male);
        assert_eq!(r.confidence, Confidence::Score(0.95));
        assert_eq!(r.strategy, "generative");
    }

    #[tokio::test]
    async fn test_http_error_status_falls_back() {
        let router = Router::new().route(
            "/models/gemini-test:generateContent",
            post(|| async { (axum::http::StatusCode::FORBIDDEN, "API key invalid") }),
        );
        let base = serve(router).await;

        let r = generative_adapter(&base).infer(&png([9, 9, 9])).await;
        assert!(r.is_fallback());
        assert_eq!(r.confidence, Confidence::LOW);
    }

    #[tokio::test]
    async fn test_face_detection_backend_against_mock_provider() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/images:annotate",
            post(move |Json(body): Json<Value>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(body["requests"][0]["features"][0]["type"], "FACE_DETECTION");
                    Json(json!({ "responses": [{ "faceAnnotations": [{ "detectionConfidence": 0.9 }] }] }))
                }
            }),
        );
        let base = serve(router).await;

        let adapter = GenderInferenceAdapter::new(
            Box::new(FaceDetectionBackend::new(reqwest::Client::new(), &base, "key".into())),
            Duration::from_secs(5),
        );
        let r = adapter.infer(&png([4, 5, 6])).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(r.face_detected, Some(true));
        assert_eq!(r.confidence, Confidence::LOW);
        assert_eq!(r.strategy, "face-detection");
    }

    struct StuckBackend;

    #[async_trait]
    impl InferenceBackend for StuckBackend {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn detect(&self, _image: &ImageData) -> Result<InferenceResult, InferenceError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_backend_is_bounded_by_timeout() {
        let adapter = GenderInferenceAdapter::new(Box::new(StuckBackend), Duration::from_secs(15));
        let r = adapter.infer(&png([0, 0, 0])).await;
        assert!(r.is_fallback());
        assert_eq!(r.strategy, "stuck");
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let config = InferenceConfig {
            strategy: InferenceStrategy::FaceDetection,
            ..InferenceConfig::default()
        };
        assert!(matches!(
            GenderInferenceAdapter::from_config(&config),
            Err(ConfigError::MissingCredential { .. })
        ));

        let offline = InferenceConfig {
            strategy: InferenceStrategy::None,
            ..InferenceConfig::default()
        };
        assert_eq!(GenderInferenceAdapter::from_config(&offline).unwrap().strategy(), "none");
    }
}
