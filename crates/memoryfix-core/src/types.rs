use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Rejections for user-supplied images. These are input errors and are
/// reported to the caller before any provider is invoked.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("image is missing or empty")]
    Empty,
    #[error("malformed data URI: {0}")]
    InvalidDataUri(String),
    #[error("image payload is not valid base64: {0}")]
    InvalidBase64(String),
    #[error("unrecognized image format")]
    UnrecognizedFormat,
}

/// Failures retrieving an image by URL.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to fetch {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("fetching {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} is not a usable image: {source}")]
    Image {
        url: String,
        #[source]
        source: ImageError,
    },
}

/// True for `http://` and `https://` references.
pub fn is_remote_url(s: &str) -> bool {
    let s = s.trim_start();
    s.starts_with("http://") || s.starts_with("https://")
}

/// Apparent gender of the photographed subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// Value used whenever inference cannot produce a label.
    pub const FALLBACK: Gender = Gender::Female;

    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse confidence label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

/// Inference confidence, either a coarse label or a normalized score in [0, 1].
///
/// Serializes untagged: `"low"` or `0.95`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Confidence {
    Level(ConfidenceLevel),
    Score(f32),
}

impl Confidence {
    pub const LOW: Confidence = Confidence::Level(ConfidenceLevel::Low);

    /// Build a score, clamping into [0, 1]. Non-finite input becomes 0.0.
    pub fn score(value: f32) -> Self {
        if value.is_finite() {
            Confidence::Score(value.clamp(0.0, 1.0))
        } else {
            Confidence::Score(0.0)
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Level(ConfidenceLevel::Low) => f.write_str("low"),
            Confidence::Level(ConfidenceLevel::Medium) => f.write_str("medium"),
            Confidence::Level(ConfidenceLevel::High) => f.write_str("high"),
            Confidence::Score(s) => write!(f, "{s:.2}"),
        }
    }
}

/// How an [`InferenceResult`] label was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Provenance {
    /// Structured answer from the provider.
    Model,
    /// Gender keyword found in unstructured provider text.
    KeywordScan,
    /// A face was found but the provider cannot classify gender.
    FaceOnly,
    /// Provider failed or gave nothing usable; the fixed fallback was used.
    Fallback,
}

/// Normalized output of gender inference. Never absent: failures map to
/// [`InferenceResult::fallback`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub gender: Gender,
    pub confidence: Confidence,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub face_detected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Name of the backend that produced this result.
    pub strategy: String,
    pub provenance: Provenance,
    /// Raw provider fields kept for diagnostics.
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub provider_metadata: serde_json::Value,
}

impl InferenceResult {
    /// The fixed `{female, low}` result substituted on any provider failure.
    pub fn fallback(strategy: &str) -> Self {
        Self {
            gender: Gender::FALLBACK,
            confidence: Confidence::LOW,
            face_detected: None,
            reasoning: None,
            strategy: strategy.to_string(),
            provenance: Provenance::Fallback,
            provider_metadata: serde_json::Value::Null,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.provenance == Provenance::Fallback
    }
}

/// Garment styles available for try-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Garment {
    Suit,
    Hanbok,
}

impl Garment {
    pub const ALL: [Garment; 2] = [Garment::Suit, Garment::Hanbok];

    pub fn as_str(self) -> &'static str {
        match self {
            Garment::Suit => "suit",
            Garment::Hanbok => "hanbok",
        }
    }
}

impl fmt::Display for Garment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown garment type: {0:?} (expected \"suit\" or \"hanbok\")")]
pub struct UnknownGarment(pub String);

impl FromStr for Garment {
    type Err = UnknownGarment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suit" => Ok(Garment::Suit),
            "hanbok" => Ok(Garment::Hanbok),
            _ => Err(UnknownGarment(s.to_string())),
        }
    }
}

/// Pipeline stage. Ordering follows the forward direction of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Analyzing,
    Selecting,
    Synthesizing,
    Completed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Analyzing => "analyzing",
            Stage::Selecting => "selecting",
            Stage::Synthesizing => "synthesizing",
            Stage::Completed => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An encoded image held in memory. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    bytes: Bytes,
    format: image::ImageFormat,
}

impl ImageData {
    /// Wrap encoded bytes, sniffing the format from magic bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, ImageError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        let format = image::guess_format(&bytes).map_err(|_| ImageError::UnrecognizedFormat)?;
        Ok(Self { bytes, format })
    }

    /// Parse `data:<mime>;base64,<payload>`, or a bare base64 payload.
    ///
    /// The declared MIME type is ignored; the format is sniffed from the
    /// decoded bytes.
    pub fn from_data_uri(uri: &str) -> Result<Self, ImageError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ImageError::Empty);
        }

        let payload = match uri.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest
                    .split_once(',')
                    .ok_or_else(|| ImageError::InvalidDataUri("missing ',' separator".into()))?;
                if !header.ends_with(";base64") {
                    return Err(ImageError::InvalidDataUri(format!(
                        "expected base64 encoding, got header {header:?}"
                    )));
                }
                payload
            }
            None => uri,
        };

        let decoded = BASE64
            .decode(payload.trim())
            .map_err(|e| ImageError::InvalidBase64(e.to_string()))?;
        Self::from_bytes(decoded)
    }

    /// Download `url` once and sniff the body.
    pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<Self, FetchError> {
        tracing::debug!(%url, "fetching image");
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let response = client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        Self::from_bytes(body).map_err(|source| FetchError::Image {
            url: url.to_string(),
            source,
        })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn format(&self) -> image::ImageFormat {
        self.format
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Base64 payload without the `data:` header.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type(), self.to_base64())
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Final image reference of a session: inline bytes or a provider URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultImage {
    Inline(ImageData),
    Remote(String),
}

impl ResultImage {
    /// Renderable URI: a data URI for inline images, the URL otherwise.
    pub fn to_uri(&self) -> String {
        match self {
            ResultImage::Inline(image) => image.to_data_uri(),
            ResultImage::Remote(url) => url.clone(),
        }
    }

    pub fn as_inline(&self) -> Option<&ImageData> {
        match self {
            ResultImage::Inline(image) => Some(image),
            ResultImage::Remote(_) => None,
        }
    }
}

impl Serialize for ResultImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_uri())
    }
}
