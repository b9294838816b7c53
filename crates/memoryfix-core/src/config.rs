//! Provider and pipeline configuration, loaded from `MEMORYFIX_*` environment
//! variables with defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_APP_ID: &str = "MemoryFix";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_VISION_BASE_URL: &str = "https://vision.googleapis.com/v1";
pub const DEFAULT_VTON_ENDPOINT: &str = "https://yisol-idm-vton.hf.space";

/// Deployment configuration problems. These make a provider unusable and are
/// never downgraded to a fallback result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{strategy} inference requires {var} to be set")]
    MissingCredential {
        strategy: &'static str,
        var: &'static str,
    },
    #[error("no inference credentials configured (set MEMORYFIX_GEMINI_API_KEY or MEMORYFIX_VISION_API_KEY, or MEMORYFIX_INFERENCE=none)")]
    NoInferenceProvider,
    #[error("live synthesis requires {0} to be set")]
    MissingSetting(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which gender inference backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStrategy {
    /// Generative if a Gemini key is present, else face detection if a
    /// Vision key is present.
    Auto,
    Generative,
    FaceDetection,
    /// No provider; always the fallback result.
    None,
}

impl InferenceStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            InferenceStrategy::Auto => "auto",
            InferenceStrategy::Generative => "generative",
            InferenceStrategy::FaceDetection => "face-detection",
            InferenceStrategy::None => "none",
        }
    }
}

impl fmt::Display for InferenceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InferenceStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "generative" | "gemini" => Ok(Self::Generative),
            "face-detection" | "face_detection" | "vision" => Ok(Self::FaceDetection),
            "none" | "off" => Ok(Self::None),
            _ => Err(ConfigError::InvalidValue {
                key: "MEMORYFIX_INFERENCE",
                value: s.to_string(),
            }),
        }
    }
}

/// Garment synthesis mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisMode {
    /// Artificial delay, then the person image unchanged.
    Simulated,
    /// Hosted virtual try-on model.
    Live,
}

impl SynthesisMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SynthesisMode::Simulated => "simulated",
            SynthesisMode::Live => "live",
        }
    }
}

impl fmt::Display for SynthesisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SynthesisMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "mock" => Ok(Self::Simulated),
            "live" => Ok(Self::Live),
            _ => Err(ConfigError::InvalidValue {
                key: "MEMORYFIX_SYNTHESIS",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub strategy: InferenceStrategy,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub gemini_base_url: String,
    pub vision_api_key: Option<String>,
    pub vision_base_url: String,
    /// Upper bound for one provider call.
    pub timeout: Duration,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            strategy: InferenceStrategy::Auto,
            gemini_api_key: None,
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            vision_api_key: None,
            vision_base_url: DEFAULT_VISION_BASE_URL.to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

impl InferenceConfig {
    /// Resolve `Auto` and check that the chosen backend has its credential.
    pub fn resolved_strategy(&self) -> Result<InferenceStrategy, ConfigError> {
        match self.strategy {
            InferenceStrategy::Auto => {
                if self.gemini_api_key.is_some() {
                    Ok(InferenceStrategy::Generative)
                } else if self.vision_api_key.is_some() {
                    Ok(InferenceStrategy::FaceDetection)
                } else {
                    Err(ConfigError::NoInferenceProvider)
                }
            }
            InferenceStrategy::Generative if self.gemini_api_key.is_none() => {
                Err(ConfigError::MissingCredential {
                    strategy: "generative",
                    var: "MEMORYFIX_GEMINI_API_KEY",
                })
            }
            InferenceStrategy::FaceDetection if self.vision_api_key.is_none() => {
                Err(ConfigError::MissingCredential {
                    strategy: "face-detection",
                    var: "MEMORYFIX_VISION_API_KEY",
                })
            }
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub mode: SynthesisMode,
    pub simulated_delay: Duration,
    /// Base URL of the hosted try-on app.
    pub vton_endpoint: String,
    /// Base URL the garment reference assets are served from.
    pub garment_base_url: Option<String>,
    /// Optional bearer token for the hosted app.
    pub hf_token: Option<String>,
    /// Upper bound for one live call, reported as a timeout.
    pub request_timeout: Duration,
    /// Attempts for transport failures; timeouts are never retried.
    pub max_attempts: u32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            mode: SynthesisMode::Simulated,
            simulated_delay: Duration::from_millis(2500),
            vton_endpoint: DEFAULT_VTON_ENDPOINT.to_string(),
            garment_base_url: None,
            hf_token: None,
            request_timeout: Duration::from_secs(90),
            max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on `synthesizing`; expiry falls back to the source image.
    pub synthesis_deadline: Duration,
    /// Idle time after which the daemon drops a session.
    pub session_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            synthesis_deadline: Duration::from_secs(120),
            session_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Complete provider and pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application identifier used in exported filenames.
    pub app_id: String,
    pub inference: InferenceConfig,
    pub synthesis: SynthesisConfig,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            inference: InferenceConfig::default(),
            synthesis: SynthesisConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `MEMORYFIX_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Config::default();

        let strategy = match var("MEMORYFIX_INFERENCE") {
            Some(v) => v.parse()?,
            None => defaults.inference.strategy,
        };
        let mode = match var("MEMORYFIX_SYNTHESIS") {
            Some(v) => v.parse()?,
            None => defaults.synthesis.mode,
        };

        let inference = InferenceConfig {
            strategy,
            gemini_api_key: var("MEMORYFIX_GEMINI_API_KEY").or_else(|| var("GOOGLE_AI_API_KEY")),
            gemini_model: var("MEMORYFIX_GEMINI_MODEL").unwrap_or(defaults.inference.gemini_model),
            gemini_base_url: var("MEMORYFIX_GEMINI_BASE_URL")
                .unwrap_or(defaults.inference.gemini_base_url),
            vision_api_key: var("MEMORYFIX_VISION_API_KEY"),
            vision_base_url: var("MEMORYFIX_VISION_BASE_URL")
                .unwrap_or(defaults.inference.vision_base_url),
            timeout: Duration::from_secs(parse_or(
                &var,
                "MEMORYFIX_INFERENCE_TIMEOUT_SECS",
                defaults.inference.timeout.as_secs(),
            )?),
        };

        let synthesis = SynthesisConfig {
            mode,
            simulated_delay: Duration::from_millis(parse_or(
                &var,
                "MEMORYFIX_SIMULATED_DELAY_MS",
                defaults.synthesis.simulated_delay.as_millis() as u64,
            )?),
            vton_endpoint: var("MEMORYFIX_VTON_ENDPOINT")
                .unwrap_or(defaults.synthesis.vton_endpoint),
            garment_base_url: var("MEMORYFIX_GARMENT_BASE_URL"),
            hf_token: var("MEMORYFIX_HF_TOKEN").or_else(|| var("HF_TOKEN")),
            request_timeout: Duration::from_secs(parse_or(
                &var,
                "MEMORYFIX_VTON_TIMEOUT_SECS",
                defaults.synthesis.request_timeout.as_secs(),
            )?),
            max_attempts: parse_or(
                &var,
                "MEMORYFIX_VTON_ATTEMPTS",
                defaults.synthesis.max_attempts,
            )?
            .max(1),
        };

        let pipeline = PipelineConfig {
            synthesis_deadline: Duration::from_secs(parse_or(
                &var,
                "MEMORYFIX_SYNTHESIS_DEADLINE_SECS",
                defaults.pipeline.synthesis_deadline.as_secs(),
            )?),
            session_ttl: Duration::from_secs(parse_or(
                &var,
                "MEMORYFIX_SESSION_TTL_SECS",
                defaults.pipeline.session_ttl.as_secs(),
            )?),
        };

        Ok(Self {
            app_id: var("MEMORYFIX_APP_ID").unwrap_or(defaults.app_id),
            inference,
            synthesis,
            pipeline,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: v,
        }),
        None => Ok(default),
    }
}
