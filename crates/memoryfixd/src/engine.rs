//! Shared daemon state: configured adapters and the session registry.

use chrono::Utc;
use memoryfix_core::config::{ConfigError, SynthesisMode};
use memoryfix_core::delivery::{self, Artifact, DeliveryError, OutputPreferences};
use memoryfix_core::pipeline::{Pipeline, PipelineError};
use memoryfix_core::synthesis::{self, GarmentSynthesizer, SynthesisFailure, SynthesisRequest};
use memoryfix_core::types::FetchError;
use memoryfix_core::{Config, GenderInferenceAdapter, ImageData, InferenceResult, ResultImage, Stage};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("session is in stage {0}; a result is only available once completed")]
    NotCompleted(Stage),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Outcome of a one-shot try-on call.
pub struct TryOn {
    pub result: ResultImage,
    pub failure: Option<SynthesisFailure>,
    pub mode: SynthesisMode,
}

struct SessionEntry {
    pipeline: Arc<Pipeline>,
    last_seen: Mutex<Instant>,
}

impl SessionEntry {
    fn touch(&self) -> Arc<Pipeline> {
        *self.last_seen.lock() = Instant::now();
        self.pipeline.clone()
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock())
    }
}

/// Adapters and live sessions shared by every request handler.
///
/// A provider whose configuration is incomplete is kept as its
/// [`ConfigError`] so the daemon still starts and the affected endpoints
/// report it per request.
pub struct Engine {
    config: Config,
    inference: Result<Arc<GenderInferenceAdapter>, ConfigError>,
    synthesizer: Result<Arc<dyn GarmentSynthesizer>, ConfigError>,
    client: reqwest::Client,
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

impl Engine {
    /// Build adapters from `config`, logging any that cannot be configured.
    pub fn new(config: Config) -> Self {
        let inference = GenderInferenceAdapter::from_config(&config.inference).map(Arc::new);
        if let Err(e) = &inference {
            tracing::error!(error = %e, "gender inference unavailable");
        }
        let synthesizer = synthesis::from_config(&config.synthesis);
        if let Err(e) = &synthesizer {
            tracing::error!(error = %e, "garment synthesis unavailable");
        }
        Self::with_adapters(config, inference, synthesizer)
    }

    pub fn with_adapters(
        config: Config,
        inference: Result<Arc<GenderInferenceAdapter>, ConfigError>,
        synthesizer: Result<Arc<dyn GarmentSynthesizer>, ConfigError>,
    ) -> Self {
        Self {
            config,
            inference,
            synthesizer,
            client: reqwest::Client::new(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn inference(&self) -> Result<&Arc<GenderInferenceAdapter>, ConfigError> {
        self.inference.as_ref().map_err(Clone::clone)
    }

    pub fn synthesizer(&self) -> Result<&Arc<dyn GarmentSynthesizer>, ConfigError> {
        self.synthesizer.as_ref().map_err(Clone::clone)
    }

    /// Run inference on one image outside any session.
    pub async fn analyze(&self, image: &ImageData) -> Result<InferenceResult, EngineError> {
        Ok(self.inference()?.infer(image).await)
    }

    /// Run synthesis on one image outside any session, bounded by the
    /// pipeline deadline. Failures pass the person image through.
    pub async fn try_on(&self, request: SynthesisRequest) -> Result<TryOn, EngineError> {
        let synthesizer = self.synthesizer()?;
        let deadline = self.config.pipeline.synthesis_deadline;
        let outcome = match tokio::time::timeout(deadline, synthesizer.synthesize(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SynthesisFailure::TimedOut(deadline)),
        };

        let (result, failure) = match outcome {
            Ok(result) => (result, None),
            Err(failure) => {
                tracing::warn!(kind = failure.kind(), error = %failure, "try-on failed; returning person image");
                (ResultImage::Inline(request.person), Some(failure))
            }
        };
        Ok(TryOn {
            result,
            failure,
            mode: synthesizer.mode(),
        })
    }

    /// Fetch a client-supplied image URL with the shared HTTP client.
    pub async fn fetch_image(&self, url: &str) -> Result<ImageData, FetchError> {
        ImageData::fetch(&self.client, url).await
    }

    /// Simulated restoration: waits the simulated delay and echoes the image.
    pub async fn restore(&self, image: ResultImage) -> ResultImage {
        tokio::time::sleep(self.config.synthesis.simulated_delay).await;
        image
    }

    pub fn create_session(&self) -> Result<(Uuid, Arc<Pipeline>), EngineError> {
        self.evict_idle();
        let pipeline = Arc::new(Pipeline::new(
            self.inference()?.clone(),
            self.synthesizer()?.clone(),
            &self.config.pipeline,
        ));
        let id = Uuid::new_v4();
        let entry = SessionEntry {
            pipeline: pipeline.clone(),
            last_seen: Mutex::new(Instant::now()),
        };
        self.sessions.write().insert(id, entry);
        tracing::info!(session = %id, "session created");
        Ok((id, pipeline))
    }

    /// Look up a session and mark it as recently used.
    pub fn session(&self, id: Uuid) -> Result<Arc<Pipeline>, EngineError> {
        self.sessions
            .read()
            .get(&id)
            .map(SessionEntry::touch)
            .ok_or(EngineError::SessionNotFound(id))
    }

    /// Drop a session. In-flight adapter calls finish and are discarded.
    pub fn remove_session(&self, id: Uuid) -> Result<(), EngineError> {
        let entry = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(EngineError::SessionNotFound(id))?;
        entry.pipeline.reset();
        tracing::info!(session = %id, "session removed");
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Drop every session untouched for longer than the configured TTL.
    /// Evicted pipelines are reset so late adapter results are discarded.
    pub fn evict_idle(&self) -> usize {
        let ttl = self.config.pipeline.session_ttl;
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.sessions.write().retain(|id, entry| {
            let keep = entry.idle_for(now) <= ttl;
            if !keep {
                evicted.push((*id, entry.pipeline.clone()));
            }
            keep
        });

        for (id, pipeline) in &evicted {
            pipeline.reset();
            tracing::info!(session = %id, "idle session evicted");
        }
        evicted.len()
    }

    /// Sweep idle sessions periodically until the engine is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = (self.config.pipeline.session_ttl / 2).max(Duration::from_secs(1));
        let engine: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                let evicted = engine.evict_idle();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = engine.session_count(), "session sweep");
                }
            }
        })
    }

    /// Export a completed session's result.
    pub async fn export(&self, id: Uuid, prefs: OutputPreferences) -> Result<Artifact, EngineError> {
        let session = self.session(id)?.snapshot();
        let result = session
            .result_image()
            .ok_or(EngineError::NotCompleted(session.stage()))?;
        Ok(delivery::export(
            &self.client,
            result,
            session.selected_garment(),
            prefs,
            &self.config.app_id,
            Utc::now(),
        )
        .await?)
    }
}
