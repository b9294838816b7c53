//! Transformation pipeline: the session state machine.
//!
//! `upload → analyzing → selecting → synthesizing → completed`, with an
//! explicit reset back to `upload`. There is no error stage: adapter
//! failures are absorbed into fallback values and the session still moves
//! forward, so every started session ends `completed` with a renderable
//! image.
//!
//! Each adapter-backed transition is split in two. `start_*` validates the
//! transition, advances the stage and returns a ticket tagged with the
//! session generation. `complete_*` awaits the adapter without holding the
//! session lock and applies the outcome only if the generation still
//! matches; a reset in between bumps the generation and the late outcome is
//! discarded.

use crate::config::PipelineConfig;
use crate::inference::GenderInferenceAdapter;
use crate::synthesis::{GarmentSynthesizer, SynthesisFailure, SynthesisRequest};
use crate::types::{Confidence, Gender, Garment, ImageData, InferenceResult, ResultImage, Stage};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("cannot {action} while session is in stage {stage}")]
    InvalidTransition { stage: Stage, action: &'static str },
    #[error("session generation {generation} was reset; result discarded")]
    Superseded { generation: u64 },
}

/// One in-flight transformation.
#[derive(Debug, Clone)]
pub struct Session {
    generation: u64,
    stage: Stage,
    source: Option<ImageData>,
    detected_gender: Gender,
    confidence: Confidence,
    inference: Option<InferenceResult>,
    garment: Option<Garment>,
    result: Option<ResultImage>,
    synthesis_failure: Option<SynthesisFailure>,
    created_at: DateTime<Utc>,
}

impl Session {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            stage: Stage::Upload,
            source: None,
            detected_gender: Gender::FALLBACK,
            confidence: Confidence::LOW,
            inference: None,
            garment: None,
            result: None,
            synthesis_failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn source_image(&self) -> Option<&ImageData> {
        self.source.as_ref()
    }

    /// Always populated; the fallback gender until inference settles.
    pub fn detected_gender(&self) -> Gender {
        self.detected_gender
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    /// Full inference outcome, once inference has settled.
    pub fn inference(&self) -> Option<&InferenceResult> {
        self.inference.as_ref()
    }

    pub fn selected_garment(&self) -> Option<Garment> {
        self.garment
    }

    /// Present only in [`Stage::Completed`].
    pub fn result_image(&self) -> Option<&ResultImage> {
        self.result.as_ref()
    }

    /// Why synthesis fell back to the source image, if it did.
    pub fn synthesis_failure(&self) -> Option<&SynthesisFailure> {
        self.synthesis_failure.as_ref()
    }

    /// True when any stage substituted a fallback value.
    pub fn is_degraded(&self) -> bool {
        self.synthesis_failure.is_some() || self.inference.as_ref().is_some_and(InferenceResult::is_fallback)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Garment set iff at or past synthesis; result set iff completed.
    pub fn invariants_hold(&self) -> bool {
        self.garment.is_some() == (self.stage >= Stage::Synthesizing)
            && self.result.is_some() == (self.stage == Stage::Completed)
            && self.source.is_some() == (self.stage >= Stage::Analyzing)
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "stage regression {} -> {}", self.stage, next);
        tracing::debug!(generation = self.generation, from = %self.stage, to = %next, "stage transition");
        self.stage = next;
    }
}

/// Proof that inference was requested for a given session generation.
#[derive(Debug)]
pub struct AnalysisTicket {
    generation: u64,
    image: ImageData,
}

impl AnalysisTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Proof that synthesis was requested for a given session generation.
#[derive(Debug)]
pub struct SynthesisTicket {
    generation: u64,
    request: SynthesisRequest,
}

impl SynthesisTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Orchestrates one user's flow through the adapters.
pub struct Pipeline {
    inference: Arc<GenderInferenceAdapter>,
    synthesizer: Arc<dyn GarmentSynthesizer>,
    synthesis_deadline: Duration,
    session: Mutex<Session>,
}

impl Pipeline {
    pub fn new(
        inference: Arc<GenderInferenceAdapter>,
        synthesizer: Arc<dyn GarmentSynthesizer>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            inference,
            synthesizer,
            synthesis_deadline: config.synthesis_deadline,
            session: Mutex::new(Session::new(0)),
        }
    }

    /// Copy of the current session.
    pub fn snapshot(&self) -> Session {
        self.session.lock().clone()
    }

    pub fn stage(&self) -> Stage {
        self.session.lock().stage
    }

    /// `upload → analyzing`.
    pub fn start_upload(&self, image: ImageData) -> Result<AnalysisTicket, PipelineError> {
        let mut session = self.session.lock();
        if session.stage != Stage::Upload {
            return Err(PipelineError::InvalidTransition {
                stage: session.stage,
                action: "upload an image",
            });
        }
        session.source = Some(image.clone());
        session.advance(Stage::Analyzing);
        tracing::info!(generation = session.generation, bytes = image.len(), format = ?image.format(), "image uploaded");

        Ok(AnalysisTicket {
            generation: session.generation,
            image,
        })
    }

    /// `analyzing → selecting`, once inference settles.
    pub async fn complete_analysis(&self, ticket: AnalysisTicket) -> Result<Session, PipelineError> {
        let result = self.inference.infer(&ticket.image).await;

        let mut session = self.session.lock();
        if session.generation != ticket.generation {
            tracing::info!(
                stale = ticket.generation,
                current = session.generation,
                "discarding inference result for abandoned session"
            );
            return Err(PipelineError::Superseded {
                generation: ticket.generation,
            });
        }
        session.detected_gender = result.gender;
        session.confidence = result.confidence;
        session.inference = Some(result);
        session.advance(Stage::Selecting);
        Ok(session.clone())
    }

    /// Upload and wait for inference to settle.
    pub async fn upload(&self, image: ImageData) -> Result<Session, PipelineError> {
        let ticket = self.start_upload(image)?;
        self.complete_analysis(ticket).await
    }

    /// `selecting → synthesizing`.
    pub fn start_selection(&self, garment: Garment) -> Result<SynthesisTicket, PipelineError> {
        let mut session = self.session.lock();
        let source = match (&session.source, session.stage) {
            (Some(source), Stage::Selecting) => source.clone(),
            _ => {
                return Err(PipelineError::InvalidTransition {
                    stage: session.stage,
                    action: "select a garment",
                })
            }
        };
        session.garment = Some(garment);
        session.advance(Stage::Synthesizing);
        tracing::info!(generation = session.generation, %garment, "garment selected");

        Ok(SynthesisTicket {
            generation: session.generation,
            request: SynthesisRequest {
                person: source,
                garment,
            },
        })
    }

    /// `synthesizing → completed`, once synthesis settles or the deadline
    /// passes. Failures store the source image as the result.
    pub async fn complete_synthesis(&self, ticket: SynthesisTicket) -> Result<Session, PipelineError> {
        let outcome = match tokio::time::timeout(
            self.synthesis_deadline,
            self.synthesizer.synthesize(&ticket.request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(SynthesisFailure::TimedOut(self.synthesis_deadline)),
        };

        let mut session = self.session.lock();
        if session.generation != ticket.generation {
            tracing::info!(
                stale = ticket.generation,
                current = session.generation,
                "discarding synthesis result for abandoned session"
            );
            return Err(PipelineError::Superseded {
                generation: ticket.generation,
            });
        }

        match outcome {
            Ok(image) => {
                session.result = Some(image);
            }
            Err(failure) => {
                tracing::warn!(
                    generation = session.generation,
                    kind = failure.kind(),
                    error = %failure,
                    "synthesis failed; returning source image"
                );
                session.result = Some(ResultImage::Inline(ticket.request.person));
                session.synthesis_failure = Some(failure);
            }
        }
        session.advance(Stage::Completed);
        tracing::info!(generation = session.generation, degraded = session.is_degraded(), "session completed");
        Ok(session.clone())
    }

    /// Select a garment and wait for synthesis to settle.
    pub async fn select_garment(&self, garment: Garment) -> Result<Session, PipelineError> {
        let ticket = self.start_selection(garment)?;
        self.complete_synthesis(ticket).await
    }

    /// Discard the current session and start a fresh one in `upload`.
    /// In-flight results for the discarded session will be ignored.
    pub fn reset(&self) -> Session {
        let mut session = self.session.lock();
        let next = session.generation + 1;
        tracing::info!(from = session.generation, to = next, stage = %session.stage, "session reset");
        *session = Session::new(next);
        session.clone()
    }
}
