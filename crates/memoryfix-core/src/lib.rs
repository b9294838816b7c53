//! memoryfix-core — virtual try-on pipeline for photo restoration.
//!
//! Infers a presentation gender from an uploaded photo, composites a
//! traditional garment onto the subject through a remote try-on model, and
//! exports the result. Provider failures never surface to the user: each
//! adapter degrades to a fixed fallback and the pipeline always completes
//! with a displayable image.

pub mod config;
pub mod delivery;
pub mod garments;
pub mod inference;
pub mod pipeline;
pub mod synthesis;
pub mod types;

pub use config::Config;
pub use delivery::{Artifact, OutputFormat, OutputPreferences, Quality};
pub use inference::GenderInferenceAdapter;
pub use pipeline::{Pipeline, PipelineError, Session};
pub use synthesis::{GarmentSynthesizer, SynthesisFailure, SynthesisRequest};
pub use types::{Confidence, Garment, Gender, ImageData, InferenceResult, ResultImage, Stage};
