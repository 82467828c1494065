//! Fakes shared by the unit tests: a scripted image generator and a clock that records waits.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::gemini::{GeminiError, GenerationCall, ImageGenerator, InlineImage};
use crate::models::{AspectRatio, GenerationRequest, ImageSize, ModelTier, ProgressEvent, ReferenceImage};
use crate::orchestrator::Clock;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub credential: String,
    pub model: &'static str,
    pub prompt: String,
    pub seed: u32,
    pub aspect_ratio: AspectRatio,
    pub image_size: Option<ImageSize>,
}

/// Replays scripted outcomes in order, then succeeds for every further call.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<InlineImage, GeminiError>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<InlineImage, GeminiError>>) -> Self {
        Self { script: Mutex::new(script.into()), calls: Mutex::default() }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ImageGenerator for ScriptedGenerator {
    async fn generate(&self, credential: &str, call: &GenerationCall) -> Result<InlineImage, GeminiError> {
        let n = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                credential: credential.to_string(),
                model: call.model,
                prompt: call.prompt.clone(),
                seed: call.seed,
                aspect_ratio: call.aspect_ratio,
                image_size: call.image_size,
            });
            calls.len()
        };
        self.script.lock().pop_front().unwrap_or_else(|| Ok(image(n)))
    }
}

pub fn image(n: usize) -> InlineImage {
    InlineImage { mime_type: "image/png".into(), data: format!("iVBORw0KGgo{n}") }
}

pub fn rate_limited() -> GeminiError {
    GeminiError::RateLimited("Resource has been exhausted (e.g. check quota).".into())
}

pub fn server_error() -> GeminiError {
    GeminiError::Api { status: 500, message: "Internal error encountered.".into() }
}

/// Returns immediately and remembers every requested wait.
#[derive(Default)]
pub struct RecordingClock {
    sleeps: Mutex<Vec<Duration>>,
    cancel_on_sleep: Option<CancellationToken>,
}

impl RecordingClock {
    pub fn cancelling(token: CancellationToken) -> Self {
        Self { sleeps: Mutex::default(), cancel_on_sleep: Some(token) }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for RecordingClock {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        if let Some(token) = &self.cancel_on_sleep {
            token.cancel();
        }
    }
}

pub fn reference() -> ReferenceImage {
    ReferenceImage::from_bytes(&b"\xff\xd8\xff\xe0\x00\x10JFIF\x00"[..]).expect("jpeg magic")
}

pub fn request(frame_count: u32, model_tier: ModelTier) -> GenerationRequest {
    GenerationRequest {
        outfit: "Beige knit top".into(),
        location: "Aesthetic minimalist cafe".into(),
        aspect_ratio: AspectRatio::Portrait,
        image_size: Some(ImageSize::TwoK),
        frame_count,
        model_tier,
        strict_mode: true,
    }
}

/// Progress sink that ignores everything.
pub fn quiet(_event: ProgressEvent) {}
