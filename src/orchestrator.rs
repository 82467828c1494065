//! Batch capture: turns one request into N sequential model calls.
//!
//! Frames are generated strictly in order against a single seed. Rate-limit
//! and empty responses get one more attempt after a fixed cooldown, and a
//! fixed per-tier pause separates successful frames. A batch only fails
//! outright when nothing was captured; a later failure truncates it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, error};
use uuid::Uuid;

use crate::gemini::{GeminiError, GenerationCall, ImageGenerator, InlineImage};
use crate::models::{GeneratedImage, GenerationRequest, ModelTier, ProgressEvent, ReferenceImage};
use crate::progress::ProgressSink;
use crate::prompt::build_frame_prompt;

const MAX_PREALLOC: usize = 16;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Please upload a reference image first.")]
    MissingReference,
    #[error("API Key is missing.")]
    MissingCredential,
    #[error("Frame count must be at least 1.")]
    InvalidFrameCount,
    #[error("API limit reached. Please try a smaller batch (SNAP x1) or wait 60s.")]
    RateLimited { #[source] source: GeminiError },
    #[error("Capture failed.")]
    CaptureFailed { #[source] source: GeminiError },
    #[error("Capture cancelled.")]
    Cancelled,
}

/// Why a batch stopped before reaching the requested count.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FrameFailure {
    pub frame_index: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub images: Vec<GeneratedImage>,
    pub requested: u32,
    pub seed: u32,
    pub stopped_early: Option<FrameFailure>,
}

impl BatchOutcome {
    pub fn is_partial(&self) -> bool {
        self.images.len() < self.requested as usize
    }

    /// Soft warning for callers; a short batch is not an error.
    pub fn notice(&self) -> Option<&'static str> {
        self.is_partial().then_some("Note: Batch partially completed due to server load.")
    }
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_attempts: u32,
    pub retry_cooldown: Duration,
    pub fast_frame_cooldown: Duration,
    pub quality_frame_cooldown: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_cooldown: Duration::from_secs(15),
            fast_frame_cooldown: Duration::from_secs(12),
            quality_frame_cooldown: Duration::from_secs(3),
        }
    }
}

impl BatchSettings {
    /// Pause between successful frames. The flash tier's per-minute caps are much tighter.
    pub fn frame_cooldown(&self, tier: ModelTier) -> Duration {
        match tier {
            ModelTier::Fast => self.fast_frame_cooldown,
            ModelTier::HighQuality => self.quality_frame_cooldown,
        }
    }
}

/// Source of waits, so pacing can be observed without real time passing.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

enum FrameError {
    Failed(GeminiError),
    Cancelled,
}

pub struct BatchOrchestrator {
    generator: Arc<dyn ImageGenerator>,
    clock: Arc<dyn Clock>,
    settings: BatchSettings,
}

impl BatchOrchestrator {
    pub fn new(generator: Arc<dyn ImageGenerator>, clock: Arc<dyn Clock>, settings: BatchSettings) -> Self {
        Self { generator, clock, settings }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub async fn run_batch(
        &self,
        reference: &ReferenceImage,
        request: &GenerationRequest,
        credential: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, BatchError> {
        if reference.bytes.is_empty() {
            return Err(BatchError::MissingReference);
        }
        if credential.trim().is_empty() {
            return Err(BatchError::MissingCredential);
        }
        if request.frame_count == 0 {
            return Err(BatchError::InvalidFrameCount);
        }

        let total = request.frame_count;
        let seed = rand::thread_rng().gen_range(0..i32::MAX as u32);
        let frame_cooldown = self.settings.frame_cooldown(request.model_tier);
        // frame_count is caller-controlled and unbounded; only reserve what a batch can plausibly hold.
        let mut images: Vec<GeneratedImage> = Vec::with_capacity((total as usize).min(MAX_PREALLOC));
        let mut stopped_early = None;

        info!(seed, frames = total, model = request.model_tier.model_id(), "🚀 Starting capture batch");

        for frame in 0..total {
            progress.notify(ProgressEvent::new(
                format!("Capturing frame {}/{}...", frame + 1, total),
                percent(frame, total),
            ));

            let call = GenerationCall {
                model: request.model_tier.model_id(),
                reference: reference.clone(),
                prompt: build_frame_prompt(request, frame),
                seed,
                aspect_ratio: request.aspect_ratio,
                image_size: request.requested_resolution(),
            };

            match self.capture_frame(frame, &call, credential, progress, cancel).await {
                Ok(inline) => {
                    info!(frame, "✅ Frame captured");
                    images.push(to_generated(frame, inline, call.prompt, request));
                }
                Err(FrameError::Cancelled) => {
                    info!(frame, captured = images.len(), "Capture batch cancelled");
                    return Err(BatchError::Cancelled);
                }
                Err(FrameError::Failed(err)) if images.is_empty() => {
                    error!(frame, error = %err, "❌ Capture batch failed with nothing captured");
                    return Err(if err.is_rate_limit() {
                        BatchError::RateLimited { source: err }
                    } else {
                        BatchError::CaptureFailed { source: err }
                    });
                }
                Err(FrameError::Failed(err)) => {
                    warn!(frame, captured = images.len(), error = %err, "⚠️ Stopping batch early, keeping captured frames");
                    stopped_early = Some(FrameFailure { frame_index: frame, reason: err.to_string() });
                    break;
                }
            }

            if frame + 1 < total {
                progress.notify(ProgressEvent::new(
                    format!("Cooling sensor for frame {}...", frame + 2),
                    percent(frame + 1, total),
                ));
                if self.pause(frame_cooldown, cancel).await.is_err() {
                    info!(frame, captured = images.len(), "Capture batch cancelled during cooldown");
                    return Err(BatchError::Cancelled);
                }
            }
        }

        info!(seed, captured = images.len(), requested = total, "📸 Capture batch finished");
        Ok(BatchOutcome { images, requested: total, seed, stopped_early })
    }

    async fn capture_frame(
        &self,
        frame: u32,
        call: &GenerationCall,
        credential: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<InlineImage, FrameError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(FrameError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FrameError::Cancelled),
                result = self.generator.generate(credential, call) => result,
            };

            match result {
                Ok(image) => return Ok(image),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let secs = self.settings.retry_cooldown.as_secs();
                    warn!(frame, attempt, delay_ms = self.settings.retry_cooldown.as_millis() as u64, error = %err, "Retrying frame after cooldown");
                    let message = if err.is_rate_limit() {
                        format!("Rate limit hit. Cooling down ({secs}s)...")
                    } else {
                        format!("Empty frame returned. Retrying in {secs}s...")
                    };
                    progress.notify(ProgressEvent::new(message, 0.0));
                    self.pause(self.settings.retry_cooldown, cancel).await.map_err(|_| FrameError::Cancelled)?;
                }
                Err(err) => {
                    warn!(frame, attempt, error = %err, "Frame attempt failed");
                    return Err(FrameError::Failed(err));
                }
            }
        }
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), BatchError> {
        if cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BatchError::Cancelled),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }
}

fn percent(done: u32, total: u32) -> f64 {
    100.0 * f64::from(done) / f64::from(total)
}

fn to_generated(frame: u32, inline: InlineImage, prompt: String, request: &GenerationRequest) -> GeneratedImage {
    GeneratedImage {
        id: Uuid::new_v4(),
        frame_index: frame,
        data_url: inline.data_url(),
        mime_type: inline.mime_type,
        prompt,
        caption: request.caption(),
        resolution: request.resolution_tag(),
        strict_mode: request.strict_mode,
        created_at: Utc::now(),
    }
}
