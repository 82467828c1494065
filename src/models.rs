use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use bytes::Bytes;
use base64::Engine;
use thiserror::Error;

/// Which Gemini image model a batch runs against.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    /// Cheaper flash model with tight per-minute request caps.
    #[default]
    #[serde(alias = "flash")]
    Fast,
    /// Pro model; needs its own credential and accepts a resolution tag.
    #[serde(alias = "pro")]
    HighQuality,
}

impl ModelTier {
    pub fn model_id(self) -> &'static str {
        match self {
            ModelTier::Fast => "gemini-2.5-flash-image",
            ModelTier::HighQuality => "gemini-3-pro-image-preview",
        }
    }

    pub fn accepts_resolution(self) -> bool {
        matches!(self, ModelTier::HighQuality)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[default]
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "9:16")]
    Story,
    #[serde(rename = "16:9")]
    Wide,
}

impl AspectRatio {
    pub fn as_str(self) -> &'static str {
        match self {
            AspectRatio::Square => "1:1",
            AspectRatio::Portrait => "3:4",
            AspectRatio::Landscape => "4:3",
            AspectRatio::Story => "9:16",
            AspectRatio::Wide => "16:9",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageSize {
    #[default]
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl ImageSize {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSize::OneK => "1K",
            ImageSize::TwoK => "2K",
            ImageSize::FourK => "4K",
        }
    }
}

/// One user-initiated batch, minus the reference photo and credential.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationRequest {
    pub outfit: String,
    pub location: String,
    #[serde(default)]
    pub aspect_ratio: AspectRatio,
    #[serde(default)]
    pub image_size: Option<ImageSize>,
    pub frame_count: u32,
    #[serde(default)]
    pub model_tier: ModelTier,
    /// Carried through to the results so the client can badge identity-locked shots.
    #[serde(default = "default_strict_mode")]
    pub strict_mode: bool,
}

fn default_strict_mode() -> bool { true }

impl GenerationRequest {
    /// Resolution tag sent to the model; only the high-quality tier takes one.
    pub fn requested_resolution(&self) -> Option<ImageSize> {
        if self.model_tier.accepts_resolution() {
            Some(self.image_size.unwrap_or_default())
        } else {
            None
        }
    }

    /// Tag recorded on generated images.
    pub fn resolution_tag(&self) -> String {
        match self.requested_resolution() {
            Some(size) => size.as_str().to_string(),
            None => "SD".to_string(),
        }
    }

    pub fn caption(&self) -> String {
        format!("{} at {}", self.outfit, self.location)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReferenceImageError {
    #[error("Please upload a reference image first.")]
    Missing,
    #[error("reference image is not valid base64: {0}")]
    Encoding(String),
    #[error("reference image format is not supported")]
    UnsupportedFormat,
}

/// The uploaded identity photo, decoded once per request.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl ReferenceImage {
    /// Accepts raw base64 or a `data:<mime>;base64,<payload>` URL as produced by a browser file reader.
    pub fn from_base64(input: &str) -> Result<Self, ReferenceImageError> {
        let trimmed = input.trim();
        let payload = match trimmed.strip_prefix("data:") {
            Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or_default(),
            None => trimmed,
        };
        if payload.is_empty() {
            return Err(ReferenceImageError::Missing);
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| ReferenceImageError::Encoding(e.to_string()))?;
        Self::from_bytes(decoded)
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self, ReferenceImageError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(ReferenceImageError::Missing);
        }
        let format = image::guess_format(&bytes).map_err(|_| ReferenceImageError::UnsupportedFormat)?;
        Ok(Self { bytes, mime_type: format.to_mime_type().to_string() })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// One successful frame of a batch.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeneratedImage {
    pub id: Uuid,
    pub frame_index: u32,
    pub data_url: String,
    pub mime_type: String,
    pub prompt: String,
    pub caption: String,
    pub resolution: String,
    pub strict_mode: bool,
    pub created_at: DateTime<Utc>,
}

impl GeneratedImage {
    /// Raw bytes behind the `data:` URL.
    pub fn decode(&self) -> Option<Vec<u8>> {
        let (_, payload) = self.data_url.split_once(";base64,")?;
        base64::engine::general_purpose::STANDARD.decode(payload).ok()
    }

    /// Download name, e.g. `snaplock-<id>.png`.
    pub fn file_name(&self) -> String {
        let ext = image::ImageFormat::from_mime_type(&self.mime_type)
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("png");
        format!("snaplock-{}.{}", self.id, ext)
    }
}

/// A progress notification: human message plus percent complete (0-100).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProgressEvent {
    pub message: String,
    pub percent: f64,
}

impl ProgressEvent {
    pub fn new(message: impl Into<String>, percent: f64) -> Self {
        Self { message: message.into(), percent }
    }
}
