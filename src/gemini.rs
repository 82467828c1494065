use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn, error};

use crate::models::{AspectRatio, ImageSize, ReferenceImage};

#[derive(Debug, Error)]
pub enum GeminiError {
    #[error("rate limited: {0}")] RateLimited(String),
    #[error("no image data in response")] EmptyPayload,
    #[error("API error (status {status}): {message}")] Api { status: u16, message: String },
    #[error("HTTP error: {0}")] Http(String),
    #[error("Other: {0}")] Other(String),
}

impl GeminiError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GeminiError::RateLimited(_))
    }

    /// Rate limits and empty responses are worth another attempt after a cooldown.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GeminiError::RateLimited(_) | GeminiError::EmptyPayload)
    }
}

/// Everything one frame request sends to the model.
#[derive(Debug, Clone)]
pub struct GenerationCall {
    pub model: &'static str,
    pub reference: ReferenceImage,
    pub prompt: String,
    pub seed: u32,
    pub aspect_ratio: AspectRatio,
    pub image_size: Option<ImageSize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: String,
}

impl InlineImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// The external generative-image capability the orchestrator depends on.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, credential: &str, call: &GenerationCall) -> Result<InlineImage, GeminiError>;
}

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let serde_json::Value::String(s) = val {
                        if s.len() > 100 && s.chars().all(|c| c.is_alphanumeric() || c == '+' || c == '/' || c == '=') {
                            *val = serde_json::Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        serde_json::Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn preview(value: &serde_json::Value) -> String {
    let mut value = value.clone();
    truncate_base64_in_json(&mut value);
    serde_json::to_string(&value).unwrap_or_default()
}

pub struct GeminiClient {
    client: Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GeminiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeminiError::Http(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_string() })
    }

    async fn perform_api_call(&self, credential: &str, call: &GenerationCall) -> Result<InlineImage, GeminiError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, call.model);
        info!("🔗 Making request to: {}", url);

        let request_body = build_request_body(call);
        info!(seed = call.seed, "📤 Request body: {}", preview(&request_body));

        let response = self.client
            .post(&url)
            .header("x-goog-api-key", credential)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| GeminiError::Http(e.to_string()))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let response_text = response.text().await
            .map_err(|e| GeminiError::Http(e.to_string()))?;

        if !status.is_success() {
            error!("❌ API Error response: {}", response_text);
            return Err(classify_error(status, &response_text));
        }

        let parsed: GeminiResponse = serde_json::from_str(&response_text)
            .map_err(|e| GeminiError::Other(format!("parse error: {}", e)))?;

        match extract_first_image(&parsed) {
            Some(image) => {
                info!("🖼️ Extracted {} image ({} chars)", image.mime_type, image.data.len());
                Ok(image)
            }
            None => {
                let finish = parsed.candidates.first()
                    .and_then(|c| c.finish_reason.clone())
                    .unwrap_or_else(|| "none".into());
                warn!(finish_reason = %finish, "⚠️ No image data found in API response");
                Err(GeminiError::EmptyPayload)
            }
        }
    }
}

#[async_trait]
impl ImageGenerator for GeminiClient {
    async fn generate(&self, credential: &str, call: &GenerationCall) -> Result<InlineImage, GeminiError> {
        info!(model = call.model, "Generating image with Gemini API...");
        self.perform_api_call(credential, call).await
    }
}

pub fn build_request_body(call: &GenerationCall) -> serde_json::Value {
    let mut image_config = json!({ "aspectRatio": call.aspect_ratio.as_str() });
    if let Some(size) = call.image_size {
        image_config["imageSize"] = json!(size.as_str());
    }

    json!({
        "contents": [{
            "parts": [
                { "inlineData": { "mimeType": call.reference.mime_type, "data": call.reference.to_base64() } },
                { "text": call.prompt }
            ]
        }],
        "generationConfig": {
            "responseModalities": ["TEXT", "IMAGE"],
            "seed": call.seed,
            "imageConfig": image_config
        }
    })
}

/// Maps a non-success response to an error, separating quota exhaustion from everything else.
pub fn classify_error(status: StatusCode, body: &str) -> GeminiError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok().map(|e| e.error);
    let message = parsed.as_ref()
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| body.chars().take(500).collect());
    let exhausted = parsed.as_ref().and_then(|e| e.status.as_deref()) == Some("RESOURCE_EXHAUSTED")
        || body.contains("RESOURCE_EXHAUSTED");

    if status == StatusCode::TOO_MANY_REQUESTS || exhausted {
        GeminiError::RateLimited(message)
    } else {
        GeminiError::Api { status: status.as_u16(), message }
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct ErrorEnvelope { error: ErrorDetail }

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    Text { text: String },
    Other(serde_json::Value)
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType", default = "default_mime")]
    mime_type: String,
}

fn default_mime() -> String { "image/png".into() }

fn extract_first_image(resp: &GeminiResponse) -> Option<InlineImage> {
    resp.candidates.iter()
        .flat_map(|c| c.content.parts.iter())
        .find_map(|p| match p {
            Part::Inline { inline_data } if !inline_data.data.is_empty() => Some(InlineImage {
                mime_type: inline_data.mime_type.clone(),
                data: inline_data.data.clone(),
            }),
            _ => None,
        })
}
