use std::time::Duration;

use crate::models::ModelTier;
use crate::orchestrator::BatchSettings;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_CAMERA_ROLL_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: Option<String>,
    pub pro_api_key: Option<String>,
    pub api_base: String,
    pub request_timeout: Duration,
    pub port: u16,
    /// Most images the in-memory camera roll keeps; older ones are dropped.
    pub camera_roll_limit: usize,
    pub batch: BatchSettings,
}

impl AppConfig {
    /// Reads the process environment; call `dotenv::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let key = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let secs = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };
        let defaults = BatchSettings::default();

        Self {
            api_key: key("GEMINI_API_KEY"),
            pro_api_key: key("GEMINI_PRO_API_KEY"),
            api_base: lookup("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            request_timeout: secs("GEMINI_TIMEOUT_SECS", Duration::from_secs(120)),
            port: lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
            camera_roll_limit: lookup("CAMERA_ROLL_LIMIT")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(DEFAULT_CAMERA_ROLL_LIMIT),
            batch: BatchSettings {
                max_attempts: lookup("BATCH_MAX_ATTEMPTS")
                    .and_then(|v| v.parse().ok())
                    .filter(|n: &u32| *n > 0)
                    .unwrap_or(defaults.max_attempts),
                retry_cooldown: secs("BATCH_RETRY_COOLDOWN_SECS", defaults.retry_cooldown),
                fast_frame_cooldown: secs("BATCH_FAST_COOLDOWN_SECS", defaults.fast_frame_cooldown),
                quality_frame_cooldown: secs("BATCH_QUALITY_COOLDOWN_SECS", defaults.quality_frame_cooldown),
            },
        }
    }

    /// Credential for a tier; a key supplied with the request wins over configured ones.
    pub fn credential_for(&self, tier: ModelTier, override_key: Option<&str>) -> Option<String> {
        if let Some(key) = override_key.map(str::trim).filter(|k| !k.is_empty()) {
            return Some(key.to_string());
        }
        match tier {
            ModelTier::Fast => self.api_key.clone(),
            ModelTier::HighQuality => self.pro_api_key.clone(),
        }
    }

    /// Masked key for startup logs.
    pub fn key_hint(key: &str) -> String {
        let shown: String = key.chars().take(6).collect();
        format!("{shown}...")
    }
}
