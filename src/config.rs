//! Runtime configuration for a page-processing run.
//!
//! Every knob of a run lives in [`ProcessingConfig`], built via its
//! [`ProcessingConfigBuilder`]. The user-editable settings that survive a
//! restart (API key, system prompt) are a separate, much smaller record:
//! see [`crate::store::Config`].

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default vision model requested from the chat-completions endpoint.
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-pro-preview";

/// Default chat-completions base URL.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Prefix every OpenRouter API key carries.
pub const DEFAULT_API_KEY_PREFIX: &str = "sk-or-";

/// Configuration for a page-processing run.
///
/// # Example
/// ```rust
/// use edgequake_pdfchat::ProcessingConfig;
///
/// let config = ProcessingConfig::builder()
///     .dpi(150)
///     .model("openai/gpt-4.1-mini")
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 150);
/// ```
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Rasterization density. Range: 72–400. Default: 200.
    ///
    /// 200 DPI keeps body text legible for the model while a letter-size page
    /// stays around 1700 × 2200 px.
    pub dpi: u32,

    /// Image format written by the rasterizer. Default: JPEG.
    pub image_format: ImageFormat,

    /// Model identifier sent in every request.
    pub model: String,

    /// Sampling temperature. Default: 0.7.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4000.
    pub max_tokens: usize,

    /// Per-request timeout for page analysis, in seconds. Default: 30.
    pub api_timeout_secs: u64,

    /// Timeout of the unauthenticated reachability probe. Default: 5.
    pub probe_timeout_secs: u64,

    /// Timeout of the authenticated key probe. Default: 10.
    pub validate_timeout_secs: u64,

    /// Base URL of the chat-completions API (no trailing slash).
    pub base_url: String,

    /// Prefix a well-formed API key must start with. Empty disables the check.
    pub api_key_prefix: String,

    /// Sent as `HTTP-Referer` so the provider can attribute traffic.
    pub app_referer: String,

    /// Sent as `X-Title`.
    pub app_title: String,

    /// Scratch directory for rasterized pages. Emptied before every run and
    /// removed after it.
    pub scratch_dir: PathBuf,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            dpi: 200,
            image_format: ImageFormat::default(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 4000,
            api_timeout_secs: 30,
            probe_timeout_secs: 5,
            validate_timeout_secs: 10,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key_prefix: DEFAULT_API_KEY_PREFIX.to_string(),
            app_referer: "https://iapdf.local".to_string(),
            app_title: "IApdf".to_string(),
            scratch_dir: std::env::temp_dir().join("pdfchat").join("images"),
        }
    }
}

impl ProcessingConfig {
    /// Create a new builder for `ProcessingConfig`.
    pub fn builder() -> ProcessingConfigBuilder {
        ProcessingConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`ProcessingConfig`].
#[derive(Debug)]
pub struct ProcessingConfigBuilder {
    config: ProcessingConfig,
}

impl ProcessingConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn image_format(mut self, format: ImageFormat) -> Self {
        self.config.image_format = format;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn probe_timeout_secs(mut self, secs: u64) -> Self {
        self.config.probe_timeout_secs = secs;
        self
    }

    pub fn validate_timeout_secs(mut self, secs: u64) -> Self {
        self.config.validate_timeout_secs = secs;
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn api_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.api_key_prefix = prefix.into();
        self
    }

    pub fn app_referer(mut self, referer: impl Into<String>) -> Self {
        self.config.app_referer = referer.into();
        self
    }

    pub fn app_title(mut self, title: impl Into<String>) -> Self {
        self.config.app_title = title.into();
        self
    }

    pub fn scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.scratch_dir = dir.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ProcessingConfig, SessionError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(SessionError::InvalidConfig("model must not be empty".into()));
        }
        if c.max_tokens == 0 {
            return Err(SessionError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(SessionError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if !c.base_url.starts_with("http://") && !c.base_url.starts_with("https://") {
            return Err(SessionError::InvalidConfig(format!(
                "base_url must be an HTTP/HTTPS URL, got '{}'",
                c.base_url
            )));
        }
        if c.scratch_dir.as_os_str().is_empty() {
            return Err(SessionError::InvalidConfig(
                "scratch_dir must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Raster format of the per-page images.
///
/// JPEG keeps request bodies small at 200 DPI; PNG is lossless and better for
/// tiny print at the cost of 3–5× larger payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageFormat {
    #[default]
    Jpeg,
    Png,
}

impl ImageFormat {
    /// File extension written by the rasterizers.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }

    /// MIME type used in the image data URL.
    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    /// Guess the format from a file extension (case-insensitive).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            _ => None,
        }
    }
}
