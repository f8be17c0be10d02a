//! Error types for the edgequake-pdfchat library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`SessionError`] is **fatal**: the current action cannot proceed at all
//!   (no rasterizer on the host, unreadable PDF, config file not writable).
//!   Returned as `Err(SessionError)` from the [`crate::session::Session`]
//!   trigger methods.
//!
//! * [`VisionError`] is **per-page**: a single vision request failed (bad
//!   credential, rate limit, timeout). The orchestrator records it in the
//!   conversation as the assistant's reply for that page and moves on to the
//!   next page, so one bad request never costs the rest of the document.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-pdfchat library.
#[derive(Debug, Error)]
pub enum SessionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// `process` was triggered before any PDF was selected.
    #[error("No PDF selected.\nSelect a file before starting processing.")]
    NoFileSelected,

    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// A required field (API key, user prompt) is blank.
    #[error("Missing required input: {field}")]
    MissingInput { field: &'static str },

    /// The connectivity probe failed before a run was started.
    #[error("No connection to the vision provider.\nCheck your internet connection.")]
    Offline,

    // ── Rasterization errors ──────────────────────────────────────────────
    /// The external rasterization capability is not present on this host.
    #[error("PDF rasterizer '{tool}' is not available.\n{hint}")]
    RasterizationUnavailable { tool: String, hint: String },

    /// The rasterizer ran but produced no usable output.
    #[error("Rasterization failed: {detail}")]
    RasterizationFailed { detail: String },

    // ── Vision errors surfaced before a run ───────────────────────────────
    /// A vision error that is fatal for the action that hit it (for example a
    /// malformed API key rejected before rasterizing).
    #[error(transparent)]
    Vision(#[from] VisionError),

    /// A named `edgequake-llm` provider could not be constructed.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Config / export errors ────────────────────────────────────────────
    /// Reading or writing the persisted configuration failed.
    #[error("Config file '{path}' could not be accessed: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Export was requested with nothing to export.
    #[error("There is no conversation to export")]
    EmptyHistory,

    /// Could not create or write the export file.
    #[error("Failed to write export file '{path}': {source}")]
    ExportFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed vision request for a single page.
///
/// The `Display` text is what ends up in the conversation in place of the
/// assistant reply, so every variant reads as a user-facing sentence.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum VisionError {
    /// HTTP 401, or an API key that does not match the provider convention.
    #[error("Invalid API key: {detail}")]
    InvalidCredential { detail: String },

    /// HTTP 404: wrong endpoint, or the model is not served.
    #[error("Endpoint not found. Check that the model '{model}' is available.")]
    EndpointOrModelUnavailable { model: String },

    /// HTTP 429.
    #[error("Rate limit exceeded. Try again in a few moments.")]
    RateLimited,

    /// Timeout, connection failure, or any other status.
    #[error("API error: {message}")]
    TransportError { message: String },
}

impl VisionError {
    /// Build a [`VisionError::TransportError`] from anything printable.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        VisionError::TransportError {
            message: message.to_string(),
        }
    }
}
