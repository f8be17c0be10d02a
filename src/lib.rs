//! # edgequake-pdfchat
//!
//! Read a PDF page by page with a vision-capable chat model, keeping one
//! running conversation across the whole document.
//!
//! ## Why this crate?
//!
//! Asking a model about a long PDF in one shot loses layout, figures and
//! reading order. Here each page is rasterised into an image and sent on its
//! own, together with everything the model has already said about the
//! previous pages, so answers on page 12 can build on page 3.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input    check the file exists and starts with %PDF
//!  ├─ 2. Render   rasterise every page (pdftoppm or pdfium)
//!  ├─ 3. Encode   image file → base64 data URL
//!  ├─ 4. Vision   one request per page, in order, with the full history
//!  └─ 5. Export   non-system conversation + summary as JSON
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfchat::{
//!     Config, OpenRouterClient, ProcessingConfig, RasterBackend, Session,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProcessingConfig::default();
//!     let vision = OpenRouterClient::new(&config)?;
//!     let rasterizer = RasterBackend::Pdftoppm.build(&config);
//!
//!     let mut session = Session::new(config, rasterizer, Box::new(vision))
//!         .with_settings(Config {
//!             api_key: std::env::var("OPENROUTER_API_KEY")?,
//!             system_prompt: String::new(),
//!         });
//!
//!     session.select_file("report.pdf")?;
//!     let report = session.process("Summarise this page.").await?;
//!     eprintln!("{}/{} pages answered", report.succeeded_pages, report.total_pages);
//!
//!     for msg in session.history().non_system() {
//!         println!("{:?}: {}", msg.role, msg.text());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfchat` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-pdfchat = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod conversation;
pub mod error;
pub mod export;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ImageFormat, ProcessingConfig, ProcessingConfigBuilder};
pub use conversation::{ConversationHistory, ConversationMessage, MessageContent, Role};
pub use error::{SessionError, VisionError};
pub use export::{ExportDocument, ExportSummary};
pub use pipeline::render::{
    PageImage, PdfiumRasterizer, PdftoppmRasterizer, RasterBackend, Rasterizer,
};
pub use pipeline::vision::{OpenRouterClient, ProviderVisionClient, VisionApi};
pub use progress::{NoopObserver, NotifyLevel, SessionObserver, SharedObserver};
pub use session::{RunOutcome, RunReport, RunState, Session};
pub use store::{Config, ConfigStore};
