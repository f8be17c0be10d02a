//! Pipeline stages for page-by-page PDF conversations.
//!
//! Each submodule implements one step; [`crate::session::Session`] strings
//! them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ vision
//! (%PDF)    (images)   (base64)   (chat API)
//! ```
//!
//! 1. [`input`]:  reject missing, unreadable or non-PDF files up front
//! 2. [`render`]: rasterise every page into a scratch directory
//! 3. [`encode`]: read an image file back as a base64 data URL
//! 4. [`vision`]: one chat-completion request per page; the only stage with
//!    network I/O

pub mod encode;
pub mod input;
pub mod render;
pub mod vision;
