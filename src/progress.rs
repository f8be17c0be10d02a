//! Observer trait for session events: progress, conversation messages and
//! user-facing notifications.
//!
//! Inject an [`Arc<dyn SessionObserver>`] via
//! [`crate::session::Session::with_observer`] to drive a progress bar, render
//! the conversation, or show toasts. Events are delivered synchronously from
//! the processing loop, in page order.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfchat::{ConversationMessage, SessionObserver};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     messages: AtomicUsize,
//! }
//!
//! impl SessionObserver for CountingObserver {
//!     fn on_message(&self, _page: usize, _message: &ConversationMessage) {
//!         self.messages.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//! ```

use crate::conversation::ConversationMessage;
use crate::session::RunReport;
use std::sync::Arc;

/// Percentage reported once rasterization has finished.
pub const RASTERIZED_PERCENT: f32 = 10.0;

/// Share of the bar spread across the pages.
pub const PAGES_SPAN_PERCENT: f32 = 80.0;

/// Coarse progress when page `page_num` (1-indexed) of `total_pages` starts.
///
/// Advisory only: anchored at [`RASTERIZED_PERCENT`] and scaled linearly
/// towards `RASTERIZED_PERCENT + PAGES_SPAN_PERCENT`; completion reports 100.
pub fn page_start_percent(page_num: usize, total_pages: usize) -> f32 {
    if total_pages == 0 {
        return RASTERIZED_PERCENT;
    }
    let done = page_num.saturating_sub(1) as f32 / total_pages as f32;
    RASTERIZED_PERCENT + done * PAGES_SPAN_PERCENT
}

/// Severity of a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Receives session events. All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    /// Progress text and percentage (0–100).
    fn on_progress(&self, text: &str, percent: f32) {
        let _ = (text, percent);
    }

    /// Rasterization finished; `total_pages` pages will be processed.
    fn on_run_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Just before the vision request for a page is sent.
    fn on_page_start(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// A message was appended to the conversation for `page_num`.
    fn on_message(&self, page_num: usize, message: &ConversationMessage) {
        let _ = (page_num, message);
    }

    /// The vision request for a page failed; its error text was recorded.
    fn on_page_error(&self, page_num: usize, total_pages: usize, error: &str) {
        let _ = (page_num, total_pages, error);
    }

    /// A one-shot user-facing notification.
    fn on_notify(&self, level: NotifyLevel, message: &str) {
        let _ = (level, message);
    }

    /// The run ended (completed or cancelled) and cleanup has run.
    fn on_run_complete(&self, report: &RunReport) {
        let _ = report;
    }
}

/// Observer that ignores every event. Default for a new session.
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

/// Convenience alias for the type stored on the session.
pub type SharedObserver = Arc<dyn SessionObserver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_anchored_and_linear() {
        assert_eq!(page_start_percent(1, 4), 10.0);
        assert_eq!(page_start_percent(3, 4), 50.0);
        assert!(page_start_percent(4, 4) < 90.0);
        assert_eq!(page_start_percent(1, 0), 10.0);
    }

    #[test]
    fn noop_observer_does_not_panic() {
        let o: SharedObserver = Arc::new(NoopObserver);
        o.on_progress("x", 10.0);
        o.on_run_start(3);
        o.on_page_start(1, 3);
        o.on_message(1, &ConversationMessage::user("u"));
        o.on_page_error(2, 3, "boom");
        o.on_notify(NotifyLevel::Error, "bad");
    }
}
