//! Prompt text used by the page-processing loop.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: changing the page marker or the fixed
//!    coherence instruction requires editing exactly one place.
//!
//! 2. **Testability**: unit tests can inspect prompts directly without a
//!    live model.

/// Fixed system instruction the vision client puts in front of every request,
/// ahead of the conversation history.
pub const COHERENCE_INSTRUCTION: &str = "You are an assistant specialised in analysing PDF documents. \
You keep the context of the previous pages so that your analysis stays coherent and complete across the whole document.";

/// System message seeded into a fresh conversation when the user has not
/// configured a system prompt of their own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You will receive the pages of a PDF document one at a time, \
each as an image preceded by a [PAGE i/N] marker. Answer the user's request for the current page, \
relating it to earlier pages where relevant.";

/// Pick the system prompt for a new run: the configured one unless it is blank.
pub fn system_prompt_or_default(configured: &str) -> &str {
    let trimmed = configured.trim();
    if trimmed.is_empty() {
        DEFAULT_SYSTEM_PROMPT
    } else {
        trimmed
    }
}

/// Prefix the user's prompt with an explicit page marker.
///
/// ```rust
/// use edgequake_pdfchat::prompts::page_prompt;
/// assert_eq!(page_prompt(2, 7, "Summarise"), "[PAGE 2/7]\n\nSummarise");
/// ```
pub fn page_prompt(page_num: usize, total_pages: usize, user_prompt: &str) -> String {
    format!("[PAGE {page_num}/{total_pages}]\n\n{user_prompt}")
}

/// The assistant-slot text recorded when a page request fails.
pub fn page_error_text(page_num: usize, error: &impl std::fmt::Display) -> String {
    format!("Error processing page {page_num}: {error}")
}
