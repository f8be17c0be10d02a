//! The processing session: the one object a front-end talks to.
//!
//! A [`Session`] owns everything a run needs (selected PDF, saved settings,
//! conversation history, rasterizer, vision client, observer) and exposes the
//! user-facing triggers as methods:
//!
//! | Trigger            | Method                         |
//! |--------------------|--------------------------------|
//! | pick a file        | [`Session::select_file`]       |
//! | save settings      | [`Session::save_config`]       |
//! | process all pages  | [`Session::process`]           |
//! | clear conversation | [`Session::clear_history`]     |
//! | export             | [`Session::export_history`]    |
//!
//! ## Run lifecycle
//!
//! ```text
//! Idle ─▶ Rasterizing ─▶ ProcessingPage(1) ─▶ … ─▶ ProcessingPage(N) ─▶ Completed
//!              │                    │
//!              ▼                    ▼ (token cancelled between pages)
//!            Failed             Cancelled
//! ```
//!
//! Pages are processed strictly one after another; each request carries the
//! whole conversation so far. A failed page is recorded in the conversation
//! and the run moves on. The scratch images are removed exactly once when the
//! run ends, whatever the outcome.

use crate::config::ProcessingConfig;
use crate::conversation::{ConversationHistory, ConversationMessage};
use crate::error::{SessionError, VisionError};
use crate::export::{build_export, default_file_name, write_export, ExportContext};
use crate::pipeline::input;
use crate::pipeline::render::{PageImage, Rasterizer, ScratchDir};
use crate::pipeline::vision::{check_api_key_format, VisionApi};
use crate::progress::{
    page_start_percent, NoopObserver, NotifyLevel, SharedObserver, RASTERIZED_PERCENT,
};
use crate::prompts::{page_error_text, page_prompt, system_prompt_or_default};
use crate::store::{Config, ConfigStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the session is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Rasterizing,
    ProcessingPage {
        page: usize,
        total: usize,
    },
    Completed,
    Failed,
    Cancelled,
}

/// How a run that did not fail fatally ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

/// Summary of one [`Session::process`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Pages produced by the rasterizer.
    pub total_pages: usize,
    pub succeeded_pages: usize,
    pub failed_pages: usize,
    pub duration_ms: u64,
}

impl RunReport {
    /// Pages that were sent to the vision client.
    pub fn processed_pages(&self) -> usize {
        self.succeeded_pages + self.failed_pages
    }
}

/// Processing session context.
pub struct Session {
    config: ProcessingConfig,
    settings: Config,
    store: Option<ConfigStore>,
    pdf_path: Option<PathBuf>,
    user_prompt: String,
    history: ConversationHistory,
    last_page_count: usize,
    state: RunState,
    observer: SharedObserver,
    rasterizer: Box<dyn Rasterizer>,
    vision: Box<dyn VisionApi>,
    scratch: ScratchDir,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        config: ProcessingConfig,
        rasterizer: Box<dyn Rasterizer>,
        vision: Box<dyn VisionApi>,
    ) -> Self {
        let scratch = ScratchDir::new(config.scratch_dir.clone());
        Self {
            config,
            settings: Config::default(),
            store: None,
            pdf_path: None,
            user_prompt: String::new(),
            history: ConversationHistory::new(),
            last_page_count: 0,
            state: RunState::Idle,
            observer: Arc::new(NoopObserver),
            rasterizer,
            vision,
            scratch,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach an observer for progress, messages and notifications.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Persist settings through `store` on [`Session::save_config`].
    pub fn with_store(mut self, store: ConfigStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Start from already-loaded settings.
    pub fn with_settings(mut self, settings: Config) -> Self {
        self.settings = settings;
        self
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    pub fn settings(&self) -> &Config {
        &self.settings
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn selected_file(&self) -> Option<&Path> {
        self.pdf_path.as_deref()
    }

    /// Token that stops a running [`Session::process`] before its next page.
    ///
    /// A cancelled token is replaced when `process` returns, whatever the
    /// outcome, so fetch a fresh one for every run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn notify(&self, level: NotifyLevel, message: &str) {
        self.observer.on_notify(level, message);
    }

    /// Report a fatal error to the observer and hand it back.
    fn reject<T>(&self, err: SessionError) -> Result<T, SessionError> {
        warn!("{err}");
        self.notify(NotifyLevel::Error, &err.to_string());
        Err(err)
    }

    // ── Triggers ─────────────────────────────────────────────────────────

    /// Select the PDF to process.
    pub fn select_file(&mut self, path: impl AsRef<Path>) -> Result<(), SessionError> {
        match input::validate_pdf(path) {
            Ok(pdf) => {
                info!("Selected {}", pdf.display());
                self.pdf_path = Some(pdf);
                Ok(())
            }
            Err(e) => self.reject(e),
        }
    }

    /// Validate and persist new settings.
    ///
    /// Both fields are trimmed. A non-blank key must carry the provider
    /// prefix and, when the provider is reachable, be accepted by it. A blank
    /// key is saved as-is.
    pub async fn save_config(&mut self, settings: Config) -> Result<(), SessionError> {
        let settings = Config {
            api_key: settings.api_key.trim().to_string(),
            system_prompt: settings.system_prompt.trim().to_string(),
        };

        if !settings.api_key.is_empty() && self.vision.requires_api_key() {
            if let Err(e) = check_api_key_format(&settings.api_key, &self.config.api_key_prefix) {
                return self.reject(e.into());
            }

            if self.vision.check_connectivity().await {
                self.notify(NotifyLevel::Info, "Validating API key...");
                if !self.vision.validate_api_key(&settings.api_key).await {
                    return self.reject(
                        VisionError::InvalidCredential {
                            detail: "the provider rejected the API key".to_string(),
                        }
                        .into(),
                    );
                }
            } else {
                self.notify(
                    NotifyLevel::Warning,
                    "Offline: the API key was saved without being checked.",
                );
            }
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.try_save(&settings).await {
                return self.reject(e);
            }
        } else {
            debug!("No config store attached; settings kept in memory");
        }

        self.settings = settings;
        self.notify(NotifyLevel::Success, "Configuration saved");
        Ok(())
    }

    /// Process every page of the selected PDF with `user_prompt`.
    ///
    /// Returns `Ok` when the run reached the end (or was cancelled), even if
    /// some pages failed: their error text is in the conversation and counted
    /// in [`RunReport::failed_pages`]. Returns `Err` only when no page could
    /// be attempted at all.
    pub async fn process(&mut self, user_prompt: &str) -> Result<RunReport, SessionError> {
        let user_prompt = user_prompt.trim().to_string();
        let api_key = self.settings.api_key.trim().to_string();
        let needs_key = self.vision.requires_api_key();

        let pdf = match (&self.pdf_path, needs_key && api_key.is_empty(), user_prompt.is_empty()) {
            (None, _, _) => return self.reject(SessionError::NoFileSelected),
            (_, true, _) => return self.reject(SessionError::MissingInput { field: "API key" }),
            (_, _, true) => return self.reject(SessionError::MissingInput { field: "prompt" }),
            (Some(p), false, false) => p.clone(),
        };
        if needs_key {
            if let Err(e) = check_api_key_format(&api_key, &self.config.api_key_prefix) {
                return self.reject(e.into());
            }
        }
        if !self.vision.check_connectivity().await {
            return self.reject(SessionError::Offline);
        }

        let started = Instant::now();
        self.user_prompt = user_prompt.clone();
        info!(
            "Processing {} with {}",
            pdf.display(),
            self.rasterizer.name()
        );

        let result = self.run(&pdf, &api_key, &user_prompt, started).await;

        if let Err(e) = self.scratch.cleanup().await {
            warn!(
                "Could not remove scratch dir {}: {e}",
                self.scratch.path().display()
            );
        }

        // A cancel that lands after the last check must not leak into the next run.
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        match result {
            Ok(report) => {
                self.observer.on_run_complete(&report);
                Ok(report)
            }
            Err(e) => {
                self.state = RunState::Failed;
                self.reject(e)
            }
        }
    }

    async fn run(
        &mut self,
        pdf: &Path,
        api_key: &str,
        user_prompt: &str,
        started: Instant,
    ) -> Result<RunReport, SessionError> {
        self.state = RunState::Rasterizing;
        self.observer.on_progress("Converting PDF to images...", 0.0);

        self.scratch
            .prepare()
            .await
            .map_err(|e| SessionError::RasterizationFailed {
                detail: format!(
                    "cannot prepare scratch dir {}: {e}",
                    self.scratch.path().display()
                ),
            })?;

        let render_start = Instant::now();
        let pages = self.rasterizer.rasterize(pdf, self.scratch.path()).await?;
        if pages.is_empty() {
            return Err(SessionError::RasterizationFailed {
                detail: "no page images were produced".to_string(),
            });
        }
        let total = pages.len();
        info!(
            "Rasterised {} pages in {}ms",
            total,
            render_start.elapsed().as_millis()
        );

        self.last_page_count = total;
        self.observer.on_run_start(total);
        self.observer.on_progress(
            "Images generated, starting processing...",
            RASTERIZED_PERCENT,
        );

        self.history.reset();
        let system_prompt = system_prompt_or_default(&self.settings.system_prompt).to_string();
        self.history.append(ConversationMessage::system(system_prompt));

        let mut succeeded = 0;
        let mut failed = 0;
        let mut outcome = RunOutcome::Completed;

        for (idx, page) in pages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Cancelled before page {}/{}", idx + 1, total);
                outcome = RunOutcome::Cancelled;
                break;
            }

            if self.process_page(page, idx + 1, total, api_key, user_prompt).await {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }

        let (state, summary, level) = match outcome {
            RunOutcome::Completed if failed == 0 => (
                RunState::Completed,
                "PDF processed successfully".to_string(),
                NotifyLevel::Success,
            ),
            RunOutcome::Completed => (
                RunState::Completed,
                format!("PDF processed: {failed} of {total} pages failed"),
                NotifyLevel::Warning,
            ),
            RunOutcome::Cancelled => (
                RunState::Cancelled,
                format!(
                    "Processing cancelled after {} of {} pages",
                    succeeded + failed,
                    total
                ),
                NotifyLevel::Warning,
            ),
        };
        self.state = state;
        self.observer.on_progress(
            match outcome {
                RunOutcome::Completed => "Processing complete!",
                RunOutcome::Cancelled => "Processing cancelled",
            },
            100.0,
        );
        self.notify(level, &summary);

        let report = RunReport {
            outcome,
            total_pages: total,
            succeeded_pages: succeeded,
            failed_pages: failed,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Run finished: {}/{} pages ok, {} failed, {}ms",
            report.succeeded_pages, report.total_pages, report.failed_pages, report.duration_ms
        );
        Ok(report)
    }

    /// Send one page and record the exchange. Returns whether the request
    /// succeeded.
    async fn process_page(
        &mut self,
        page: &PageImage,
        page_num: usize,
        total: usize,
        api_key: &str,
        user_prompt: &str,
    ) -> bool {
        self.state = RunState::ProcessingPage {
            page: page_num,
            total,
        };
        self.observer.on_progress(
            &format!("Processing page {page_num}/{total}..."),
            page_start_percent(page_num, total),
        );
        self.observer.on_page_start(page_num, total);

        let prompt = page_prompt(page_num, total, user_prompt);
        let page_start = Instant::now();
        let reply = self
            .vision
            .analyze_page(page, &prompt, api_key, self.history.snapshot())
            .await;

        let (assistant, ok) = match reply {
            Ok(text) => {
                debug!(
                    "Page {}/{}: {} chars in {}ms",
                    page_num,
                    total,
                    text.len(),
                    page_start.elapsed().as_millis()
                );
                (ConversationMessage::assistant(text), true)
            }
            Err(e) => {
                warn!("Page {}/{} failed: {}", page_num, total, e);
                let text = page_error_text(page_num, &e);
                self.observer.on_page_error(page_num, total, &text);
                self.notify(NotifyLevel::Warning, &text);
                (ConversationMessage::assistant(text), false)
            }
        };

        let user = ConversationMessage::user(prompt);
        self.history.append(user.clone());
        self.observer.on_message(page_num, &user);
        self.history.append(assistant.clone());
        self.observer.on_message(page_num, &assistant);
        ok
    }

    /// Drop the conversation.
    pub fn clear_history(&mut self) {
        self.history.reset();
        self.last_page_count = 0;
        debug!("Conversation cleared");
        self.notify(NotifyLevel::Info, "Conversation cleared");
    }

    /// Export the conversation to `path`, or to the dated default file name in
    /// the working directory. Returns the path written.
    pub async fn export_history(&self, path: Option<&Path>) -> Result<PathBuf, SessionError> {
        let now = Utc::now();
        let pdf_file = self
            .pdf_path
            .as_deref()
            .map(input::file_name)
            .unwrap_or_else(|| "Unknown".to_string());
        let ctx = ExportContext {
            pdf_file: &pdf_file,
            total_pages: self.last_page_count,
            user_prompt: &self.user_prompt,
            system_prompt: &self.settings.system_prompt,
        };

        let doc = match build_export(&self.history, &ctx, now) {
            Ok(doc) => doc,
            Err(e) => return self.reject(e),
        };
        let target = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(default_file_name(now.date_naive())));

        if let Err(e) = write_export(&doc, &target).await {
            return self.reject(e);
        }
        self.notify(NotifyLevel::Success, "Conversation exported");
        Ok(target)
    }
}
