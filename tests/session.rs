//! Integration tests for the processing session.
//!
//! The rasterizer and the vision client are replaced by scripted fakes, so
//! these tests need neither poppler/pdfium nor network access.

use async_trait::async_trait;
use edgequake_pdfchat::prompts::DEFAULT_SYSTEM_PROMPT;
use edgequake_pdfchat::{
    Config, ConfigStore, ConversationMessage, NotifyLevel, PageImage, ProcessingConfig,
    Rasterizer, Role, RunOutcome, RunReport, RunState, Session, SessionError, SessionObserver,
    VisionApi, VisionError,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

const KEY: &str = "sk-or-v1-test";

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Writes `pages` dummy JPEGs, or fails after writing them.
struct FakeRasterizer {
    pages: usize,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    fn name(&self) -> &str {
        "fake"
    }

    async fn rasterize(
        &self,
        _pdf_path: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PageImage>, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut pages = Vec::new();
        for n in 1..=self.pages {
            let path = out_dir.join(format!("page-{n}.jpg"));
            std::fs::write(&path, b"\xFF\xD8\xFF").unwrap();
            pages.push(PageImage {
                page_number: n,
                path,
            });
        }
        if self.fail {
            return Err(SessionError::RasterizationFailed {
                detail: "Syntax Error: broken xref".into(),
            });
        }
        Ok(pages)
    }
}

#[derive(Debug, Clone)]
struct Call {
    prompt: String,
    history_len: usize,
    image: PathBuf,
}

#[derive(Default)]
struct ScriptedVision {
    calls: Arc<Mutex<Vec<Call>>>,
    /// 1-based call number → error to return.
    failures: HashMap<usize, VisionError>,
    /// Cancel the token in `cancel_slot` while serving this call.
    cancel_at: Option<usize>,
    cancel_slot: Arc<Mutex<Option<CancellationToken>>>,
    offline: bool,
    reject_keys: bool,
    key_checks: Arc<AtomicUsize>,
}

#[async_trait]
impl VisionApi for ScriptedVision {
    async fn analyze_page(
        &self,
        image: &PageImage,
        prompt: &str,
        _api_key: &str,
        history: &[ConversationMessage],
    ) -> Result<String, VisionError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                prompt: prompt.to_string(),
                history_len: history.len(),
                image: image.path.clone(),
            });
            calls.len()
        };
        if self.cancel_at == Some(n) {
            if let Some(token) = self.cancel_slot.lock().unwrap().as_ref() {
                token.cancel();
            }
        }
        match self.failures.get(&n) {
            Some(e) => Err(e.clone()),
            None => Ok(format!("analysis of page {}", image.page_number)),
        }
    }

    async fn check_connectivity(&self) -> bool {
        !self.offline
    }

    async fn validate_api_key(&self, _api_key: &str) -> bool {
        self.key_checks.fetch_add(1, Ordering::SeqCst);
        !self.reject_keys
    }
}

#[derive(Default)]
struct Recorder {
    progress: Mutex<Vec<f32>>,
    messages: Mutex<Vec<(usize, Role)>>,
    page_errors: Mutex<Vec<usize>>,
    notes: Mutex<Vec<(NotifyLevel, String)>>,
    reports: Mutex<Vec<RunReport>>,
}

impl SessionObserver for Recorder {
    fn on_progress(&self, _text: &str, percent: f32) {
        self.progress.lock().unwrap().push(percent);
    }
    fn on_message(&self, page_num: usize, message: &ConversationMessage) {
        self.messages.lock().unwrap().push((page_num, message.role));
    }
    fn on_page_error(&self, page_num: usize, _total: usize, _error: &str) {
        self.page_errors.lock().unwrap().push(page_num);
    }
    fn on_notify(&self, level: NotifyLevel, message: &str) {
        self.notes.lock().unwrap().push((level, message.to_string()));
    }
    fn on_run_complete(&self, report: &RunReport) {
        self.reports.lock().unwrap().push(report.clone());
    }
}

impl Recorder {
    fn errors(&self) -> usize {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == NotifyLevel::Error)
            .count()
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    session: Session,
    dir: TempDir,
    calls: Arc<Mutex<Vec<Call>>>,
    raster_calls: Arc<AtomicUsize>,
    recorder: Arc<Recorder>,
}

impl Harness {
    fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

fn harness_with(pages: usize, fail_raster: bool, vision: ScriptedVision) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = ProcessingConfig::builder()
        .scratch_dir(dir.path().join("scratch"))
        .build()
        .unwrap();

    let raster_calls = Arc::new(AtomicUsize::new(0));
    let rasterizer = FakeRasterizer {
        pages,
        fail: fail_raster,
        calls: raster_calls.clone(),
    };
    let calls = vision.calls.clone();
    let recorder = Arc::new(Recorder::default());

    let pdf = dir.path().join("report.pdf");
    std::fs::write(&pdf, b"%PDF-1.4\n%%EOF\n").unwrap();

    let mut session = Session::new(config, Box::new(rasterizer), Box::new(vision))
        .with_settings(Config {
            api_key: KEY.into(),
            system_prompt: "Answer in English.".into(),
        })
        .with_observer(recorder.clone());
    session.select_file(&pdf).unwrap();

    Harness {
        session,
        dir,
        calls,
        raster_calls,
        recorder,
    }
}

fn harness(pages: usize) -> Harness {
    harness_with(pages, false, ScriptedVision::default())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn history_has_system_then_one_pair_per_page() {
    let mut h = harness(3);
    let report = assert_ok!(h.session.process("Summarise").await);

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.total_pages, 3);
    assert_eq!(report.succeeded_pages, 3);

    let msgs = h.session.history().snapshot();
    assert_eq!(msgs.len(), 1 + 2 * 3);
    assert_eq!(msgs[0].role, Role::System);
    assert_eq!(msgs[0].text(), "Answer in English.");
    for page in 1..=3 {
        let user = &msgs[2 * page - 1];
        let assistant = &msgs[2 * page];
        assert_eq!(user.role, Role::User);
        assert_eq!(user.text(), format!("[PAGE {page}/3]\n\nSummarise"));
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.text(), format!("analysis of page {page}"));
    }
    assert_eq!(h.session.state(), RunState::Completed);
}

#[tokio::test]
async fn each_request_sees_the_conversation_so_far() {
    let mut h = harness(3);
    h.session.process("q").await.unwrap();

    let calls = h.calls();
    let lens: Vec<usize> = calls.iter().map(|c| c.history_len).collect();
    assert_eq!(lens, vec![1, 3, 5]);
    assert_eq!(calls[1].prompt, "[PAGE 2/3]\n\nq");
    assert!(calls[0].image.ends_with("page-1.jpg"));
    assert!(calls[2].image.ends_with("page-3.jpg"));
}

#[tokio::test]
async fn rate_limit_on_page_two_is_recorded_and_run_continues() {
    let vision = ScriptedVision {
        failures: HashMap::from([(2, VisionError::RateLimited)]),
        ..Default::default()
    };
    let mut h = harness_with(3, false, vision);
    let report = h.session.process("q").await.unwrap();

    assert_eq!(report.succeeded_pages, 2);
    assert_eq!(report.failed_pages, 1);
    assert_eq!(h.calls().len(), 3);

    let msgs = h.session.history().snapshot();
    assert_eq!(msgs.len(), 7);
    let fourth = msgs[4].text();
    assert_eq!(msgs[4].role, Role::Assistant);
    assert!(fourth.starts_with("Error processing page 2:"), "got: {fourth}");
    assert!(fourth.to_lowercase().contains("rate limit"));
    assert_eq!(msgs[3].text(), "[PAGE 2/3]\n\nq");
    for i in [1, 2, 5, 6] {
        assert!(!msgs[i].text().contains("Error"), "message {i}");
    }

    assert_eq!(*h.recorder.page_errors.lock().unwrap(), vec![2]);
    assert_eq!(h.recorder.messages.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn zero_images_fail_without_any_request() {
    let mut h = harness(0);
    let err = assert_err!(h.session.process("q").await);

    assert!(matches!(err, SessionError::RasterizationFailed { .. }));
    assert!(h.calls().is_empty());
    assert_eq!(h.session.state(), RunState::Failed);
    assert_eq!(h.recorder.errors(), 1);
    assert!(h.recorder.reports.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_key_is_rejected_before_rasterizing() {
    let mut h = harness(2);
    h.session = h.session.with_settings(Config {
        api_key: "sk-proj-123".into(),
        system_prompt: String::new(),
    });

    let err = h.session.process("q").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Vision(VisionError::InvalidCredential { .. })
    ));
    assert_eq!(h.raster_calls.load(Ordering::SeqCst), 0);
    assert!(h.calls().is_empty());
}

#[tokio::test]
async fn missing_inputs_are_rejected() {
    let mut h = harness(1);
    let err = h.session.process("   ").await.unwrap_err();
    assert!(matches!(err, SessionError::MissingInput { field: "prompt" }));

    h.session = h.session.with_settings(Config::default());
    let err = h.session.process("q").await.unwrap_err();
    assert!(matches!(err, SessionError::MissingInput { field: "API key" }));

    assert_eq!(h.raster_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.recorder.errors(), 2);
}

#[tokio::test]
async fn processing_without_a_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = ProcessingConfig::builder()
        .scratch_dir(dir.path().join("scratch"))
        .build()
        .unwrap();
    let raster_calls = Arc::new(AtomicUsize::new(0));
    let mut session = Session::new(
        config,
        Box::new(FakeRasterizer {
            pages: 1,
            fail: false,
            calls: raster_calls.clone(),
        }),
        Box::new(ScriptedVision::default()),
    )
    .with_settings(Config {
        api_key: KEY.into(),
        system_prompt: String::new(),
    });

    let err = session.process("q").await.unwrap_err();
    assert!(matches!(err, SessionError::NoFileSelected));
    assert_eq!(raster_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn selecting_a_non_pdf_fails() {
    let mut h = harness(1);
    let fake = h.dir.path().join("notes.pdf");
    std::fs::write(&fake, b"hello world").unwrap();

    let err = h.session.select_file(&fake).unwrap_err();
    assert!(matches!(err, SessionError::NotAPdf { .. }));
    assert!(h.session.selected_file().unwrap().ends_with("report.pdf"));
}

#[tokio::test]
async fn offline_run_is_rejected_before_rasterizing() {
    let vision = ScriptedVision {
        offline: true,
        ..Default::default()
    };
    let mut h = harness_with(2, false, vision);
    let err = h.session.process("q").await.unwrap_err();
    assert!(matches!(err, SessionError::Offline));
    assert_eq!(h.raster_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scratch_is_removed_after_success() {
    let mut h = harness(2);
    h.session.process("q").await.unwrap();
    assert_eq!(h.raster_calls.load(Ordering::SeqCst), 1);
    assert!(!h.scratch().exists());
}

#[tokio::test]
async fn scratch_is_removed_after_rasterizer_failure() {
    let mut h = harness_with(2, true, ScriptedVision::default());
    let err = h.session.process("q").await.unwrap_err();
    assert!(matches!(err, SessionError::RasterizationFailed { .. }));
    assert!(!h.scratch().exists());
    assert!(h.calls().is_empty());
}

#[tokio::test]
async fn stale_scratch_files_are_not_picked_up() {
    let mut h = harness(1);
    std::fs::create_dir_all(h.scratch()).unwrap();
    std::fs::write(h.scratch().join("page-9.jpg"), b"old").unwrap();

    let report = h.session.process("q").await.unwrap();
    assert_eq!(report.total_pages, 1);
    assert!(!h.scratch().exists());
}

#[tokio::test]
async fn cancellation_stops_before_the_next_page() {
    let slot = Arc::new(Mutex::new(None));
    let vision = ScriptedVision {
        cancel_at: Some(2),
        cancel_slot: slot.clone(),
        ..Default::default()
    };
    let mut h = harness_with(4, false, vision);
    *slot.lock().unwrap() = Some(h.session.cancellation_token());

    let report = h.session.process("q").await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.processed_pages(), 2);
    assert_eq!(h.calls().len(), 2, "pages 3 and 4 must not be requested");
    assert_eq!(h.session.history().len(), 1 + 2 * 2);
    assert_eq!(h.session.state(), RunState::Cancelled);
    assert!(!h.scratch().exists());
    assert_eq!(h.recorder.reports.lock().unwrap().len(), 1);
    assert_eq!(*h.recorder.progress.lock().unwrap().last().unwrap(), 100.0);

    // The next run gets a fresh token.
    assert!(!h.session.cancellation_token().is_cancelled());
    let again = h.session.process("q").await.unwrap();
    assert_eq!(again.outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn cancelled_before_start_sends_nothing() {
    let mut h = harness(3);
    h.session.cancellation_token().cancel();

    let report = h.session.process("q").await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.processed_pages(), 0);
    assert!(h.calls().is_empty());
    assert_eq!(h.session.history().len(), 1);
}

#[tokio::test]
async fn cancel_during_the_last_page_does_not_leak_into_the_next_run() {
    let slot = Arc::new(Mutex::new(None));
    let vision = ScriptedVision {
        cancel_at: Some(2),
        cancel_slot: slot.clone(),
        ..Default::default()
    };
    let mut h = harness_with(2, false, vision);
    *slot.lock().unwrap() = Some(h.session.cancellation_token());

    let first = h.session.process("q").await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert_eq!(first.processed_pages(), 2);
    assert!(!h.session.cancellation_token().is_cancelled());

    let second = h.session.process("q").await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Completed);
    assert_eq!(second.processed_pages(), 2);
    assert_eq!(h.calls().len(), 4);
}

#[tokio::test]
async fn cancel_during_a_failed_run_is_cleared() {
    let mut h = harness_with(2, true, ScriptedVision::default());
    h.session.cancellation_token().cancel();

    assert_err!(h.session.process("q").await);
    assert!(!h.session.cancellation_token().is_cancelled());
}

#[tokio::test]
async fn progress_is_anchored_and_finishes_at_100() {
    let mut h = harness(3);
    h.session.process("q").await.unwrap();

    let progress = h.recorder.progress.lock().unwrap().clone();
    assert_eq!(progress.first(), Some(&0.0));
    assert_eq!(progress[1], 10.0);
    assert_eq!(progress[2], 10.0);
    assert!((progress[3] - (10.0 + 80.0 / 3.0)).abs() < 1e-3);
    assert_eq!(progress.last(), Some(&100.0));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn blank_system_prompt_falls_back_to_default() {
    let mut h = harness(1);
    h.session = h.session.with_settings(Config {
        api_key: KEY.into(),
        system_prompt: "  ".into(),
    });
    h.session.process("q").await.unwrap();
    assert_eq!(h.session.history().snapshot()[0].text(), DEFAULT_SYSTEM_PROMPT);
}

#[tokio::test]
async fn second_run_replaces_the_conversation() {
    let mut h = harness(2);
    h.session.process("first").await.unwrap();
    h.session.process("second").await.unwrap();

    let msgs = h.session.history().snapshot();
    assert_eq!(msgs.len(), 5);
    assert!(msgs[1].text().ends_with("second"));
}

// ── Export ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn export_of_empty_history_is_rejected() {
    let h = harness(1);
    let target = h.dir.path().join("out.json");
    let err = h.session.export_history(Some(target.as_path())).await.unwrap_err();
    assert!(matches!(err, SessionError::EmptyHistory));
    assert!(!target.exists());
    assert_eq!(h.recorder.errors(), 1);
}

#[tokio::test]
async fn export_holds_non_system_messages_and_summary() {
    let mut h = harness(3);
    h.session.process("Summarise").await.unwrap();

    let target = h.dir.path().join("exports").join("conv.json");
    let written = h.session.export_history(Some(target.as_path())).await.unwrap();
    assert_eq!(written, target);

    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
    assert_eq!(v["pdfFile"], "report.pdf");
    assert_eq!(v["conversation"].as_array().unwrap().len(), 6);
    assert_eq!(v["summary"]["totalMessages"], 6);
    assert_eq!(v["summary"]["totalPages"], 3);
    assert_eq!(v["summary"]["userPrompt"], "Summarise");
    assert_eq!(v["summary"]["systemPrompt"], "Answer in English.");
    assert!(v["conversation"]
        .as_array()
        .unwrap()
        .iter()
        .all(|m| m["role"] != "system"));
}

#[tokio::test]
async fn cleared_history_cannot_be_exported() {
    let mut h = harness(1);
    h.session.process("q").await.unwrap();
    h.session.clear_history();
    assert!(h.session.history().is_empty());

    let err = h
        .session
        .export_history(Some(h.dir.path().join("x.json").as_path()))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::EmptyHistory));
}

// ── Settings ─────────────────────────────────────────────────────────────────

fn with_store(mut h: Harness) -> (Harness, ConfigStore) {
    let store = ConfigStore::new(h.dir.path().join("cfg").join("config.json"));
    h.session = h.session.with_store(store.clone());
    (h, store)
}

#[tokio::test]
async fn save_config_persists_trimmed_settings() {
    let (mut h, store) = with_store(harness(1));
    h.session
        .save_config(Config {
            api_key: "  sk-or-v1-new  ".into(),
            system_prompt: " Be brief. ".into(),
        })
        .await
        .unwrap();

    let saved = store.load().await;
    assert_eq!(saved.api_key, "sk-or-v1-new");
    assert_eq!(saved.system_prompt, "Be brief.");
    assert_eq!(h.session.settings(), &saved);
}

#[tokio::test]
async fn save_config_rejects_bad_prefix_without_network() {
    let key_checks = Arc::new(AtomicUsize::new(0));
    let vision = ScriptedVision {
        key_checks: key_checks.clone(),
        ..Default::default()
    };
    let (mut h, store) = with_store(harness_with(1, false, vision));

    let err = h
        .session
        .save_config(Config {
            api_key: "sk-ant-123".into(),
            system_prompt: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Vision(VisionError::InvalidCredential { .. })
    ));
    assert_eq!(key_checks.load(Ordering::SeqCst), 0);
    assert!(!store.path().exists());
    assert_eq!(h.session.settings().api_key, KEY);
}

#[tokio::test]
async fn save_config_rejects_key_the_provider_refuses() {
    let vision = ScriptedVision {
        reject_keys: true,
        ..Default::default()
    };
    let (mut h, store) = with_store(harness_with(1, false, vision));

    let result = h
        .session
        .save_config(Config {
            api_key: "sk-or-v1-revoked".into(),
            system_prompt: String::new(),
        })
        .await;
    assert!(result.is_err());
    assert!(!store.path().exists());
}

#[tokio::test]
async fn save_config_offline_skips_the_live_check() {
    let key_checks = Arc::new(AtomicUsize::new(0));
    let vision = ScriptedVision {
        offline: true,
        key_checks: key_checks.clone(),
        ..Default::default()
    };
    let (mut h, store) = with_store(harness_with(1, false, vision));

    h.session
        .save_config(Config {
            api_key: "sk-or-v1-abc".into(),
            system_prompt: String::new(),
        })
        .await
        .unwrap();
    assert_eq!(key_checks.load(Ordering::SeqCst), 0);
    assert_eq!(store.load().await.api_key, "sk-or-v1-abc");
    assert!(h
        .recorder
        .notes
        .lock()
        .unwrap()
        .iter()
        .any(|(l, _)| *l == NotifyLevel::Warning));
}

#[tokio::test]
async fn blank_key_is_saved_without_validation() {
    let key_checks = Arc::new(AtomicUsize::new(0));
    let vision = ScriptedVision {
        key_checks: key_checks.clone(),
        ..Default::default()
    };
    let (mut h, store) = with_store(harness_with(1, false, vision));

    h.session
        .save_config(Config {
            api_key: String::new(),
            system_prompt: "Only a prompt".into(),
        })
        .await
        .unwrap();
    assert_eq!(key_checks.load(Ordering::SeqCst), 0);
    assert_eq!(store.load().await.system_prompt, "Only a prompt");
}
