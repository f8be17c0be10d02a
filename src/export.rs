//! Conversation export: the non-system history plus a small summary block,
//! written as pretty JSON.

use crate::conversation::{ConversationHistory, ConversationMessage, Role};
use crate::error::SessionError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Totals describing the exported run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub total_pages: usize,
    pub total_messages: usize,
    pub user_prompt: String,
    pub system_prompt: String,
}

/// The exported artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub timestamp: DateTime<Utc>,
    pub pdf_file: String,
    pub conversation: Vec<ConversationMessage>,
    pub summary: ExportSummary,
}

/// Inputs to [`build_export`] that do not live in the history itself.
#[derive(Debug, Clone, Default)]
pub struct ExportContext<'a> {
    pub pdf_file: &'a str,
    pub total_pages: usize,
    pub user_prompt: &'a str,
    pub system_prompt: &'a str,
}

/// Assemble an export from `history`.
///
/// Fails with [`SessionError::EmptyHistory`] when there is nothing to export.
pub fn build_export(
    history: &ConversationHistory,
    ctx: &ExportContext<'_>,
    timestamp: DateTime<Utc>,
) -> Result<ExportDocument, SessionError> {
    if history.is_empty() {
        return Err(SessionError::EmptyHistory);
    }

    let conversation: Vec<ConversationMessage> = history.non_system().cloned().collect();
    // Prefer the system message that was actually sent.
    let system_prompt = history
        .snapshot()
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.text())
        .unwrap_or_else(|| ctx.system_prompt.to_string());

    Ok(ExportDocument {
        timestamp,
        pdf_file: ctx.pdf_file.to_string(),
        summary: ExportSummary {
            total_pages: ctx.total_pages,
            total_messages: conversation.len(),
            user_prompt: ctx.user_prompt.to_string(),
            system_prompt,
        },
        conversation,
    })
}

/// `pdfchat-conversation-YYYY-MM-DD.json`
pub fn default_file_name(date: NaiveDate) -> String {
    format!("pdfchat-conversation-{}.json", date.format("%Y-%m-%d"))
}

/// Write `doc` to `path` atomically (temp file + rename).
pub async fn write_export(doc: &ExportDocument, path: &Path) -> Result<(), SessionError> {
    let fail = |source| SessionError::ExportFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(fail)?;
    }

    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| SessionError::Internal(format!("serialise export: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await.map_err(fail)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(fail)?;

    info!(
        "Exported {} messages to {}",
        doc.summary.total_messages,
        path.display()
    );
    Ok(())
}
