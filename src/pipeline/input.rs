//! Input validation: make sure the selected path is a readable PDF.
//!
//! Both rasterizers accept any path and report unhelpful diagnostics on
//! garbage input, so the `%PDF` magic bytes are checked up front and the
//! caller gets a meaningful error instead.

use crate::error::SessionError;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Validate a local PDF path: it must exist, be readable and start with `%PDF`.
pub fn validate_pdf(path: impl AsRef<Path>) -> Result<PathBuf, SessionError> {
    let path = path.as_ref().to_path_buf();

    if !path.is_file() {
        return Err(SessionError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            let short = f.read_exact(&mut magic).is_err();
            if short || &magic != b"%PDF" {
                return Err(SessionError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(SessionError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(SessionError::FileNotFound { path });
        }
    }

    debug!("Validated PDF: {}", path.display());
    Ok(path)
}

/// Display name of the source file (last path component).
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Unknown".to_string())
}
