//! PDF rasterisation: turn every page into an image file in a scratch directory.
//!
//! Two backends implement the [`Rasterizer`] trait:
//!
//! * [`PdftoppmRasterizer`] shells out to poppler's `pdftoppm` once for the
//!   whole document.
//! * [`PdfiumRasterizer`] renders through the pdfium C++ library via
//!   `pdfium-render`. pdfium keeps thread-local state and is not safe to call
//!   from async contexts, so the work runs inside `spawn_blocking`.
//!
//! Both return explicit `(page_number, path)` pairs sorted by page number;
//! nothing downstream ever parses a file name.

use crate::config::{ImageFormat, ProcessingConfig};
use crate::error::SessionError;
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat as EncodeFormat};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One rasterised page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// 1-indexed page number.
    pub page_number: usize,
    pub path: PathBuf,
}

/// Converts a PDF into one image file per page.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// Rasterise `pdf_path` into `out_dir`, which the caller has just
    /// created empty. Returns pages in ascending page order.
    async fn rasterize(&self, pdf_path: &Path, out_dir: &Path)
        -> Result<Vec<PageImage>, SessionError>;
}

/// Which rasterizer backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RasterBackend {
    #[default]
    Pdftoppm,
    Pdfium,
}

impl RasterBackend {
    /// Instantiate the backend with the run's DPI and image format.
    pub fn build(self, config: &ProcessingConfig) -> Box<dyn Rasterizer> {
        match self {
            RasterBackend::Pdftoppm => Box::new(PdftoppmRasterizer::new(config)),
            RasterBackend::Pdfium => Box::new(PdfiumRasterizer::new(config)),
        }
    }
}

// ── Scratch directory ────────────────────────────────────────────────────

/// Disposable directory holding the images of one run.
#[derive(Debug, Clone)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory, emptying it first if it already exists.
    pub async fn prepare(&self) -> std::io::Result<()> {
        self.cleanup().await?;
        tokio::fs::create_dir_all(&self.path).await
    }

    /// Remove the directory and everything in it. An absent directory is fine.
    pub async fn cleanup(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {
                debug!("Removed scratch dir {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ── Output discovery ─────────────────────────────────────────────────────

static PAGE_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^page-0*(\d+)\.(?i:jpe?g|png)$").expect("page file regex is valid")
});

/// Page number encoded in a rasterizer output name such as `page-007.jpg`.
fn page_number_of(file_name: &str) -> Option<usize> {
    PAGE_FILE
        .captures(file_name)
        .and_then(|c| c[1].parse::<usize>().ok())
        .filter(|n| *n >= 1)
}

/// List the page images in `dir`, sorted by page number.
async fn collect_page_images(dir: &Path) -> Result<Vec<PageImage>, SessionError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SessionError::RasterizationFailed {
            detail: format!("cannot read output directory {}: {e}", dir.display()),
        })?;

    let mut pages = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SessionError::RasterizationFailed {
            detail: format!("cannot list output directory: {e}"),
        })?
    {
        let name = entry.file_name();
        if let Some(page_number) = name.to_str().and_then(page_number_of) {
            pages.push(PageImage {
                page_number,
                path: entry.path(),
            });
        }
    }

    pages.sort_by_key(|p| p.page_number);
    Ok(pages)
}

// ── pdftoppm backend ─────────────────────────────────────────────────────

/// Rasterizer backed by poppler's `pdftoppm` command-line tool.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    program: PathBuf,
    dpi: u32,
    format: ImageFormat,
}

impl PdftoppmRasterizer {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            program: PathBuf::from("pdftoppm"),
            dpi: config.dpi,
            format: config.image_format,
        }
    }

    /// Use a specific `pdftoppm` executable instead of searching `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn locate(&self) -> Result<PathBuf, SessionError> {
        which::which(&self.program).map_err(|e| {
            debug!("pdftoppm lookup failed: {e}");
            SessionError::RasterizationUnavailable {
                tool: self.program.display().to_string(),
                hint: "Install poppler-utils (e.g. `sudo apt install poppler-utils` or `brew install poppler`)."
                    .to_string(),
            }
        })
    }

    fn format_flag(&self) -> &'static str {
        match self.format {
            ImageFormat::Jpeg => "-jpeg",
            ImageFormat::Png => "-png",
        }
    }
}

/// Split pdftoppm stderr into warning lines and everything else.
fn diagnostics(stderr: &str) -> (Vec<&str>, Vec<&str>) {
    stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .partition(|l| l.contains("Warning"))
}

#[async_trait]
impl Rasterizer for PdftoppmRasterizer {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    async fn rasterize(
        &self,
        pdf_path: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PageImage>, SessionError> {
        let program = self.locate()?;
        info!(
            "Rasterising {} with pdftoppm at {} DPI",
            pdf_path.display(),
            self.dpi
        );

        let output = tokio::process::Command::new(&program)
            .arg(self.format_flag())
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(pdf_path)
            .arg(out_dir.join("page"))
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SessionError::RasterizationUnavailable {
                        tool: program.display().to_string(),
                        hint: format!("Could not start pdftoppm: {e}"),
                    }
                } else {
                    SessionError::RasterizationFailed {
                        detail: format!("failed to run pdftoppm: {e}"),
                    }
                }
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let (warnings, errors) = diagnostics(&stderr);
        for w in &warnings {
            debug!("pdftoppm: {w}");
        }

        if !output.status.success() {
            let detail = if errors.is_empty() {
                format!("pdftoppm exited with {}", output.status)
            } else {
                format!("pdftoppm exited with {}: {}", output.status, errors.join("; "))
            };
            return Err(SessionError::RasterizationFailed { detail });
        }
        // Poppler reports recoverable syntax errors on pages it still renders.
        if !errors.is_empty() {
            warn!("pdftoppm reported: {}", errors.join("; "));
        }

        let pages = collect_page_images(out_dir).await?;
        if pages.is_empty() {
            return Err(SessionError::RasterizationFailed {
                detail: "no page images were produced; check that the PDF is valid".to_string(),
            });
        }

        info!("pdftoppm produced {} page images", pages.len());
        Ok(pages)
    }
}

// ── pdfium backend ───────────────────────────────────────────────────────

/// Rasterizer backed by the pdfium library.
///
/// The library is looked up in `PDFIUM_LIB_PATH` (or the explicit path given
/// to [`PdfiumRasterizer::with_library`]), then the working directory, then
/// the system library path.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    format: ImageFormat,
    library_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            dpi: config.dpi,
            format: config.image_format,
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
        }
    }

    pub fn with_library(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }
}

fn bind_pdfium(library_path: Option<&Path>) -> Result<Pdfium, SessionError> {
    let bindings = match library_path {
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| SessionError::RasterizationUnavailable {
        tool: "pdfium".to_string(),
        hint: format!(
            "Could not load the pdfium library ({e:?}).\n\
             Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
        ),
    })?;

    Ok(Pdfium::new(bindings))
}

fn render_blocking(
    pdf_path: &Path,
    out_dir: &Path,
    dpi: u32,
    format: ImageFormat,
    library_path: Option<&Path>,
) -> Result<Vec<PageImage>, SessionError> {
    let pdfium = bind_pdfium(library_path)?;

    let document = pdfium
        .load_pdf_from_file(pdf_path, None)
        .map_err(|e| SessionError::RasterizationFailed {
            detail: format!("pdfium could not open {}: {e:?}", pdf_path.display()),
        })?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages", total_pages);

    let scale = dpi as f32 / 72.0;
    let mut results = Vec::with_capacity(total_pages);

    for idx in 0..total_pages {
        let page_number = idx + 1;
        let page = pages
            .get(idx as u16)
            .map_err(|e| SessionError::RasterizationFailed {
                detail: format!("page {page_number}: {e:?}"),
            })?;

        let width = (page.width().value * scale).round() as i32;
        let height = (page.height().value * scale).round() as i32;
        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_maximum_height(height);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|e| SessionError::RasterizationFailed {
                detail: format!("page {page_number}: {e:?}"),
            })?;

        let path = out_dir.join(format!("page-{page_number}.{}", format.extension()));
        let img = bitmap.as_image();
        let saved = match format {
            // JPEG has no alpha channel.
            ImageFormat::Jpeg => {
                DynamicImage::ImageRgb8(img.to_rgb8()).save_with_format(&path, EncodeFormat::Jpeg)
            }
            ImageFormat::Png => img.save_with_format(&path, EncodeFormat::Png),
        };
        saved.map_err(|e| SessionError::RasterizationFailed {
            detail: format!("page {page_number}: could not write {}: {e}", path.display()),
        })?;

        debug!(
            "Rendered page {} → {}x{} px",
            page_number,
            img.width(),
            img.height()
        );
        results.push(PageImage { page_number, path });
    }

    if results.is_empty() {
        return Err(SessionError::RasterizationFailed {
            detail: "the document has no pages".to_string(),
        });
    }

    Ok(results)
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    fn name(&self) -> &str {
        "pdfium"
    }

    async fn rasterize(
        &self,
        pdf_path: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PageImage>, SessionError> {
        let pdf = pdf_path.to_path_buf();
        let out = out_dir.to_path_buf();
        let dpi = self.dpi;
        let format = self.format;
        let library = self.library_path.clone();

        tokio::task::spawn_blocking(move || {
            render_blocking(&pdf, &out, dpi, format, library.as_deref())
        })
        .await
        .map_err(|e| SessionError::Internal(format!("Render task panicked: {}", e)))?
    }
}
