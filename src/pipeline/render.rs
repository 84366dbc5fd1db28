//! PDF rasterisation: render every page to a `DynamicImage` via pdfium.
//!
//! ## Why a trait?
//!
//! The scheduler only needs "path in, page images out". [`PageRenderer`]
//! lets tests feed synthetic pages without a pdfium shared library on the
//! machine, while [`PdfiumRenderer`] is what real runs use.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and is CPU-heavy. The scheduler calls [`PageRenderer::render`] on
//! the blocking pool so Tokio worker threads never stall on it.
//!
//! ## DPI and the pixel cap
//!
//! Pages render at `dpi / 72` scale (PDF user space is 72 units per inch).
//! `max_rendered_pixels` then caps both edges so an A0 scan at 300 DPI
//! cannot allocate a 10,000 × 14,000 bitmap.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming a pdfium library file or its directory.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// Turns a document into page images, one per page, in document order.
///
/// Implementations are blocking and are always driven from
/// `spawn_blocking`. An error here is fatal to the run: no pages are
/// processed.
pub trait PageRenderer: Send + Sync {
    fn render(&self, document: &Path) -> Result<Vec<DynamicImage>, PipelineError>;
}

/// Renders with pdfium at a fixed DPI.
#[derive(Debug, Clone)]
pub struct PdfiumRenderer {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
    library_path: Option<PathBuf>,
}

impl PdfiumRenderer {
    pub fn new(dpi: u32, max_pixels: u32) -> Self {
        Self {
            dpi,
            max_pixels,
            password: None,
            library_path: None,
        }
    }

    /// Renderer settings taken from a run configuration.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            password: config.password.clone(),
            library_path: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Bind to this pdfium library instead of searching for one.
    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    fn render_config(&self) -> PdfRenderConfig {
        PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / 72.0)
            .set_maximum_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32)
    }
}

impl PageRenderer for PdfiumRenderer {
    fn render(&self, pdf_path: &Path) -> Result<Vec<DynamicImage>, PipelineError> {
        let pdfium = bind_pdfium(self.library_path.as_deref())?;
        let password = self.password.as_deref();

        let document = pdfium
            .load_pdf_from_file(pdf_path, password)
            .map_err(|e| classify_load_error(pdf_path, password.is_some(), &e))?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        info!(
            "PDF loaded: {} pages, rendering at {} DPI",
            total_pages, self.dpi
        );

        if total_pages == 0 {
            return Err(PipelineError::EmptyDocument {
                path: pdf_path.to_path_buf(),
            });
        }

        let render_config = self.render_config();
        let mut images = Vec::with_capacity(total_pages);

        for (idx, page) in pages.iter().enumerate() {
            let bitmap = page.render_with_config(&render_config).map_err(|e| {
                PipelineError::RenderFailed {
                    page: idx + 1,
                    detail: format!("{:?}", e),
                }
            })?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                idx + 1,
                image.width(),
                image.height()
            );
            images.push(image);
        }

        Ok(images)
    }
}

/// Bind to pdfium: explicit path, then `PDFIUM_LIB_PATH`, then the working
/// directory, then the system library search path.
pub fn bind_pdfium(explicit: Option<&Path>) -> Result<Pdfium, PipelineError> {
    if let Some(path) = explicit {
        return bind_at(path);
    }

    if let Ok(env_path) = std::env::var(PDFIUM_LIB_PATH_ENV) {
        if !env_path.is_empty() {
            return bind_at(Path::new(&env_path));
        }
    }

    let local = PathBuf::from(Pdfium::pdfium_platform_library_name_at_path("./"));
    let bindings = Pdfium::bind_to_library(&local)
        .or_else(|_| Pdfium::bind_to_system_library())
        .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

/// Bind to a library file, or to the platform-named library inside a directory.
fn bind_at(path: &Path) -> Result<Pdfium, PipelineError> {
    let lib = if path.is_dir() {
        PathBuf::from(Pdfium::pdfium_platform_library_name_at_path(path))
    } else {
        path.to_path_buf()
    };

    debug!("Binding pdfium from {}", lib.display());
    Pdfium::bind_to_library(&lib)
        .map(Pdfium::new)
        .map_err(|e| {
            PipelineError::PdfiumBindingFailed(format!("{}: {:?}", lib.display(), e))
        })
}

/// Map a pdfium load failure onto the matching fatal error.
fn classify_load_error(path: &Path, had_password: bool, err: &PdfiumError) -> PipelineError {
    let detail = format!("{:?}", err);
    if detail.to_ascii_lowercase().contains("password") {
        if had_password {
            PipelineError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail,
        }
    }
}
