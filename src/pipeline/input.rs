//! Input resolution: check a user-supplied path before pdfium sees it.
//!
//! pdfium reports a missing file, a permission problem and a JPEG renamed
//! to `.pdf` with the same opaque load error. Checking up front turns each
//! into its own [`PipelineError`] variant. In-memory documents are spilled
//! to a temp file, since the renderer works from a path.

use crate::error::PipelineError;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// The resolved input, either a caller's file or a spilled buffer.
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a byte buffer; the file is deleted when this is dropped.
    Spilled(NamedTempFile),
}

impl ResolvedInput {
    /// Get the path to the PDF file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Spilled(tmp) => tmp.path(),
        }
    }
}

/// Resolve a local file path, validating existence and PDF magic bytes.
pub fn resolve_local(path: impl AsRef<Path>) -> Result<ResolvedInput, PipelineError> {
    let path = path.as_ref().to_path_buf();

    if !path.exists() {
        return Err(PipelineError::FileNotFound { path });
    }
    if path.is_dir() {
        return Err(PipelineError::NotAPdf {
            path,
            magic: [0; 4],
        });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            let mut magic = [0u8; 4];
            let read = read_prefix(&mut f, &mut magic);
            if read < 4 || &magic != b"%PDF" {
                return Err(PipelineError::NotAPdf { path, magic });
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PipelineError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(PipelineError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Spill an in-memory PDF to a temp file after checking its magic bytes.
pub fn resolve_bytes(bytes: &[u8]) -> Result<ResolvedInput, PipelineError> {
    if bytes.len() < 4 || &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(PipelineError::NotAPdf {
            path: PathBuf::from("<memory>"),
            magic,
        });
    }

    let mut tmp =
        NamedTempFile::new().map_err(|e| PipelineError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| PipelineError::Internal(format!("tempfile write: {e}")))?;
    tmp.flush()
        .map_err(|e| PipelineError::Internal(format!("tempfile flush: {e}")))?;

    debug!(
        "Spilled {} byte PDF to {}",
        bytes.len(),
        tmp.path().display()
    );
    Ok(ResolvedInput::Spilled(tmp))
}

/// Read up to `buf.len()` bytes, tolerating short reads. Returns bytes read.
fn read_prefix(f: &mut impl Read, buf: &mut [u8]) -> usize {
    let mut filled = 0;
    while filled < buf.len() {
        match f.read(&mut buf[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    filled
}
