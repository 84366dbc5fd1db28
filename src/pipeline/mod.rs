//! Per-page pipeline stages.
//!
//! Each submodule implements exactly one transformation step. The
//! [`crate::worker`] strings them together for one page; the
//! [`crate::scheduler`] runs many workers at once.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ normalize ──▶ encode ──▶ infer ──▶ validate
//! (path)    (pdfium)   (imageproc)   (base64)   (VLM)     (schema)
//! ```
//!
//! 1. [`input`]: check the path exists, is readable and starts with `%PDF`
//! 2. [`render`]: rasterise every page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`normalize`]: grayscale, denoise, adaptive threshold and clean-up
//!    so pen strokes survive and paper texture does not
//! 4. [`encode`]: PNG-encode and base64-wrap the cleaned image
//! 5. [`infer`]: one vision-model call; the only stage with network I/O
//! 6. [`validate`]: recover and check the JSON record from the reply

pub mod encode;
pub mod infer;
pub mod input;
pub mod normalize;
pub mod render;
pub mod validate;
