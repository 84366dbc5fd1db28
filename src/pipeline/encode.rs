//! Image encoding: normalized page → base64 PNG wrapped in `ImageData`.
//!
//! Vision APIs take images as base64 data embedded in the JSON body. A
//! binarized page compresses extremely well as PNG and stays lossless;
//! JPEG ringing around pen strokes is exactly the noise normalization
//! removed.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::{DynamicImage, GrayImage};
use std::io::Cursor;
use tracing::debug;

/// Encode a page as a base64 PNG ready for the vision API.
///
/// `detail: "high"` asks tiling models to look at the full-resolution tiles;
/// handwriting loses too much in the single low-detail overview.
pub fn encode_page(img: &GrayImage) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(img)?);
    debug!(
        "Encoded {}x{} page → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );

    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

/// Raw PNG bytes of a grayscale page.
pub fn png_bytes(img: &GrayImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}
