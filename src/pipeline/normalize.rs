//! Page clean-up: rendered scan → binary image the model reads easily.
//!
//! Scans of handwritten notes carry paper texture, uneven lighting, ruled
//! lines and faint pencil. The model transcribes noticeably better from a
//! clean black-on-white page, so every page passes through the same fixed
//! sequence before inference:
//!
//! ```text
//! grayscale → min/max stretch → median denoise → [local contrast]
//!   → [ruled-line removal] → erosion → adaptive threshold → closing
//! ```
//!
//! Steps in brackets are off by default. Parameters come from
//! [`NormalizeParams`] and are fixed for the whole run, so the same page
//! always normalizes to the same pixels.

use crate::config::{LocalContrast, NormalizeParams};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::{box_filter, gaussian_blur_f32, median_filter};
use imageproc::morphology::{close, dilate};
use thiserror::Error;
use tracing::debug;

/// A page image the normalizer could not process.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct NormalizeError(pub String);

/// Deterministic page clean-up.
///
/// Implementations are CPU-bound and run on the blocking pool. Failures
/// count as a failed attempt and the page is retried.
pub trait PageNormalizer: Send + Sync {
    fn normalize(&self, image: &DynamicImage) -> Result<GrayImage, NormalizeError>;
}

/// The default normalizer, built on `image` and `imageproc`.
#[derive(Debug, Clone, Default)]
pub struct ImageNormalizer {
    params: NormalizeParams,
}

impl ImageNormalizer {
    pub fn new(params: NormalizeParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &NormalizeParams {
        &self.params
    }
}

impl PageNormalizer for ImageNormalizer {
    fn normalize(&self, image: &DynamicImage) -> Result<GrayImage, NormalizeError> {
        let (w, h) = (image.width(), image.height());
        if w == 0 || h == 0 {
            return Err(NormalizeError(format!("empty image ({w}x{h})")));
        }
        let p = &self.params;

        let mut gray = stretch_min_max(&image.to_luma8());

        if p.denoise_radius > 0 {
            gray = median_filter(&gray, p.denoise_radius, p.denoise_radius);
        }

        if let Some(lc) = p.local_contrast {
            gray = equalize_tiles(&gray, lc);
        }

        if p.remove_lines {
            gray = remove_ruled_lines(&gray, p);
        }

        if p.erosion_size > 1 {
            gray = erode_min(&gray, p.erosion_size);
        }

        let mut binary = adaptive_gaussian_threshold(&gray, p.block_size(), p.adaptive_c);

        if p.close_radius > 0 {
            binary = close(&binary, Norm::L1, p.close_radius);
        }

        debug!("Normalized {}x{} page", w, h);
        Ok(binary)
    }
}

/// Linearly map the darkest pixel to 0 and the brightest to 255.
///
/// A flat image has nothing to stretch and is returned unchanged.
pub fn stretch_min_max(img: &GrayImage) -> GrayImage {
    let (lo, hi) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if hi <= lo {
        return img.clone();
    }

    let scale = 255.0 / (hi - lo) as f32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p[0] = ((p[0] - lo) as f32 * scale).round().min(255.0) as u8;
    }
    out
}

/// Grayscale erosion with an `n × n` square window (per-pixel minimum).
///
/// Dark ink is the low value, so this thickens strokes. The window's anchor
/// sits at `n / 2`, which for even `n` leans up and to the left.
pub fn erode_min(img: &GrayImage, n: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let before = n / 2;
    let after = n - 1 - before;

    // Separable: rows, then columns.
    let mut rows = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let x0 = x.saturating_sub(before);
            let x1 = (x + after).min(w - 1);
            let m = (x0..=x1).map(|xx| img.get_pixel(xx, y)[0]).min().unwrap_or(255);
            rows.put_pixel(x, y, Luma([m]));
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let y0 = y.saturating_sub(before);
        let y1 = (y + after).min(h - 1);
        for x in 0..w {
            let m = (y0..=y1).map(|yy| rows.get_pixel(x, yy)[0]).min().unwrap_or(255);
            out.put_pixel(x, y, Luma([m]));
        }
    }
    out
}

/// Gaussian-weighted adaptive threshold.
///
/// A pixel turns white when it is brighter than its Gaussian-weighted
/// neighbourhood mean minus `c`, and black otherwise. `block` sets the
/// Gaussian's sigma the way the classic `ADAPTIVE_THRESH_GAUSSIAN_C`
/// formulation does.
pub fn adaptive_gaussian_threshold(img: &GrayImage, block: u32, c: i32) -> GrayImage {
    let sigma = 0.3 * ((block as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let blurred = gaussian_blur_f32(img, sigma.max(0.5));
    let (w, h) = img.dimensions();

    GrayImage::from_fn(w, h, |x, y| {
        let src = img.get_pixel(x, y)[0] as i32;
        let threshold = blurred.get_pixel(x, y)[0] as i32 - c;
        if src > threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

// ── Local contrast ───────────────────────────────────────────────────────

/// Contrast-limited equalization over a grid of tiles, blended bilinearly
/// between tile centres so tile borders do not show.
pub fn equalize_tiles(img: &GrayImage, lc: LocalContrast) -> GrayImage {
    let (w, h) = img.dimensions();
    let tiles = lc.tiles.max(1);
    let tile_w = w.div_ceil(tiles).max(1);
    let tile_h = h.div_ceil(tiles).max(1);
    // Every tile in this grid covers at least one pixel.
    let tiles_x = w.div_ceil(tile_w);
    let tiles_y = h.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let (x0, y0) = (tx * tile_w, ty * tile_h);
            let (x1, y1) = ((x0 + tile_w).min(w), (y0 + tile_h).min(h));
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y)[0] as usize] += 1;
                }
            }
            luts.push(clipped_lut(hist, (x1 - x0) * (y1 - y0), lc.clip_limit));
        }
    }

    let lut = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    // Position of a pixel in tile-centre coordinates: (lower tile, weight).
    let locate = |v: u32, size: u32, count: u32| -> (u32, u32, f32) {
        let f = ((v as f32 + 0.5) / size as f32 - 0.5).max(0.0);
        let lo = (f.floor() as u32).min(count - 1);
        let hi = (lo + 1).min(count - 1);
        (lo, hi, (f - lo as f32).clamp(0.0, 1.0))
    };

    GrayImage::from_fn(w, h, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;
        let (tx0, tx1, ax) = locate(x, tile_w, tiles_x);
        let (ty0, ty1, ay) = locate(y, tile_h, tiles_y);
        let top = (1.0 - ax) * lut(tx0, ty0)[v] as f32 + ax * lut(tx1, ty0)[v] as f32;
        let bottom = (1.0 - ax) * lut(tx0, ty1)[v] as f32 + ax * lut(tx1, ty1)[v] as f32;
        Luma([((1.0 - ay) * top + ay * bottom).round().clamp(0.0, 255.0) as u8])
    })
}

/// Clip a tile histogram, spread the excess evenly and return the CDF map.
fn clipped_lut(mut hist: [u32; 256], count: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if count == 0 {
        for (i, v) in lut.iter_mut().enumerate() {
            *v = i as u8;
        }
        return lut;
    }

    let limit = ((clip_limit * count as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > limit {
            excess += *bin - limit;
            *bin = limit;
        }
    }
    let share = excess / 256;
    let remainder = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut cdf = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[i] = ((cdf as f32 * 255.0 / count as f32).round()).min(255.0) as u8;
    }
    lut
}

// ── Ruled-line removal ───────────────────────────────────────────────────

/// Find long horizontal ink runs and paint them out.
///
/// Ink is found with a mean adaptive threshold. A horizontal opening keeps
/// only runs at least `width / line_kernel_factor` long, which handwriting
/// rarely produces. The mask is grown by one pixel and each masked column
/// segment is refilled by interpolating between the paper above and below.
pub fn remove_ruled_lines(img: &GrayImage, p: &NormalizeParams) -> GrayImage {
    let (w, h) = img.dimensions();
    let radius = p.block_size() / 2;
    let mean = box_filter(img, radius, radius);

    let ink = GrayImage::from_fn(w, h, |x, y| {
        let src = img.get_pixel(x, y)[0] as i32;
        let threshold = mean.get_pixel(x, y)[0] as i32 - p.adaptive_c;
        if src <= threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    let min_run = (w / p.line_kernel_factor.max(1)).max(1);
    let lines = horizontal_open(&ink, min_run);
    if lines.pixels().all(|px| px[0] == 0) {
        return img.clone();
    }
    let mask = dilate(&lines, Norm::LInf, 1);
    debug!(
        "Removing ruled lines: {} masked pixels",
        mask.pixels().filter(|px| px[0] != 0).count()
    );

    inpaint_columns(img, &mask, p.inpaint_radius.max(1))
}

/// Morphological opening with a `1 × len` horizontal bar: keep exactly the
/// foreground runs of at least `len` pixels.
fn horizontal_open(mask: &GrayImage, len: u32) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let mut x = 0;
        while x < w {
            if mask.get_pixel(x, y)[0] == 0 {
                x += 1;
                continue;
            }
            let start = x;
            while x < w && mask.get_pixel(x, y)[0] != 0 {
                x += 1;
            }
            if x - start >= len {
                for xx in start..x {
                    out.put_pixel(xx, y, Luma([255]));
                }
            }
        }
    }
    out
}

/// Refill masked pixels column by column from up to `radius` unmasked rows
/// on each side of every masked segment.
fn inpaint_columns(img: &GrayImage, mask: &GrayImage, radius: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    let mut out = img.clone();
    let masked = |x: u32, y: u32| mask.get_pixel(x, y)[0] != 0;

    let side_mean = |x: u32, rows: std::ops::Range<u32>| -> Option<f32> {
        let (sum, n) = rows
            .filter(|&y| !masked(x, y))
            .fold((0u32, 0u32), |(s, n), y| (s + img.get_pixel(x, y)[0] as u32, n + 1));
        (n > 0).then(|| sum as f32 / n as f32)
    };

    for x in 0..w {
        let mut y = 0;
        while y < h {
            if !masked(x, y) {
                y += 1;
                continue;
            }
            let start = y;
            while y < h && masked(x, y) {
                y += 1;
            }
            let end = y;

            let above = side_mean(x, start.saturating_sub(radius)..start);
            let below = side_mean(x, end..(end + radius).min(h));
            let (a, b) = match (above, below) {
                (Some(a), Some(b)) => (a, b),
                (Some(a), None) => (a, a),
                (None, Some(b)) => (b, b),
                (None, None) => (255.0, 255.0),
            };

            let len = (end - start) as f32;
            for (i, yy) in (start..end).enumerate() {
                let t = (i as f32 + 1.0) / (len + 1.0);
                out.put_pixel(x, yy, Luma([(a + (b - a) * t).round() as u8]));
            }
        }
    }
    out
}
