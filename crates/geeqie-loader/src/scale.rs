//! Aspect-preserving size fitting and resampling.

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Filter type for resampling decoded images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterType {
    /// Nearest neighbor interpolation (fastest, lowest quality).
    Nearest,
    /// Bilinear interpolation (fast, acceptable quality).
    #[default]
    Bilinear,
    /// Lanczos3 interpolation (slower, highest quality).
    Lanczos3,
}

impl FilterType {
    /// Convert to the image crate's FilterType.
    pub fn to_image_filter(self) -> image::imageops::FilterType {
        match self {
            FilterType::Nearest => image::imageops::FilterType::Nearest,
            FilterType::Bilinear => image::imageops::FilterType::Triangle,
            FilterType::Lanczos3 => image::imageops::FilterType::Lanczos3,
        }
    }
}

/// Fit `width x height` into the requested box, keeping the aspect ratio.
///
/// The side with the tighter ratio is pinned to the request and the other
/// side follows, truncated and clamped to at least one pixel. The result
/// can be larger than the input if the box is larger.
pub fn fit_within(
    requested_width: u32,
    requested_height: u32,
    width: u32,
    height: u32,
) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (requested_width.max(1), requested_height.max(1));
    }

    let ratio_w = requested_width as f64 / width as f64;
    let ratio_h = requested_height as f64 / height as f64;

    if ratio_w < ratio_h {
        let new_height = (requested_width as f64 / width as f64 * height as f64) as u32;
        (requested_width, new_height.max(1))
    } else {
        let new_width = (requested_height as f64 / height as f64 * width as f64) as u32;
        (new_width.max(1), requested_height)
    }
}

/// Resample `image` to exactly `width x height`.
///
/// Returns the input unchanged when the size already matches.
pub fn resize(image: RgbaImage, width: u32, height: u32, filter: FilterType) -> RgbaImage {
    if image.dimensions() == (width, height) || width == 0 || height == 0 {
        return image;
    }
    image::imageops::resize(&image, width, height, filter.to_image_filter())
}


// ============================================================================
// Property-Based Tests
// ============================================================================
