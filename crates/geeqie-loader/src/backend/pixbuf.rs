//! Shared RGBA pixel buffer written by backends and read by consumers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reference-counted handle to a pixel buffer.
pub type Pixbuf = Arc<PixelBuffer>;

/// Bytes per RGBA pixel.
const CHANNELS: usize = 4;

/// A fixed-size RGBA image that can be filled while it is being displayed.
#[derive(Debug)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    pixels: RwLock<RgbaImage>,
    stereo_cross: AtomicBool,
}

impl PixelBuffer {
    /// Allocate a transparent black buffer.
    pub fn new(width: u32, height: u32) -> Pixbuf {
        Arc::new(Self {
            width,
            height,
            pixels: RwLock::new(RgbaImage::new(width, height)),
            stereo_cross: AtomicBool::new(false),
        })
    }

    /// Wrap a fully decoded image.
    pub fn from_image(image: RgbaImage) -> Pixbuf {
        Arc::new(Self {
            width: image.width(),
            height: image.height(),
            pixels: RwLock::new(image),
            stereo_cross: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, RgbaImage> {
        self.pixels.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RgbaImage> {
        self.pixels.write()
    }

    /// Copy of the current contents.
    pub fn to_image(&self) -> RgbaImage {
        self.pixels.read().clone()
    }

    /// Zero every byte.
    pub fn clear(&self) {
        let mut pixels = self.pixels.write();
        let raw: &mut [u8] = &mut pixels;
        raw.fill(0);
    }

    /// Copy rows `y..y + rows` from `src`, which must have the same width.
    ///
    /// Rows outside either image are ignored.
    pub fn copy_rows(&self, src: &RgbaImage, y: u32, rows: u32) {
        if src.width() != self.width {
            return;
        }
        let end_row = (y + rows).min(self.height).min(src.height());
        if y >= end_row {
            return;
        }

        let stride = self.width as usize * CHANNELS;
        let start = y as usize * stride;
        let end = end_row as usize * stride;

        let mut pixels = self.pixels.write();
        let dst: &mut [u8] = &mut pixels;
        dst[start..end].copy_from_slice(&src.as_raw()[start..end]);
    }

    /// Mark the buffer as a cross-eyed stereo pair.
    pub fn set_stereo_cross(&self, stereo: bool) {
        self.stereo_cross.store(stereo, Ordering::Release);
    }

    pub fn is_stereo_cross(&self) -> bool {
        self.stereo_cross.load(Ordering::Acquire)
    }
}
