//! ZX Spectrum screen dumps (`.scr`).
//!
//! A dump is the raw contents of the Spectrum's video memory: a 6144 byte
//! bitmap in the machine's interleaved row order, optionally followed by
//! 768 bytes of colour attributes, one per 8x8 cell.

use std::sync::Arc;

use image::{Rgba, RgbaImage};
use tracing::trace;

use super::{publish_bands, BackendObserver, FormatTag, ImageBackend, PixelBuffer, Pixbuf};
use crate::scale::{resize, FilterType};
use crate::types::LoadError;

pub const SCREEN_WIDTH: u32 = 256;
pub const SCREEN_HEIGHT: u32 = 192;

const BITMAP_SIZE: usize = 6144;
const ATTRIBUTES_SIZE: usize = 768;

/// Black ink on white paper, used when the dump has no attributes.
const DEFAULT_ATTRIBUTE: u8 = 0x38;

const BASIC_LEVEL: u8 = 0xD8;
const BRIGHT_LEVEL: u8 = 0xFF;

/// Colour for a 3-bit GRB index.
fn palette(index: u8, bright: bool) -> Rgba<u8> {
    let level = if bright { BRIGHT_LEVEL } else { BASIC_LEVEL };
    let on = |bit: u8| if index & bit != 0 { level } else { 0 };
    Rgba([on(0b010), on(0b100), on(0b001), 255])
}

/// Offset of the first byte of pixel row `y` in the bitmap.
#[inline]
fn row_offset(y: u32) -> usize {
    let y = y as usize;
    ((y & 0xC0) << 5) | ((y & 0x07) << 8) | ((y & 0x38) << 2)
}

/// Render a screen dump. `data` must hold at least the bitmap.
pub fn render_screen(data: &[u8]) -> Result<RgbaImage, LoadError> {
    if data.len() < BITMAP_SIZE {
        return Err(LoadError::CorruptedFile(format!(
            "ZX screen needs {} bytes, got {}",
            BITMAP_SIZE,
            data.len()
        )));
    }
    let attributes = data.get(BITMAP_SIZE..BITMAP_SIZE + ATTRIBUTES_SIZE);

    let mut image = RgbaImage::new(SCREEN_WIDTH, SCREEN_HEIGHT);
    for y in 0..SCREEN_HEIGHT {
        let row = row_offset(y);
        for column in 0..(SCREEN_WIDTH / 8) {
            let bits = data[row + column as usize];
            let cell = (y / 8 * 32 + column) as usize;
            let attribute = attributes.map_or(DEFAULT_ATTRIBUTE, |a| a[cell]);

            let bright = attribute & 0x40 != 0;
            let ink = palette(attribute & 0x07, bright);
            let paper = palette((attribute >> 3) & 0x07, bright);

            for bit in 0..8 {
                let set = bits & (0x80 >> bit) != 0;
                image.put_pixel(column * 8 + bit, y, if set { ink } else { paper });
            }
        }
    }
    Ok(image)
}

/// Backend for ZX Spectrum screen dumps.
pub struct ZxScreenBackend {
    data: Vec<u8>,
    observer: Option<Arc<dyn BackendObserver>>,
    pixbuf: Option<Pixbuf>,
    target: Option<(u32, u32)>,
    done: bool,
    aborted: bool,
}

impl ZxScreenBackend {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(BITMAP_SIZE + ATTRIBUTES_SIZE),
            observer: None,
            pixbuf: None,
            target: None,
            done: false,
            aborted: false,
        }
    }

    fn render(&mut self) -> Result<(), LoadError> {
        self.done = true;
        let Some(observer) = self.observer.clone() else {
            return Err(LoadError::Decode("Backend used before init".to_string()));
        };
        let mut image = render_screen(&self.data)?;

        if let Some((w, h)) = observer.size_prepared(SCREEN_WIDTH, SCREEN_HEIGHT) {
            self.set_size(w, h);
        }
        if let Some((w, h)) = self.target {
            image = resize(image, w, h, FilterType::Nearest);
        }

        let pixbuf = PixelBuffer::new(image.width(), image.height());
        self.pixbuf = Some(Arc::clone(&pixbuf));
        observer.area_prepared(&pixbuf);
        if publish_bands(observer.as_ref(), &pixbuf, &image).is_break() {
            trace!("Area update asked for abort");
            self.abort();
        }
        Ok(())
    }
}

impl Default for ZxScreenBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBackend for ZxScreenBackend {
    fn init(&mut self, observer: Arc<dyn BackendObserver>) {
        self.observer = Some(observer);
    }

    fn write(&mut self, chunk: &[u8], total: usize) -> Result<(), LoadError> {
        if self.done {
            return Ok(());
        }
        self.data.extend_from_slice(chunk);
        if self.data.len() >= total {
            self.render()?;
        }
        Ok(())
    }

    fn pixbuf(&self) -> Option<Pixbuf> {
        self.pixbuf.clone()
    }

    fn close(&mut self) -> Result<(), LoadError> {
        if self.done {
            return Ok(());
        }
        self.render()
    }

    fn abort(&mut self) {
        self.done = true;
        self.aborted = true;
        self.data = Vec::new();
    }

    fn format_name(&self) -> &str {
        "zxscr"
    }

    fn mime_types(&self) -> Vec<&'static str> {
        vec!["application/octet-stream"]
    }

    fn format_tag(&self) -> FormatTag {
        FormatTag::ZxScreen
    }

    fn set_size(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.target = Some((width, height));
        }
    }
}
