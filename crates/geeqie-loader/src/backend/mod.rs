//! Decoder backends and their selection.
//!
//! A backend receives the source bytes in chunks through [`ImageBackend::write`]
//! and reports progress synchronously through a [`BackendObserver`]:
//! the natural size once the header is parsed, the pixel buffer once it is
//! allocated, and every area of it that received pixels.

mod buffered;
mod external;
mod image_rs;
mod jpeg;
mod pixbuf;
mod registry;
mod select;
mod zxscr;

use std::ops::ControlFlow;
use std::sync::Arc;

use image::RgbaImage;

use crate::types::{LoadError, Rect};

pub use external::{run_select, ExternalBackend};
pub use image_rs::ImageRsBackend;
pub use jpeg::JpegBackend;
pub use pixbuf::{PixelBuffer, Pixbuf};
pub use registry::{BackendFactory, BackendRegistry, BackendRequest};
pub use select::{select_backend, BackendKind};
pub use zxscr::ZxScreenBackend;

/// Callbacks a backend invokes while it decodes.
pub trait BackendObserver: Send + Sync {
    /// New pixels are available in `rect`. `Break` asks the backend to abort.
    fn area_updated(&self, pixbuf: &Pixbuf, rect: Rect) -> ControlFlow<()>;

    /// The natural size is known. A returned size must be applied with
    /// [`ImageBackend::set_size`] before decoding continues.
    fn size_prepared(&self, width: u32, height: u32) -> Option<(u32, u32)>;

    /// The pixel buffer has been allocated.
    fn area_prepared(&self, pixbuf: &Pixbuf);
}

/// Decoder families, used where behavior depends on the format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Jpeg,
    Png,
    Gif,
    Bmp,
    Tiff,
    WebP,
    Dds,
    OpenExr,
    ZxScreen,
    External,
    Other,
}

impl FormatTag {
    /// Whether the decoder can produce a reduced size image directly.
    pub fn supports_shrink(self) -> bool {
        matches!(self, FormatTag::Jpeg)
    }

    pub(crate) fn from_image_format(format: image::ImageFormat) -> Self {
        use image::ImageFormat;
        match format {
            ImageFormat::Jpeg => FormatTag::Jpeg,
            ImageFormat::Png => FormatTag::Png,
            ImageFormat::Gif => FormatTag::Gif,
            ImageFormat::Bmp => FormatTag::Bmp,
            ImageFormat::Tiff => FormatTag::Tiff,
            ImageFormat::WebP => FormatTag::WebP,
            ImageFormat::Dds => FormatTag::Dds,
            ImageFormat::OpenExr => FormatTag::OpenExr,
            _ => FormatTag::Other,
        }
    }
}

/// A decoder fed incrementally by a loader session.
pub trait ImageBackend: Send {
    /// Bind the callbacks. Called once, before the first write.
    fn init(&mut self, observer: Arc<dyn BackendObserver>);

    /// Feed the next chunk. `total` is the full source length.
    fn write(&mut self, chunk: &[u8], total: usize) -> Result<(), LoadError>;

    /// The pixel buffer, once allocated.
    fn pixbuf(&self) -> Option<Pixbuf>;

    /// No more data will come. Last chance to report an error or to
    /// produce the pixel buffer.
    fn close(&mut self) -> Result<(), LoadError>;

    /// Stop decoding as soon as possible.
    fn abort(&mut self);

    fn format_name(&self) -> &str;

    fn mime_types(&self) -> Vec<&'static str>;

    fn format_tag(&self) -> FormatTag;

    fn page_total(&self) -> u32 {
        1
    }

    fn set_page_num(&mut self, _page_num: u32) {}

    /// Decode to `width x height` instead of the natural size.
    fn set_size(&mut self, _width: u32, _height: u32) {}
}

/// Rows copied into the pixel buffer per area update.
pub(crate) const BAND_ROWS: u32 = 16;

/// Copy `image` into `pixbuf` in horizontal bands, reporting each one.
///
/// Stops early if the observer asks for an abort.
pub(crate) fn publish_bands(
    observer: &dyn BackendObserver,
    pixbuf: &Pixbuf,
    image: &RgbaImage,
) -> ControlFlow<()> {
    let height = image.height().min(pixbuf.height());
    let mut y = 0;
    while y < height {
        let rows = BAND_ROWS.min(height - y);
        pixbuf.copy_rows(image, y, rows);
        let flow = observer.area_updated(pixbuf, Rect::new(0, y, pixbuf.width(), rows));
        if flow.is_break() {
            return flow;
        }
        y += rows;
    }
    ControlFlow::Continue(())
}
