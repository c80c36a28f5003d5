//! JPEG backend with size negotiation from the frame header.

use std::sync::Arc;

use image::ImageFormat;

use super::buffered::BufferedDecode;
use super::{BackendObserver, FormatTag, ImageBackend, Pixbuf};
use crate::container::jpeg_dimensions;
use crate::types::LoadError;

/// Decodes baseline and progressive JPEG.
///
/// The frame size is read from the SOF marker as soon as it arrives, so the
/// loader can ask for a reduced size before any pixel is decoded.
pub struct JpegBackend {
    state: BufferedDecode,
}

impl JpegBackend {
    pub fn new() -> Self {
        Self {
            state: BufferedDecode::new(),
        }
    }
}

impl Default for JpegBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBackend for JpegBackend {
    fn init(&mut self, observer: Arc<dyn BackendObserver>) {
        self.state.init(observer);
    }

    fn write(&mut self, chunk: &[u8], total: usize) -> Result<(), LoadError> {
        let complete = self.state.append(chunk, total);

        if !self.state.size_known() {
            if let Some((width, height)) = jpeg_dimensions(self.state.data()) {
                self.state.prepare(width, height)?;
            }
        }

        if complete {
            self.state.finish(ImageFormat::Jpeg)?;
        }
        Ok(())
    }

    fn pixbuf(&self) -> Option<Pixbuf> {
        self.state.pixbuf()
    }

    fn close(&mut self) -> Result<(), LoadError> {
        self.state.finish(ImageFormat::Jpeg)
    }

    fn abort(&mut self) {
        self.state.abort();
    }

    fn format_name(&self) -> &str {
        "jpeg"
    }

    fn mime_types(&self) -> Vec<&'static str> {
        vec!["image/jpeg"]
    }

    fn format_tag(&self) -> FormatTag {
        FormatTag::Jpeg
    }

    fn set_size(&mut self, width: u32, height: u32) {
        self.state.set_size(width, height);
    }
}
