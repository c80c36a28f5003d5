//! Generic backend built on the `image` crate's format decoders.

use std::io::Cursor;
use std::sync::Arc;

use image::{ImageFormat, ImageReader};

use super::buffered::BufferedDecode;
use super::{BackendObserver, FormatTag, ImageBackend, Pixbuf};
use crate::types::LoadError;

/// Bytes needed before the format is guessed from content.
const GUESS_MIN_BYTES: usize = 16;

/// Decodes anything the `image` crate supports.
///
/// The format comes from a hint given at construction or is guessed from
/// the first bytes.
pub struct ImageRsBackend {
    state: BufferedDecode,
    format: Option<ImageFormat>,
}

impl ImageRsBackend {
    /// Guess the format from content.
    pub fn new() -> Self {
        Self {
            state: BufferedDecode::new(),
            format: None,
        }
    }

    /// Decode as `format` without guessing.
    pub fn with_format(format: ImageFormat) -> Self {
        Self {
            state: BufferedDecode::new(),
            format: Some(format),
        }
    }

    fn detect_format(&mut self, complete: bool) {
        if self.format.is_some() {
            return;
        }
        let data = self.state.data();
        if data.len() >= GUESS_MIN_BYTES || complete {
            self.format = image::guess_format(data).ok();
        }
    }

    fn probe_size(&self) -> Option<(u32, u32)> {
        let format = self.format?;
        ImageReader::with_format(Cursor::new(self.state.data()), format)
            .into_dimensions()
            .ok()
    }
}

impl Default for ImageRsBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBackend for ImageRsBackend {
    fn init(&mut self, observer: Arc<dyn BackendObserver>) {
        self.state.init(observer);
    }

    fn write(&mut self, chunk: &[u8], total: usize) -> Result<(), LoadError> {
        let complete = self.state.append(chunk, total);
        self.detect_format(complete);

        if !self.state.size_known() && !self.state.is_finished() {
            // Headers may be incomplete; try again with the next chunk
            if let Some((width, height)) = self.probe_size() {
                self.state.prepare(width, height)?;
            }
        }

        if complete {
            let format = self.format.ok_or(LoadError::UnknownFormat)?;
            self.state.finish(format)?;
        }
        Ok(())
    }

    fn pixbuf(&self) -> Option<Pixbuf> {
        self.state.pixbuf()
    }

    fn close(&mut self) -> Result<(), LoadError> {
        if self.state.is_finished() {
            return Ok(());
        }
        self.detect_format(true);
        let format = self.format.ok_or(LoadError::UnknownFormat)?;
        self.state.finish(format)
    }

    fn abort(&mut self) {
        self.state.abort();
    }

    fn format_name(&self) -> &str {
        self.format
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("unknown")
    }

    fn mime_types(&self) -> Vec<&'static str> {
        self.format.map(|f| vec![f.to_mime_type()]).unwrap_or_default()
    }

    fn format_tag(&self) -> FormatTag {
        self.format
            .map(FormatTag::from_image_format)
            .unwrap_or(FormatTag::Other)
    }

    fn set_size(&mut self, width: u32, height: u32) {
        self.state.set_size(width, height);
    }
}
