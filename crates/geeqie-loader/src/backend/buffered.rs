//! Accumulate-then-decode state shared by the `image` crate backends.
//!
//! The header is probed after every chunk so the size and the pixel buffer
//! are announced early. Pixels are decoded once all bytes have arrived and
//! handed to the observer in bands.

use std::sync::Arc;

use image::{ImageFormat, RgbaImage};
use tracing::trace;

use super::{publish_bands, BackendObserver, PixelBuffer, Pixbuf};
use crate::scale::{resize, FilterType};
use crate::types::LoadError;

pub(crate) struct BufferedDecode {
    data: Vec<u8>,
    total: usize,
    observer: Option<Arc<dyn BackendObserver>>,
    natural: Option<(u32, u32)>,
    target: Option<(u32, u32)>,
    pixbuf: Option<Pixbuf>,
    decoded: bool,
    aborted: bool,
}

impl BufferedDecode {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            total: 0,
            observer: None,
            natural: None,
            target: None,
            pixbuf: None,
            decoded: false,
            aborted: false,
        }
    }

    pub(crate) fn init(&mut self, observer: Arc<dyn BackendObserver>) {
        self.observer = Some(observer);
    }

    fn observer(&self) -> Result<Arc<dyn BackendObserver>, LoadError> {
        self.observer
            .clone()
            .ok_or_else(|| LoadError::Decode("Backend used before init".to_string()))
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn pixbuf(&self) -> Option<Pixbuf> {
        self.pixbuf.clone()
    }

    pub(crate) fn size_known(&self) -> bool {
        self.natural.is_some()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.decoded || self.aborted
    }

    pub(crate) fn abort(&mut self) {
        self.aborted = true;
        self.data = Vec::new();
    }

    pub(crate) fn set_size(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.target = Some((width, height));
        }
    }

    /// Append a chunk. Returns `true` once every byte has arrived.
    pub(crate) fn append(&mut self, chunk: &[u8], total: usize) -> bool {
        if self.is_finished() {
            return false;
        }
        if self.data.capacity() == 0 {
            self.data.reserve_exact(total);
        }
        self.total = total;
        self.data.extend_from_slice(chunk);
        self.data.len() >= self.total
    }

    /// The header has been parsed: announce the size and allocate pixels.
    pub(crate) fn prepare(&mut self, width: u32, height: u32) -> Result<(), LoadError> {
        if self.natural.is_some() {
            return Ok(());
        }
        if width == 0 || height == 0 {
            return Err(LoadError::Decode(format!(
                "Image has no pixels ({}x{})",
                width, height
            )));
        }
        self.natural = Some((width, height));

        let observer = self.observer()?;
        if let Some((w, h)) = observer.size_prepared(width, height) {
            self.set_size(w, h);
        }

        let (w, h) = self.target.unwrap_or((width, height));
        trace!(width, height, w, h, "Allocating pixel buffer");
        let pixbuf = PixelBuffer::new(w, h);
        self.pixbuf = Some(Arc::clone(&pixbuf));
        observer.area_prepared(&pixbuf);
        Ok(())
    }

    /// Decode everything received so far with `format` and publish it.
    pub(crate) fn finish(&mut self, format: ImageFormat) -> Result<(), LoadError> {
        if self.is_finished() {
            return Ok(());
        }
        if self.data.is_empty() {
            return Err(LoadError::Decode("No image data".to_string()));
        }

        let decoded = image::load_from_memory_with_format(&self.data, format)
            .map_err(|e| LoadError::Decode(e.to_string()))?;
        self.decoded = true;
        self.data = Vec::new();

        let image = decoded.into_rgba8();
        self.prepare(image.width(), image.height())?;
        self.publish(image)
    }

    fn publish(&mut self, image: RgbaImage) -> Result<(), LoadError> {
        let observer = self.observer()?;
        let Some(pixbuf) = self.pixbuf.clone() else {
            return Err(LoadError::NoPixbuf);
        };

        let (w, h) = pixbuf.dimensions();
        let image = resize(image, w, h, FilterType::Bilinear);
        if publish_bands(observer.as_ref(), &pixbuf, &image).is_break() {
            trace!("Area update asked for abort");
            self.aborted = true;
        }
        Ok(())
    }
}
