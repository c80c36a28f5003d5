//! Core types shared by the loader, its backends and its consumers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for image loading operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// I/O error while opening or mapping the source.
    #[error("I/O error: {0}")]
    Io(String),

    /// The source could not be prepared for loading.
    #[error("Could not prepare image source: {0}")]
    Source(String),

    /// The file format is not recognized or supported.
    #[error("Invalid or unsupported image format")]
    InvalidFormat,

    /// The image file is corrupted or incomplete.
    #[error("Corrupted or incomplete image file: {0}")]
    CorruptedFile(String),

    /// No embedded preview found in the file.
    #[error("No embedded thumbnail found")]
    NoThumbnail,

    /// EXIF parsing error.
    #[error("EXIF error: {0}")]
    Exif(String),

    /// The backend could not make sense of the data it was fed.
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// No decoder could be found for the data.
    #[error("Unknown image format")]
    UnknownFormat,

    /// More bytes were consumed than the source holds.
    #[error("Read past end of data ({read} of {total} bytes)")]
    Overrun { read: usize, total: usize },

    /// The backend finished without producing any pixels.
    #[error("Loader produced no image")]
    NoPixbuf,

    /// The external preview command failed.
    #[error("External preview command failed: {0}")]
    External(String),

    /// `start` or `start_idle` was called on a session that already ran.
    #[error("Loader already started")]
    AlreadyStarted,

    /// The session was torn down before it reached a terminal state.
    #[error("Loading was cancelled")]
    Cancelled,
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        LoadError::Io(err.to_string())
    }
}

/// A rectangular area of the pixel buffer, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Number of pixels covered.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }
}

/// Dispatch priority on the consumer context.
///
/// Lower values are more urgent, matching the usual main loop convention.
pub use glib::Priority;

/// Whether a loader at `priority` yields to high priority loaders.
#[inline]
pub fn is_background(priority: Priority) -> bool {
    priority > Priority::DEFAULT_IDLE
}

/// Classification of a file made before loading starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FormatClass {
    #[default]
    Unknown,
    Image,
    RawImage,
    Meta,
    Video,
    Collection,
    Document,
}

/// The file a loader session reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    pub path: PathBuf,
    pub format_class: FormatClass,
    /// Page to render for multi-page formats.
    pub page_num: u32,
}

impl FileItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format_class: FormatClass::Unknown,
            page_num: 0,
        }
    }

    pub fn with_class(mut self, format_class: FormatClass) -> Self {
        self.format_class = format_class;
        self
    }

    pub fn with_page(mut self, page_num: u32) -> Self {
        self.page_num = page_num;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lowercase extension including the leading dot, or an empty string.
    pub fn extension(&self) -> String {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default()
    }

    /// Case-insensitive match against an extension such as `".scr"`.
    pub fn has_extension(&self, ext: &str) -> bool {
        self.extension().eq_ignore_ascii_case(ext)
    }
}

/// Notifications delivered to the consumer context.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderEvent {
    /// Part of the pixel buffer has new content.
    AreaReady(Rect),
    /// The dimensions of the pixel buffer are known.
    Size { width: u32, height: u32 },
    /// Fraction of the source consumed so far.
    Percent(f64),
    /// Loading finished successfully.
    Done,
    /// Loading failed; see [`crate::ImageLoader::error`].
    Error,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    NotStarted,
    Feeding,
    Done,
    Error,
}
