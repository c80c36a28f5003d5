//! Mapping a file into the byte buffer a loader session feeds from.
//!
//! The buffer is either the memory-mapped file itself or a reduced size
//! preview embedded in the file's metadata. Previews are preferred because
//! they are much cheaper to decode.

mod exif_preview;
mod raw_preview;

use std::fs::File;

use memmap2::Mmap;
use tracing::{debug, trace};

use crate::container::is_jpeg_container;
use crate::types::{FileItem, LoadError};

pub use exif_preview::{choose_preview, read_previews, PreviewCandidate};
pub use raw_preview::{extract_raw_preview, is_raw_candidate, is_tiff_container};

/// Where the bytes of a [`SourceBuffer`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewOrigin {
    /// The whole file, memory mapped.
    None,
    /// A preview stored in the EXIF block.
    Exif,
    /// A preview extracted from the RAW container.
    Raw,
}

enum SourceData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// Read-only bytes for one loader session.
pub struct SourceBuffer {
    data: SourceData,
    origin: PreviewOrigin,
}

impl SourceBuffer {
    fn mapped(map: Mmap) -> Self {
        Self {
            data: SourceData::Mapped(map),
            origin: PreviewOrigin::None,
        }
    }

    fn preview(bytes: Vec<u8>, origin: PreviewOrigin) -> Self {
        Self {
            data: SourceData::Owned(bytes),
            origin,
        }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            SourceData::Mapped(map) => &map[..],
            SourceData::Owned(bytes) => bytes.as_slice(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn origin(&self) -> PreviewOrigin {
        self.origin
    }
}

impl std::fmt::Debug for SourceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceBuffer")
            .field("origin", &self.origin)
            .field("len", &self.len())
            .finish()
    }
}

/// How the source mapper should treat embedded previews.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceOptions {
    /// Try a metadata preview bounded by the requested size first.
    pub use_exif_preview: bool,
    pub requested_width: u32,
    pub requested_height: u32,
}

/// Map `file` into a buffer, preferring embedded previews.
///
/// # Errors
///
/// Fails only when the file itself cannot be opened or mapped. Problems
/// with embedded previews fall through to mapping the whole file.
pub fn map_source(file: &FileItem, options: SourceOptions) -> Result<SourceBuffer, LoadError> {
    let handle = File::open(file.path())
        .map_err(|e| LoadError::Io(format!("{}: {}", file.path().display(), e)))?;
    let is_raw = is_raw_candidate(file);

    let mut preview = if options.use_exif_preview {
        exif_preview(
            &handle,
            options.requested_width,
            options.requested_height,
            is_raw,
        )
        .map(|bytes| SourceBuffer::preview(bytes, PreviewOrigin::Exif))
    } else if is_raw {
        raw_preview(&handle).map(|bytes| SourceBuffer::preview(bytes, PreviewOrigin::Raw))
    } else {
        None
    };

    if preview.is_none() {
        // Metadata readers can return sections that are not a JPEG at all
        preview = exif_preview(&handle, 0, 0, is_raw)
            .filter(|bytes| is_jpeg_container(bytes))
            .map(|bytes| SourceBuffer::preview(bytes, PreviewOrigin::Exif));
    }

    if let Some(buffer) = preview {
        debug!(
            path = ?file.path(),
            origin = ?buffer.origin(),
            "Usable reduced size (preview) image loaded"
        );
        return Ok(buffer);
    }

    // SAFETY: the map is read only and lives no longer than the session.
    // Truncating the file underneath a running loader is not supported.
    let map = unsafe { Mmap::map(&handle) }
        .map_err(|e| LoadError::Source(format!("{}: {}", file.path().display(), e)))?;
    Ok(SourceBuffer::mapped(map))
}

fn exif_preview(handle: &File, width: u32, height: u32, is_raw: bool) -> Option<Vec<u8>> {
    match read_previews(handle) {
        Ok(candidates) => choose_preview(candidates, width, height, is_raw).map(|c| c.data),
        Err(e) => {
            trace!(error = %e, "No EXIF preview");
            None
        }
    }
}

fn raw_preview(handle: &File) -> Option<Vec<u8>> {
    // SAFETY: read only, dropped before this function returns.
    let map = unsafe { Mmap::map(handle) }.ok()?;
    match extract_raw_preview(&map) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            trace!(error = %e, "No RAW preview");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::container::tests::jpeg_header;
    use crate::container::JPEG_END;

    fn write_fixture(name: &str, bytes: &[u8]) -> (tempfile::TempDir, FileItem) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        (dir, FileItem::new(path))
    }

    #[test]
    fn test_map_plain_file() {
        let (_dir, file) = write_fixture("plain.png", b"\x89PNG\r\n\x1a\nrest");
        let buffer = map_source(&file, SourceOptions::default()).unwrap();
        assert_eq!(buffer.origin(), PreviewOrigin::None);
        assert_eq!(buffer.as_bytes(), b"\x89PNG\r\n\x1a\nrest");
        assert_eq!(buffer.len(), 12);
    }

    #[test]
    fn test_map_missing_file_is_hard_failure() {
        let file = FileItem::new("/nonexistent/dir/image.jpg");
        let result = map_source(&file, SourceOptions::default());
        assert!(matches!(result, Err(LoadError::Io(_))));
    }

    #[test]
    fn test_map_jpeg_without_exif_uses_whole_file() {
        let mut bytes = jpeg_header(32, 16);
        bytes.extend_from_slice(&JPEG_END);
        let (_dir, file) = write_fixture("photo.jpg", &bytes);

        let options = SourceOptions {
            use_exif_preview: true,
            requested_width: 16,
            requested_height: 16,
        };
        let buffer = map_source(&file, options).unwrap();
        assert_eq!(buffer.origin(), PreviewOrigin::None);
        assert_eq!(buffer.len(), bytes.len());
    }

    #[test]
    fn test_map_raw_file_uses_embedded_preview() {
        // Little-endian TIFF whose IFD0 points at a JPEG
        let mut bytes = vec![0u8; 256];
        bytes[..8].copy_from_slice(&[0x49, 0x49, 0x2A, 0x00, 0x08, 0x00, 0x00, 0x00]);
        bytes[8..10].copy_from_slice(&2u16.to_le_bytes());
        let entries: [(u16, u32); 2] = [(0x0201, 128), (0x0202, 64)];
        for (i, (tag, value)) in entries.iter().enumerate() {
            let pos = 10 + i * 12;
            bytes[pos..pos + 2].copy_from_slice(&tag.to_le_bytes());
            bytes[pos + 2..pos + 4].copy_from_slice(&4u16.to_le_bytes());
            bytes[pos + 4..pos + 8].copy_from_slice(&1u32.to_le_bytes());
            bytes[pos + 8..pos + 12].copy_from_slice(&value.to_le_bytes());
        }
        bytes[128] = 0xFF;
        bytes[129] = 0xD8;
        bytes[190] = 0xFF;
        bytes[191] = 0xD9;

        let (_dir, file) = write_fixture("camera.nef", &bytes);
        let buffer = map_source(&file, SourceOptions::default()).unwrap();
        assert_eq!(buffer.origin(), PreviewOrigin::Raw);
        assert_eq!(buffer.len(), 64);
        assert_eq!(&buffer.as_bytes()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_map_raw_without_preview_falls_back_to_mapping() {
        let (_dir, file) = write_fixture("broken.cr2", b"not a tiff container at all");
        let buffer = map_source(&file, SourceOptions::default()).unwrap();
        assert_eq!(buffer.origin(), PreviewOrigin::None);
        assert_eq!(buffer.len(), 27);
    }
}
