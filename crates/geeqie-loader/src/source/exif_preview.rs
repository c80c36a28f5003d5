//! Preview images stored in the EXIF metadata of a file.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};

use exif::{In, Reader, Tag};
use tracing::trace;

use crate::container::jpeg_dimensions;
use crate::types::LoadError;

/// An embedded preview together with its pixel size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewCandidate {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl PreviewCandidate {
    fn covers(&self, width: u32, height: u32) -> bool {
        self.width >= width && self.height >= height
    }
}

/// Collect the JPEG previews referenced by the file's EXIF data.
///
/// # Errors
///
/// Returns `LoadError::Exif` if the file has no readable EXIF block, or
/// `LoadError::Io` if the file cannot be rewound.
pub fn read_previews(file: &File) -> Result<Vec<PreviewCandidate>, LoadError> {
    // The handle is shared with other readers; start from the top every time
    let mut handle = file;
    handle.seek(SeekFrom::Start(0))?;
    let mut reader = BufReader::new(handle);
    let exif = Reader::new()
        .read_from_container(&mut reader)
        .map_err(|e| LoadError::Exif(e.to_string()))?;

    let offset = exif
        .get_field(Tag::JPEGInterchangeFormat, In::THUMBNAIL)
        .and_then(|f| f.value.get_uint(0));
    let length = exif
        .get_field(Tag::JPEGInterchangeFormatLength, In::THUMBNAIL)
        .and_then(|f| f.value.get_uint(0));

    let mut candidates = Vec::new();
    if let (Some(offset), Some(length)) = (offset, length) {
        // Offsets are relative to the start of the TIFF structure
        let start = offset as usize;
        let end = start.saturating_add(length as usize);
        if let Some(data) = exif.buf().get(start..end) {
            match jpeg_dimensions(data) {
                Some((width, height)) => candidates.push(PreviewCandidate {
                    width,
                    height,
                    data: data.to_vec(),
                }),
                None => trace!(len = data.len(), "EXIF thumbnail has no readable frame header"),
            }
        }
    }

    Ok(candidates)
}

/// Pick the preview to use for a request.
///
/// With no size bound (`requested_width == 0`) the largest preview is used,
/// but only for RAW files: ordinary images are better served by decoding
/// the image itself. With a bound, the smallest preview covering the
/// requested size is used. RAW files fall back to the largest preview when
/// none covers the request; other files get nothing.
pub fn choose_preview(
    mut candidates: Vec<PreviewCandidate>,
    requested_width: u32,
    requested_height: u32,
    is_raw: bool,
) -> Option<PreviewCandidate> {
    if !is_raw && requested_width == 0 {
        return None;
    }

    candidates.sort_by_key(|c| c.width as u64 * c.height as u64);

    if requested_width == 0 {
        return candidates.pop();
    }

    let covering = candidates
        .iter()
        .position(|c| c.covers(requested_width, requested_height));
    match covering {
        Some(index) => Some(candidates.swap_remove(index)),
        None if is_raw => candidates.pop(),
        None => None,
    }
}
