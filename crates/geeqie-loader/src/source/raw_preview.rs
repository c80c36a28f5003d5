//! Embedded preview extraction for TIFF-based RAW files.
//!
//! Most RAW formats (ARW, CR2, NEF, DNG, PEF, ...) are TIFF containers that
//! carry one or more full JPEG renditions next to the sensor data. The
//! previews live in SubIFDs, in IFD1 (the classic EXIF thumbnail) or are
//! referenced directly from IFD0. The largest candidate wins.

use tracing::trace;

use crate::container::{is_jpeg_data, JPEG_END, JPEG_START};
use crate::types::{FileItem, FormatClass, LoadError};

// TIFF constants
const TIFF_MAGIC_LE: [u8; 4] = [0x49, 0x49, 0x2A, 0x00]; // II + 42
const TIFF_MAGIC_BE: [u8; 4] = [0x4D, 0x4D, 0x00, 0x2A]; // MM + 42

// TIFF tag IDs
const TAG_STRIP_OFFSETS: u16 = 0x0111;
const TAG_STRIP_BYTE_COUNTS: u16 = 0x0117;
const TAG_JPEG_OFFSET: u16 = 0x0201; // JpegInterchangeFormat
const TAG_JPEG_LENGTH: u16 = 0x0202; // JpegInterchangeFormatLength
const TAG_SUBIFD: u16 = 0x014A; // SubIFDs
const TAG_COMPRESSION: u16 = 0x0103;

// JPEG compression type
const COMPRESSION_JPEG: u16 = 6;
const COMPRESSION_JPEG_OLD: u16 = 7;

// TIFF field type for 32-bit offsets
const TYPE_LONG: u16 = 4;
const TYPE_IFD: u16 = 13;

/// Upper bound on IFD entries; anything larger is garbage.
const MAX_IFD_ENTRIES: u16 = 1000;

/// Upper bound on SubIFDs followed per file.
const MAX_SUBIFDS: u32 = 16;

/// Smallest marker-scanned JPEG accepted as a preview.
const MIN_SCANNED_PREVIEW: usize = 50_000;

/// Offset before which the marker scan does not look (TIFF structure).
const SCAN_START: usize = 8192;

/// Extensions handled by the RAW preview path regardless of classification.
const RAW_EXTENSIONS: &[&str] = &[
    ".arw", ".cr2", ".dng", ".erf", ".k25", ".kdc", ".mef", ".mos", ".nef", ".nrw", ".orf",
    ".pef", ".raw", ".rw2", ".sr2", ".srf", ".srw", ".3fr", ".iiq",
];

/// Whether the RAW preview extractor should look at this file.
pub fn is_raw_candidate(file: &FileItem) -> bool {
    file.format_class == FormatClass::RawImage
        || RAW_EXTENSIONS.contains(&file.extension().as_str())
}

/// Check if a byte slice starts with a TIFF header.
pub fn is_tiff_container(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && (bytes[..4] == TIFF_MAGIC_LE || bytes[..4] == TIFF_MAGIC_BE)
}

// IFD entry structure
#[derive(Debug, Clone, Copy)]
struct IfdEntry {
    tag: u16,
    typ: u16,
    count: u32,
    value_offset: u32,
}

/// Bounds-checked reader over an in-memory TIFF structure.
struct TiffReader<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl<'a> TiffReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, LoadError> {
        if bytes.len() < 8 {
            return Err(if bytes.len() >= 4 && is_tiff_container(bytes) {
                LoadError::CorruptedFile("Truncated TIFF header".to_string())
            } else {
                LoadError::InvalidFormat
            });
        }

        let little_endian = if bytes[..4] == TIFF_MAGIC_LE {
            true
        } else if bytes[..4] == TIFF_MAGIC_BE {
            false
        } else {
            return Err(LoadError::InvalidFormat);
        };

        Ok(Self {
            bytes,
            little_endian,
        })
    }

    fn u16_at(&self, pos: usize) -> Result<u16, LoadError> {
        let raw = self
            .bytes
            .get(pos..pos + 2)
            .ok_or_else(|| LoadError::CorruptedFile(format!("Failed to read u16 at {}", pos)))?;
        let buf = [raw[0], raw[1]];
        Ok(if self.little_endian {
            u16::from_le_bytes(buf)
        } else {
            u16::from_be_bytes(buf)
        })
    }

    fn u32_at(&self, pos: usize) -> Result<u32, LoadError> {
        let raw = self
            .bytes
            .get(pos..pos + 4)
            .ok_or_else(|| LoadError::CorruptedFile(format!("Failed to read u32 at {}", pos)))?;
        let buf = [raw[0], raw[1], raw[2], raw[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(buf)
        } else {
            u32::from_be_bytes(buf)
        })
    }

    fn ifd0_offset(&self) -> Result<u32, LoadError> {
        self.u32_at(4)
    }

    /// Parse the IFD at `offset`, returning its entries and the next IFD offset.
    fn parse_ifd(&self, offset: u32) -> Result<(Vec<IfdEntry>, u32), LoadError> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Err(LoadError::CorruptedFile(format!(
                "IFD offset {} past end of file",
                offset
            )));
        }

        let entry_count = self.u16_at(offset)?;
        if entry_count > MAX_IFD_ENTRIES {
            return Err(LoadError::CorruptedFile(
                "Too many IFD entries".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(entry_count as usize);
        let mut pos = offset + 2;
        for _ in 0..entry_count {
            let entry = IfdEntry {
                tag: self.u16_at(pos)?,
                typ: self.u16_at(pos + 2)?,
                count: self.u32_at(pos + 4)?,
                value_offset: self.u32_at(pos + 8)?,
            };
            pos += 12;

            // Skip entries pointing outside the file
            if entry.value_offset as usize > self.bytes.len() {
                continue;
            }
            entries.push(entry);
        }

        let next_ifd = self.u32_at(pos).unwrap_or(0);
        Ok((entries, next_ifd))
    }

    /// Offsets of all SubIFDs referenced from an entry list.
    fn subifd_offsets(&self, entries: &[IfdEntry]) -> Vec<u32> {
        let mut offsets = Vec::new();
        for entry in entries.iter().filter(|e| e.tag == TAG_SUBIFD && e.count > 0) {
            let is_offset_type = entry.typ == TYPE_LONG || entry.typ == TYPE_IFD;
            if entry.count == 1 || !is_offset_type {
                offsets.push(entry.value_offset);
                continue;
            }
            // More than one SubIFD: the value is a pointer to an offset array
            for i in 0..entry.count.min(MAX_SUBIFDS) {
                match self.u32_at(entry.value_offset as usize + 4 * i as usize) {
                    Ok(offset) => offsets.push(offset),
                    Err(_) => break,
                }
            }
        }
        offsets
    }

    /// Safely extract a slice if within bounds and non-empty.
    fn slice(&self, offset: u32, length: u32) -> Option<&'a [u8]> {
        let offset = offset as usize;
        let length = length as usize;
        if length == 0 || offset.checked_add(length)? > self.bytes.len() {
            return None;
        }
        Some(&self.bytes[offset..offset + length])
    }
}

/// Extract the largest embedded JPEG preview from a RAW file.
///
/// # Errors
///
/// - `LoadError::InvalidFormat` - not a TIFF-based container
/// - `LoadError::NoThumbnail` - no embedded preview found
/// - `LoadError::CorruptedFile` - the IFD structure is broken
pub fn extract_raw_preview(bytes: &[u8]) -> Result<Vec<u8>, LoadError> {
    let reader = TiffReader::new(bytes)?;
    let (ifd0, next_ifd) = reader.parse_ifd(reader.ifd0_offset()?)?;

    let mut candidates: Vec<&[u8]> = Vec::new();

    for offset in reader.subifd_offsets(&ifd0) {
        if let Ok((entries, _)) = reader.parse_ifd(offset) {
            candidates.extend(jpeg_in_entries(&reader, &entries));
        }
    }

    // IFD1 holds the standard EXIF thumbnail
    if next_ifd != 0 {
        if let Ok((entries, _)) = reader.parse_ifd(next_ifd) {
            candidates.extend(jpeg_in_entries(&reader, &entries));
        }
    }

    candidates.extend(jpeg_in_entries(&reader, &ifd0));

    if let Some(largest) = candidates.into_iter().max_by_key(|data| data.len()) {
        trace!(len = largest.len(), "Found RAW preview in IFD");
        return Ok(largest.to_vec());
    }

    // Last resort: scan for JPEG markers in the file
    scan_for_jpeg(bytes)
        .map(<[u8]>::to_vec)
        .ok_or(LoadError::NoThumbnail)
}

/// The JPEG referenced by one IFD, if any.
fn jpeg_in_entries<'a>(reader: &TiffReader<'a>, entries: &[IfdEntry]) -> Option<&'a [u8]> {
    let find = |tag: u16| entries.iter().find(|e| e.tag == tag).map(|e| e.value_offset);

    // JPEG interchange format is the common case for previews
    if let (Some(offset), Some(length)) = (find(TAG_JPEG_OFFSET), find(TAG_JPEG_LENGTH)) {
        if let Some(data) = reader.slice(offset, length).filter(|d| is_jpeg_data(d)) {
            return Some(data);
        }
    }

    // Some cameras store the preview as a single JPEG-compressed strip
    let compression = find(TAG_COMPRESSION).map(|c| c as u16);
    if matches!(compression, Some(COMPRESSION_JPEG) | Some(COMPRESSION_JPEG_OLD)) {
        if let (Some(offset), Some(length)) = (find(TAG_STRIP_OFFSETS), find(TAG_STRIP_BYTE_COUNTS))
        {
            return reader.slice(offset, length).filter(|d| is_jpeg_data(d));
        }
    }

    None
}

/// Find an embedded JPEG by its SOI/EOI markers.
///
/// Any end marker far enough past a later start marker is also far enough
/// past the first one, so only the first start marker is considered.
fn scan_for_jpeg(bytes: &[u8]) -> Option<&[u8]> {
    let from = SCAN_START.min(bytes.len());
    let start = from + find_marker(&bytes[from..], JPEG_START)?;

    let end_from = start + (MIN_SCANNED_PREVIEW - 1).max(2);
    let end = end_from + find_marker(bytes.get(end_from..)?, JPEG_END)?;
    Some(&bytes[start..end + 2])
}

fn find_marker(bytes: &[u8], marker: [u8; 2]) -> Option<usize> {
    bytes.windows(2).position(|w| w == marker.as_slice())
}
