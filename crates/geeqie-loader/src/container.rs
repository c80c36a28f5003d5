//! JPEG container inspection.
//!
//! Only walks the marker segments; pixel decoding is left to the backends.

// JPEG magic bytes
pub const JPEG_START: [u8; 2] = [0xFF, 0xD8];
pub const JPEG_END: [u8; 2] = [0xFF, 0xD9];

/// Check if a byte slice starts with JPEG magic bytes.
#[inline]
pub fn is_jpeg_data(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == JPEG_START[0] && data[1] == JPEG_START[1]
}

/// Check that a buffer is a self-contained JPEG stream.
///
/// The stream must open with SOI followed by a marker and contain an EOI
/// marker in its tail. Metadata readers sometimes hand out file sections
/// that only look like previews.
pub fn is_jpeg_container(data: &[u8]) -> bool {
    if data.len() < 4 || !is_jpeg_data(data) || data[2] != 0xFF {
        return false;
    }

    // Trailing padding after EOI is common, allow a little of it.
    let tail_start = data.len().saturating_sub(64).max(2);
    data[tail_start..]
        .windows(2)
        .any(|w| w[0] == JPEG_END[0] && w[1] == JPEG_END[1])
}

/// Read the frame dimensions from a (possibly partial) JPEG stream.
///
/// Returns `None` until enough of the header is available, or if the data
/// is not JPEG.
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if !is_jpeg_data(data) {
        return None;
    }

    let mut pos = 2;
    loop {
        // Skip fill bytes before the marker code
        let segment_start = pos;
        while pos < data.len() && data[pos] == 0xFF {
            pos += 1;
        }
        if pos == segment_start || pos >= data.len() {
            return None;
        }
        let marker = data[pos];
        pos += 1;

        match marker {
            // Standalone markers carry no length
            0x01 | 0xD0..=0xD7 => continue,
            0xD9 | 0xDA => return None,
            _ => {}
        }

        let length = read_be_u16(data, pos)? as usize;
        if length < 2 {
            return None;
        }

        if is_sof_marker(marker) {
            let height = read_be_u16(data, pos + 3)? as u32;
            let width = read_be_u16(data, pos + 5)? as u32;
            return Some((width, height));
        }

        pos += length;
    }
}

#[inline]
fn is_sof_marker(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

#[inline]
fn read_be_u16(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
