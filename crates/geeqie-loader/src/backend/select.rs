//! Picking a backend from the first bytes of the source.

use crate::types::{FileItem, FormatClass};

/// The decoder family chosen for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    External,
    Video,
    Fits,
    Pdf,
    Heif,
    WebP,
    DjVu,
    OpenExr,
    Jpeg,
    Cr3,
    Tiff,
    Npy,
    Dds,
    Psd,
    Jpeg2000,
    JpegXl,
    ZxScreen,
    Collection,
    Svgz,
    Default,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::External => "external",
            BackendKind::Video => "video",
            BackendKind::Fits => "fits",
            BackendKind::Pdf => "pdf",
            BackendKind::Heif => "heif",
            BackendKind::WebP => "webp",
            BackendKind::DjVu => "djvu",
            BackendKind::OpenExr => "exr",
            BackendKind::Jpeg => "jpeg",
            BackendKind::Cr3 => "cr3",
            BackendKind::Tiff => "tiff",
            BackendKind::Npy => "npy",
            BackendKind::Dds => "dds",
            BackendKind::Psd => "psd",
            BackendKind::Jpeg2000 => "j2k",
            BackendKind::JpegXl => "jpeg xl",
            BackendKind::ZxScreen => "zxscr",
            BackendKind::Collection => "collection",
            BackendKind::Svgz => "svgz",
            BackendKind::Default => "default",
        }
    }
}

/// ZX Spectrum screen dumps: bitmap only, or bitmap plus attributes.
const ZX_SCREEN_SIZES: [usize; 2] = [6144, 6912];

const HEIF_BRANDS: [&[u8; 8]; 5] = [
    b"ftypheic", b"ftypheix", b"ftypmsf1", b"ftypmif1", b"ftypavif",
];

const TIFF_SIGNATURES: [&[u8]; 4] = [
    b"MM\0*",
    b"MM\0+\0\x08\0\0",
    b"II+\0\x08\0\0\0",
    b"II*\0",
];

const JPEG2000_SIGNATURE: &[u8; 12] = b"\0\0\0\x0CjP  \r\n\x87\n";
const JPEGXL_CONTAINER: &[u8; 12] = b"\0\0\0\x0CJXL \r\n\x87\n";

#[inline]
fn has_at(data: &[u8], offset: usize, signature: &[u8]) -> bool {
    data.get(offset..offset + signature.len()) == Some(signature)
}

/// Choose the backend for `data`.
///
/// `external_accepted` is the verdict of the external preview selector,
/// which wins over everything else. A video or collection classification
/// comes next. ZX Spectrum screens have no signature, so their exact size
/// plus the `.scr` extension is checked before any content sniffing.
/// `.svgz` files only count when no signature matched.
pub fn select_backend(data: &[u8], file: &FileItem, external_accepted: bool) -> BackendKind {
    if external_accepted {
        return BackendKind::External;
    }
    match file.format_class {
        FormatClass::Video => return BackendKind::Video,
        FormatClass::Collection => return BackendKind::Collection,
        _ => {}
    }
    if ZX_SCREEN_SIZES.contains(&data.len()) && file.has_extension(".scr") {
        return BackendKind::ZxScreen;
    }

    if let Some(kind) = sniff(data) {
        return kind;
    }

    if file.has_extension(".svgz") {
        BackendKind::Svgz
    } else {
        BackendKind::Default
    }
}

/// Match the content signatures in priority order.
fn sniff(data: &[u8]) -> Option<BackendKind> {
    if has_at(data, 0, b"SIMPLE") {
        return Some(BackendKind::Fits);
    }
    if has_at(data, 0, b"%PDF") {
        return Some(BackendKind::Pdf);
    }
    if HEIF_BRANDS.iter().any(|brand| has_at(data, 4, *brand)) {
        return Some(BackendKind::Heif);
    }
    if data.len() >= 12 && has_at(data, 0, b"RIFF") && has_at(data, 8, b"WEBP") {
        return Some(BackendKind::WebP);
    }
    if data.len() >= 16 && has_at(data, 0, b"AT&TFORM") && has_at(data, 12, b"DJV") {
        return Some(BackendKind::DjVu);
    }
    if has_at(data, 0, b"\x76\x2F\x31\x01") {
        return Some(BackendKind::OpenExr);
    }
    if has_at(data, 0, &[0xFF, 0xD8]) {
        return Some(BackendKind::Jpeg);
    }
    if has_at(data, 4, b"ftypcrx") && has_at(data, 64, b"CanonCR3") {
        return Some(BackendKind::Cr3);
    }
    if data.len() >= 10 && TIFF_SIGNATURES.iter().any(|sig| has_at(data, 0, sig)) {
        return Some(BackendKind::Tiff);
    }
    if has_at(data, 0, b"\x93NUMPY") {
        return Some(BackendKind::Npy);
    }
    if has_at(data, 0, b"DDS") {
        return Some(BackendKind::Dds);
    }
    if has_at(data, 0, b"8BPS\0\x01") {
        return Some(BackendKind::Psd);
    }
    if has_at(data, 0, JPEG2000_SIGNATURE) {
        return Some(BackendKind::Jpeg2000);
    }
    if has_at(data, 0, JPEGXL_CONTAINER) || has_at(data, 0, &[0xFF, 0x0A]) {
        return Some(BackendKind::JpegXl);
    }
    None
}
