//! Maps a sniffed mime type onto the handler that knows how to preview it.

use std::fmt;

/// Raster and vector formats GraphicsMagick can read directly.
pub const IMAGE_MIME_TYPES: &[&str] = &[
    "application/dicom",
    "application/postscript",
    "application/tga",
    "application/x-font-ttf",
    "application/x-tga",
    "application/x-targa",
    "image/bmp",
    "image/gif",
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/svg+xml",
    "image/targa",
    "image/tga",
    "image/tiff",
    "image/vnd.adobe.photoshop",
    "image/webp",
    "image/x-cmu-raster",
    "image/x-gnuplot",
    "image/x-icon",
    "image/x-ms-bmp",
    "image/x-targa",
    "image/x-tga",
    "image/x-xbitmap",
    "image/x-xpixmap",
    "image/x-xwindowdump",
    "image/xcf",
];

/// Documents that go through LibreOffice before rendering.
pub const OFFICE_MIME_TYPES: &[&str] = &[
    "application/CDFV2-corrupt",
    "application/msword",
    "application/rdf+xml",
    "application/vnd.ms-excel",
    "application/vnd.ms-excel.12",
    "application/vnd.ms-powerpoint",
    "application/vnd.ms-powerpoint.12",
    "application/vnd.oasis.opendocument.chart",
    "application/vnd.oasis.opendocument.database",
    "application/vnd.oasis.opendocument.formula",
    "application/vnd.oasis.opendocument.graphics",
    "application/vnd.oasis.opendocument.graphics-template",
    "application/vnd.oasis.opendocument.image",
    "application/vnd.oasis.opendocument.presentation",
    "application/vnd.oasis.opendocument.presentation-template",
    "application/vnd.oasis.opendocument.spreadsheet",
    "application/vnd.oasis.opendocument.spreadsheetml",
    "application/vnd.oasis.opendocument.spreadsheet-template",
    "application/vnd.oasis.opendocument.text",
    "application/vnd.oasis.opendocument.text-master",
    "application/vnd.oasis.opendocument.text-web",
    "application/vnd.openofficeorg.extension",
    "application/vnd.openxmlformats-officedocument.presentationml",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.openxmlformats-officedocument.spreadsheetml",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.wordprocessingml",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/x-mspowerpoint",
    "application/x-pdf",
    "application/x-powerpoint",
    "text/plain",
];

pub const PDF_MIME_TYPE: &str = "application/pdf";
pub const LINK_MIME_TYPE: &str = "text/html";
pub const SVG_MIME_TYPE: &str = "image/svg+xml";

/// Processing variant selected for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Image,
    Office,
    Pdf,
    Link,
    Unsupported,
}

impl ContentKind {
    /// Total mapping from mime type to variant. Matching is exact; callers
    /// strip parameters such as `; charset=utf-8` beforehand.
    pub fn from_mime(mime_type: &str) -> Self {
        if IMAGE_MIME_TYPES.contains(&mime_type) {
            ContentKind::Image
        } else if OFFICE_MIME_TYPES.contains(&mime_type) {
            ContentKind::Office
        } else if mime_type == PDF_MIME_TYPE {
            ContentKind::Pdf
        } else if mime_type == LINK_MIME_TYPE {
            ContentKind::Link
        } else {
            ContentKind::Unsupported
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKind::Image => write!(f, "image"),
            ContentKind::Office => write!(f, "office"),
            ContentKind::Pdf => write!(f, "pdf"),
            ContentKind::Link => write!(f, "link"),
            ContentKind::Unsupported => write!(f, "unsupported"),
        }
    }
}
