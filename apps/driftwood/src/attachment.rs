//! Inline image payloads.
//!
//! Images travel as `data:<mime>;base64,<bytes>` URLs inside an image frame,
//! so a browser peer can drop the content straight into an `<img src>`.

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::ImageFormat;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    pub name: Option<String>,
    /// Declared media type. Sniffed from the bytes when absent, and
    /// `application/octet-stream` when sniffing finds nothing.
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl ImageFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            name: None,
            mime: None,
            bytes,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Reads `path`, declaring the media type its extension implies.
    pub async fn read(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        Ok(Self {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            mime: mime_from_extension(path).map(str::to_string),
            bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("image is empty")]
    Empty,
    #[error("unsupported media type {0}")]
    UnsupportedMime(String),
}

const FALLBACK_MIME: &str = "application/octet-stream";

pub fn to_data_url(file: &ImageFile) -> Result<String, EncodeError> {
    if file.is_empty() {
        return Err(EncodeError::Empty);
    }
    let mime = match file.mime.as_deref() {
        Some(mime) if mime.starts_with("image/") => mime.to_string(),
        Some(mime) => return Err(EncodeError::UnsupportedMime(mime.to_string())),
        None => sniff_mime(&file.bytes).unwrap_or(FALLBACK_MIME).to_string(),
    };
    Ok(format!("data:{mime};base64,{}", STANDARD.encode(&file.bytes)))
}

pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::Ico => Some("image/x-icon"),
        ImageFormat::Tiff => Some("image/tiff"),
        ImageFormat::Avif => Some("image/avif"),
        _ => None,
    }
}

/// Image media type implied by a file extension, case-insensitively.
pub fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" | "jfif" | "pjpeg" | "pjp" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "ico" | "cur" => "image/x-icon",
        "tif" | "tiff" => "image/tiff",
        "avif" => "image/avif",
        "svg" | "svgz" => "image/svg+xml",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "apng" => "image/apng",
        _ => return None,
    };
    Some(mime)
}

/// Media type and decoded length of a data-URL payload, if it is one.
pub fn describe_data_url(content: &str) -> Option<(&str, usize)> {
    let rest = content.strip_prefix("data:")?;
    let (mime, body) = rest.split_once(";base64,")?;
    let padding = body.bytes().rev().take_while(|b| *b == b'=').count();
    Some((mime, (body.len() / 4 * 3).saturating_sub(padding.min(2))))
}
