//! Pictures embedded in document packages
//!
//! Pictures are stored raw in the extracted-image namespace under a key
//! derived from their own bytes, so a logo repeated across many documents
//! is kept once.

use std::io::{Cursor, Read};

use tracing::{debug, warn};
use zip::ZipArchive;

use super::error::ParseResult;
use super::traits::ParseContext;
use super::types::ImageResource;
use crate::cache::{digest_bytes, CacheError, CacheKey, Namespace, ProcessingOptions};

/// Key namespace for raw embedded pictures
const EMBEDDED_IMAGE_ID: &str = "embedded_image";
const EMBEDDED_IMAGE_VERSION: &str = "1";
/// Pictures stored per document
const MAX_MEDIA_FILES: usize = 64;
/// Larger pictures are skipped
const MAX_MEDIA_BYTES: u64 = 20 * 1024 * 1024;

/// One picture read out of a package
pub(crate) struct MediaPart {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Pictures found in a package
#[derive(Default)]
pub(crate) struct PackageMedia {
    pub parts: Vec<MediaPart>,
    /// Pictures left out by the count or size limits
    pub skipped: usize,
}

/// Where a package format keeps its pictures. EPUB has no fixed folder.
fn media_prefix(extension: &str) -> Option<&'static str> {
    match extension {
        ".docx" => Some("word/media/"),
        ".pptx" => Some("ppt/media/"),
        ".xlsx" => Some("xl/media/"),
        ".odt" | ".ods" | ".odp" => Some("Pictures/"),
        ".epub" => Some(""),
        _ => None,
    }
}

fn image_mime(name: &str) -> Option<&'static str> {
    mime_guess::from_path(name)
        .first_raw()
        .filter(|mime| mime.starts_with("image/"))
}

/// Read the embedded pictures of a package. Blocking.
pub(crate) fn package_media(extension: &str, bytes: &[u8]) -> ParseResult<PackageMedia> {
    let Some(prefix) = media_prefix(extension) else {
        return Ok(PackageMedia::default());
    };
    let mut pkg = ZipArchive::new(Cursor::new(bytes))?;

    let mut names: Vec<(String, &'static str)> = pkg
        .file_names()
        .filter(|n| n.starts_with(prefix) && !n.ends_with('/'))
        .filter_map(|n| image_mime(n).map(|mime| (n.to_string(), mime)))
        .collect();
    names.sort();

    let mut media = PackageMedia::default();
    for (name, mime) in names {
        if media.parts.len() >= MAX_MEDIA_FILES {
            media.skipped += 1;
            continue;
        }
        let mut buf = Vec::new();
        pkg.by_name(&name)?
            .take(MAX_MEDIA_BYTES + 1)
            .read_to_end(&mut buf)?;
        if buf.is_empty() || buf.len() as u64 > MAX_MEDIA_BYTES {
            media.skipped += 1;
            continue;
        }
        media.parts.push(MediaPart {
            name,
            mime_type: mime.to_string(),
            bytes: buf,
        });
    }
    Ok(media)
}

/// Cache key for the raw bytes of an embedded picture
pub(crate) fn media_key(bytes: &[u8]) -> CacheKey {
    CacheKey::derive(
        &digest_bytes(bytes),
        EMBEDDED_IMAGE_ID,
        EMBEDDED_IMAGE_VERSION,
        "",
        &ProcessingOptions::default(),
    )
}

/// Store pictures in the extracted-image namespace. Returns what was stored
/// and a note for each picture that was not.
pub(crate) async fn store_media(
    ctx: &ParseContext,
    parts: Vec<MediaPart>,
) -> (Vec<ImageResource>, Vec<String>) {
    let mut stored = Vec::with_capacity(parts.len());
    let mut notes = Vec::new();

    for part in parts {
        let key = media_key(&part.bytes);
        match ctx.cache.put(Namespace::ExtractedImage, &key, &part.bytes).await {
            Ok(()) => stored.push(ImageResource {
                name: part.name,
                key: key.to_string(),
                size_bytes: part.bytes.len() as u64,
                mime_type: part.mime_type,
            }),
            Err(CacheError::CapacityExceeded { size, max, .. }) => {
                debug!(image = %part.name, size, max, "Embedded image larger than image cache");
                notes.push(format!("embedded image {} too large to cache", part.name));
            }
            Err(e) => {
                warn!(image = %part.name, error = %e, "Failed to cache embedded image");
                notes.push(format!("embedded image {} not cached", part.name));
            }
        }
    }
    (stored, notes)
}
