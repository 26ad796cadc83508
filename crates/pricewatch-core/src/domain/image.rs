//! Where product images are written.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

const DEFAULT_EXTENSION: &str = ".jpg";

/// Replace every run of characters outside `[A-Za-z0-9_-]` with a single `_`.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// File-system safe name. A lossy sanitization gets `_<8 hex of sha256>` appended,
/// so distinct names that sanitize alike (`фильтр`, `масло`) stay distinct.
pub fn safe_component(raw: &str) -> String {
    let raw = raw.trim();
    let mut safe = sanitize_component(raw);
    if safe != raw {
        let digest = Sha256::digest(raw.as_bytes());
        safe.push('_');
        for b in &digest[..4] {
            let _ = write!(&mut safe, "{b:02x}");
        }
    }
    safe
}

/// Extension of the URL's last path segment (with the dot), `.jpg` when absent.
pub fn image_extension(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext.to_ascii_lowercase())
        }
        _ => DEFAULT_EXTENSION.to_string(),
    }
}

/// `<dir>/<brand>/<part><ext>` with both names made safe by [`safe_component`].
pub fn image_destination(dir: &Path, brand_name: &str, part_number: &str, url: &Url) -> PathBuf {
    dir.join(safe_component(brand_name))
        .join(format!("{}{}", safe_component(part_number), image_extension(url)))
}
