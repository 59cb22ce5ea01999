//! Sanitising client-supplied names for `Content-Disposition` headers.

use std::path::Path;

const MAX_NAME_LEN: usize = 200;
const FALLBACK_NAME: &str = "audio";

/// Reduce a client-supplied file name to a safe download base name.
///
/// Keeps only the final path component, drops every character outside
/// `[A-Za-z0-9._\- ]`, collapses runs of spaces and caps the length.
/// An empty result becomes `"audio"`.
pub fn safe_download_filename(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let filtered: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect();
    let mut cleaned = filtered.split_whitespace().collect::<Vec<_>>().join(" ");

    if cleaned.is_empty() {
        return FALLBACK_NAME.to_string();
    }
    // ASCII only at this point, so byte truncation is char-safe.
    cleaned.truncate(MAX_NAME_LEN);
    cleaned
}

/// Split an uploaded file name into its base name (without extension) and
/// lower-cased extension including the leading dot.
pub fn split_upload_name(name: &str) -> (String, String) {
    let path = Path::new(name);
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem, ext)
}
