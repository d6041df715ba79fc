//! Output filename derivation for fetched items.
//!
//! Files are named after the item identifier (unique per source), with the
//! extension taken from the remote URL path. Identifiers pass through
//! sanitization so hostile listing data can never escape the output
//! directory or produce unusable names.

use url::Url;

use crate::listing::ItemDescriptor;

/// Fallback extension when the remote URL carries none.
const DEFAULT_EXTENSION: &str = ".bin";

/// Suffix for in-progress temporary files.
pub(crate) const PART_SUFFIX: &str = ".part";

/// Derives the final output filename for an item.
#[must_use]
pub fn filename_for(item: &ItemDescriptor) -> String {
    let stem = sanitize_component(&item.identifier);
    let stem = if stem.is_empty() {
        "item".to_string()
    } else {
        stem
    };
    let extension =
        extension_from_url(&item.remote_url).unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    format!("{stem}{extension}")
}

/// Lowercased extension (with dot) from the URL's last path segment.
pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 8 {
        return None;
    }
    ext.chars()
        .skip(1)
        .all(|c| c.is_ascii_alphanumeric())
        .then(|| ext.to_lowercase())
}

/// Maps path separators, control characters, and shell-hostile punctuation
/// to underscores, collapsing runs and trimming the ends.
pub(crate) fn sanitize_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\'' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep && !out.is_empty() {
                out.push('_');
            }
            prev_sep = true;
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    // No hidden files, no bare dots
    out.trim_matches(['_', '.']).to_string()
}
