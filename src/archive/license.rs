//! Decides whether an item's license allows keeping it.

use crate::archive::client::MetadataRecord;

/// Substring that marks a permissive license URL.
pub const PERMISSIVE_LICENSE_MARKER: &str = "creativecommons";

/// Metadata field carrying the license URL.
pub const LICENSE_FIELD: &str = "licenseurl";

/// True only if the record carries a license URL containing [PERMISSIVE_LICENSE_MARKER],
/// compared case-insensitively.
///
/// Used by both the download pipeline and the search scan.
pub fn permits(metadata: &MetadataRecord) -> bool {
    metadata
        .text(LICENSE_FIELD)
        .map(|url| url.to_lowercase().contains(PERMISSIVE_LICENSE_MARKER))
        .unwrap_or(false)
}
