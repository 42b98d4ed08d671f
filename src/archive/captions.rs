//! Best-effort retrieval of caption and subtitle files.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::archive::client::{ArchiveClient, FileManifest};

/// Caption suffixes in priority order.
pub const CAPTION_SUFFIXES: &[&str] = &[
    "cc5.txt",
    "cc5.srt",
    "asr.js",
    "asr.srt",
    "align.srt",
    "align.json",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptionError {
    #[error("no caption files in manifest")]
    NotFound,

    #[error("every caption fetch failed")]
    AllFailed,
}

/// Caption files fetched for one item, all sharing `suffix`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionOutcome {
    pub suffix: &'static str,
    pub files: Vec<String>,
}

/// Fetches the captions matching the first suffix that yields a successful download.
///
/// Never fails the item; the caller only logs the result.
pub async fn fetch_captions(
    client: &dyn ArchiveClient,
    identifier: &str,
    manifest: &FileManifest,
    dest_dir: &Path,
) -> Result<CaptionOutcome, CaptionError> {
    let mut matched_any = false;

    for &suffix in CAPTION_SUFFIXES {
        let candidates: Vec<&str> = manifest
            .iter()
            .filter(|entry| entry.lowercase_name().ends_with(suffix))
            .map(|entry| entry.name.as_str())
            .collect();
        if candidates.is_empty() {
            continue;
        }
        matched_any = true;

        let mut fetched = Vec::new();
        for name in candidates {
            match client.fetch_file(identifier, name, dest_dir).await {
                Ok(_) => fetched.push(name.to_string()),
                Err(e) => warn!(file = name, "Caption download failed: {}", e),
            }
        }

        if !fetched.is_empty() {
            debug!(suffix, count = fetched.len(), "Fetched caption files");
            return Ok(CaptionOutcome { suffix, files: fetched });
        }
    }

    if matched_any {
        Err(CaptionError::AllFailed)
    } else {
        Err(CaptionError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::fake_client::FakeArchive;

    use tempfile::tempdir;

    #[tokio::test]
    async fn test_first_matching_suffix_wins() {
        let manifest = FileManifest::from_names([
            "talk.asr.srt",
            "talk.cc5.srt",
            "talk_part2.cc5.srt",
            "talk.mp3",
        ]);
        let archive = FakeArchive::new().with_item("talk", manifest.clone(), Default::default());
        let dir = tempdir().unwrap();

        let outcome = fetch_captions(&archive, "talk", &manifest, dir.path()).await.unwrap();
        assert_eq!(outcome.suffix, "cc5.srt");
        assert_eq!(outcome.files, vec!["talk.cc5.srt", "talk_part2.cc5.srt"]);
        assert!(dir.path().join("talk.cc5.srt").exists());
        assert!(!dir.path().join("talk.asr.srt").exists());
    }

    #[tokio::test]
    async fn test_failed_suffix_falls_through_to_next() {
        let manifest = FileManifest::from_names(["talk.cc5.txt", "talk.align.json"]);
        let archive = FakeArchive::new()
            .with_item("talk", manifest.clone(), Default::default())
            .failing_file("talk", "talk.cc5.txt");
        let dir = tempdir().unwrap();

        let outcome = fetch_captions(&archive, "talk", &manifest, dir.path()).await.unwrap();
        assert_eq!(outcome.suffix, "align.json");
        assert_eq!(outcome.files, vec!["talk.align.json"]);
    }

    #[tokio::test]
    async fn test_no_caption_files() {
        let manifest = FileManifest::from_names(["talk.mp3"]);
        let archive = FakeArchive::new().with_item("talk", manifest.clone(), Default::default());
        let dir = tempdir().unwrap();

        let result = fetch_captions(&archive, "talk", &manifest, dir.path()).await;
        assert_eq!(result, Err(CaptionError::NotFound));
        assert_eq!(archive.file_requests("talk"), 0);
    }

    #[tokio::test]
    async fn test_all_caption_fetches_failing() {
        let manifest = FileManifest::from_names(["talk.asr.js"]);
        let archive = FakeArchive::new()
            .with_item("talk", manifest.clone(), Default::default())
            .failing_file("talk", "talk.asr.js");
        let dir = tempdir().unwrap();

        let result = fetch_captions(&archive, "talk", &manifest, dir.path()).await;
        assert_eq!(result, Err(CaptionError::AllFailed));
    }
}
