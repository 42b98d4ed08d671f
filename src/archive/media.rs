//! Chooses which manifest entries are worth downloading.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::client::FileManifest;

/// Container/index files that never count as media.
const BLOCKED_EXTENSIONS: &[&str] = &[".xml", ".sqlite", ".zip", ".torrent", ".txt", ".jpg"];

const PREFERRED_AUDIO: &str = ".mp3";
const PREFERRED_VIDEO: &str = ".mp4";

const VIDEO_EXTENSIONS: &[&str] = &[
    ".m4v", ".3gp", ".wmv", ".mkv", ".avi", ".flv", ".gif", ".3g2", ".webm", ".gifv", ".mpg",
    ".mp2", ".m2v", ".mpeg", ".mpe", ".mpv", ".amv", ".f4v", ".f4p", ".f4a", ".f4b", ".vob",
    ".mts", ".m2ts", ".ts", ".mov", ".qt", ".yuv", ".rm", ".rmvb", ".svi",
];

const AUDIO_EXTENSIONS: &[&str] = &[
    ".m4a", ".m4b", ".m4p", ".mp3", ".wav", ".rf64", ".webm", ".wv", ".raw", ".ra", ".rm",
    ".wma", ".3gp", ".aac", ".au", ".aiff", ".gsm", ".amr", ".awb", ".msv", ".nmf", ".aa",
    ".flac", ".aax", ".act", ".alac", ".mmf", ".opus", ".dfv", ".ape", ".dss", ".ogg", ".oga",
    ".mogg", ".8svx", ".voc", ".vox", ".sln", ".tta", ".cda", ".iklax", ".ivs",
];

/// Which kinds of media a run keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MediaPreference {
    Audio,
    Movies,
    #[default]
    Both,
}

impl MediaPreference {
    pub fn wants_audio(self) -> bool {
        matches!(self, MediaPreference::Audio | MediaPreference::Both)
    }

    pub fn wants_video(self) -> bool {
        matches!(self, MediaPreference::Movies | MediaPreference::Both)
    }
}

impl fmt::Display for MediaPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaPreference::Audio => write!(f, "audio"),
            MediaPreference::Movies => write!(f, "movies"),
            MediaPreference::Both => write!(f, "both"),
        }
    }
}

impl FromStr for MediaPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "audio" => Ok(MediaPreference::Audio),
            "movies" => Ok(MediaPreference::Movies),
            "both" => Ok(MediaPreference::Both),
            other => Err(format!("unknown media type '{}' (expected audio, movies or both)", other)),
        }
    }
}

/// Why no media could be selected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionError {
    #[error("manifest has no content files")]
    NoManifestContent,

    #[error("manifest has no eligible media files")]
    NoEligibleMedia,
}

/// Entries ending in the canonical container for the preference (`.mp3` / `.mp4`).
///
/// Runs over whatever manifest it is given; the pipeline calls it on the unfiltered one.
pub fn preferred_matches(manifest: &FileManifest, preference: MediaPreference) -> Vec<String> {
    manifest
        .iter()
        .filter(|entry| {
            let name = entry.lowercase_name();
            (preference.wants_audio() && name.ends_with(PREFERRED_AUDIO))
                || (preference.wants_video() && name.ends_with(PREFERRED_VIDEO))
        })
        .map(|entry| entry.name.clone())
        .collect()
}

/// Full selection: blocklist, preferred pass, then the allow-list fallback.
pub fn select(
    manifest: &FileManifest,
    preference: MediaPreference,
) -> Result<Vec<String>, SelectionError> {
    let content = FileManifest::new(
        manifest
            .iter()
            .filter(|entry| !is_blocked(&entry.lowercase_name()))
            .cloned()
            .collect(),
    );
    if content.is_empty() {
        return Err(SelectionError::NoManifestContent);
    }

    let preferred = preferred_matches(&content, preference);
    if !preferred.is_empty() {
        return Ok(preferred);
    }

    let fallback = fallback_matches(&content, preference);
    if fallback.is_empty() {
        return Err(SelectionError::NoEligibleMedia);
    }
    Ok(fallback)
}

fn is_blocked(lowercase_name: &str) -> bool {
    BLOCKED_EXTENSIONS.iter().any(|ext| lowercase_name.ends_with(ext))
}

/// Walks the allow-lists in order, video first. Each name is kept once, at its first hit.
fn fallback_matches(content: &FileManifest, preference: MediaPreference) -> Vec<String> {
    let mut extensions: Vec<&str> = Vec::new();
    if preference.wants_video() {
        extensions.extend_from_slice(VIDEO_EXTENSIONS);
    }
    if preference.wants_audio() {
        extensions.extend_from_slice(AUDIO_EXTENSIONS);
    }

    let names: Vec<(String, &str)> = content
        .iter()
        .map(|entry| (entry.lowercase_name(), entry.name.as_str()))
        .collect();

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for ext in extensions {
        for (lower, original) in &names {
            if lower.ends_with(ext) && seen.insert(*original) {
                selected.push(original.to_string());
            }
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(names: &[&str]) -> FileManifest {
        FileManifest::from_names(names.iter().copied())
    }

    #[test]
    fn test_preferred_container_short_circuits() {
        let m = manifest(&["x.mp3", "x.flac", "x_meta.xml"]);
        assert_eq!(select(&m, MediaPreference::Audio).unwrap(), vec!["x.mp3"]);
    }

    #[test]
    fn test_fallback_when_no_preferred_container() {
        let m = manifest(&["y.flac", "y_files.xml"]);
        assert_eq!(select(&m, MediaPreference::Audio).unwrap(), vec!["y.flac"]);
    }

    #[test]
    fn test_only_blocked_files_is_no_content() {
        let m = manifest(&["z.jpg", "z.txt"]);
        for preference in [MediaPreference::Audio, MediaPreference::Movies, MediaPreference::Both] {
            assert_eq!(select(&m, preference), Err(SelectionError::NoManifestContent));
        }
    }

    #[test]
    fn test_no_eligible_media() {
        let m = manifest(&["notes.pdf", "cover.png"]);
        assert_eq!(select(&m, MediaPreference::Both), Err(SelectionError::NoEligibleMedia));
    }

    #[test]
    fn test_empty_manifest_is_no_content() {
        assert_eq!(
            select(&FileManifest::default(), MediaPreference::Both),
            Err(SelectionError::NoManifestContent)
        );
    }

    #[test]
    fn test_preference_filters_preferred_pass() {
        let m = manifest(&["talk.mp4", "talk.mp3"]);
        assert_eq!(select(&m, MediaPreference::Movies).unwrap(), vec!["talk.mp4"]);
        assert_eq!(select(&m, MediaPreference::Audio).unwrap(), vec!["talk.mp3"]);
        assert_eq!(select(&m, MediaPreference::Both).unwrap(), vec!["talk.mp4", "talk.mp3"]);
    }

    #[test]
    fn test_audio_preference_ignores_video_fallback() {
        let m = manifest(&["clip.mkv"]);
        assert_eq!(select(&m, MediaPreference::Audio), Err(SelectionError::NoEligibleMedia));
        assert_eq!(select(&m, MediaPreference::Movies).unwrap(), vec!["clip.mkv"]);
    }

    #[test]
    fn test_fallback_follows_allow_list_order_and_dedupes() {
        // .webm sits in both lists; with `both` it must appear once, in the video position.
        let m = manifest(&["b.ogg", "a.WEBM", "c.avi"]);
        assert_eq!(
            select(&m, MediaPreference::Both).unwrap(),
            vec!["c.avi", "a.WEBM", "b.ogg"]
        );
    }

    #[test]
    fn test_preferred_matches_sees_unfiltered_manifest() {
        let m = manifest(&["x_meta.xml", "episode.MP3"]);
        assert_eq!(preferred_matches(&m, MediaPreference::Audio), vec!["episode.MP3"]);
        assert!(preferred_matches(&m, MediaPreference::Movies).is_empty());
    }

    #[test]
    fn test_media_preference_parsing() {
        assert_eq!("Audio".parse::<MediaPreference>(), Ok(MediaPreference::Audio));
        assert_eq!(" movies ".parse::<MediaPreference>(), Ok(MediaPreference::Movies));
        assert!("images".parse::<MediaPreference>().is_err());
    }
}
