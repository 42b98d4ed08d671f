//! Contract between the fetch pipeline and the remote archive.
//!
//! The pipeline only ever talks to the archive through [ArchiveClient], so the HTTP
//! adapter in [crate::archive::http] and the in-memory fake used by the scenario tests
//! are interchangeable.

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Error types for archive operations
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid response for {identifier}: {message}")]
    InvalidResponse { identifier: String, message: String },

    #[error("{what} is missing for {identifier}")]
    MissingDescriptor { identifier: String, what: &'static str },

    #[error("Rejected file name {0:?}")]
    UnsafeFileName(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl ArchiveError {
    /// True when the archive answered but the requested descriptor does not exist.
    pub fn is_missing_descriptor(&self) -> bool {
        matches!(self, ArchiveError::MissingDescriptor { .. })
    }
}

/// Result type for archive operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// One remote file as listed in an item's manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Everything else the archive reports about the file (`source`, `format`, `size`, ...).
    #[serde(flatten)]
    pub attributes: BTreeMap<String, Value>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// The file name lowercased, used for every suffix comparison.
    pub fn lowercase_name(&self) -> String {
        self.name.to_lowercase()
    }
}

/// The ordered list of files that make up one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileManifest {
    pub files: Vec<FileEntry>,
}

impl FileManifest {
    pub fn new(files: Vec<FileEntry>) -> Self {
        Self { files }
    }

    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            files: names.into_iter().map(FileEntry::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter()
    }
}

/// Descriptive key/value fields of one item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataRecord {
    pub fields: Map<String, Value>,
}

impl MetadataRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds a record from string pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), Value::String(v.into())))
            .collect();
        Self { fields }
    }

    /// Looks a field up, ignoring the case of its name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).or_else(|| {
            self.fields
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, value)| value)
        })
    }

    /// Renders a field as text. List values are joined by a single space.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(value_text)
    }

    pub fn identifier(&self) -> Option<String> {
        self.text("identifier")
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(value_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        other => Some(other.to_string()),
    }
}

/// What happened to a single `fetch_file` call that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The file was downloaded during this call.
    Fetched { bytes: u64 },
    /// A local copy already existed and was left untouched.
    AlreadyPresent,
}

/// Capability the pipeline needs from the remote archive.
///
/// Implementations must be safe to share between workers.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Fetch the file manifest of an item.
    ///
    /// An item that exists but reports no file list yields
    /// [ArchiveError::MissingDescriptor].
    async fn fetch_manifest(&self, identifier: &str) -> ArchiveResult<FileManifest>;

    /// Fetch the metadata record of an item.
    async fn fetch_metadata(&self, identifier: &str) -> ArchiveResult<MetadataRecord>;

    /// Fetch one named file of an item into `dest_dir`.
    ///
    /// Must not re-fetch a file that already exists locally.
    async fn fetch_file(
        &self,
        identifier: &str,
        file_name: &str,
        dest_dir: &Path,
    ) -> ArchiveResult<FetchOutcome>;
}

/// Resolves a remote file name to a path under `dest_dir`.
///
/// Remote names may contain sub-directories, but never parent, root or prefix components.
pub fn local_path(dest_dir: &Path, file_name: &str) -> ArchiveResult<PathBuf> {
    let relative = Path::new(file_name);
    let mut has_normal = false;
    for component in relative.components() {
        match component {
            Component::Normal(_) => has_normal = true,
            Component::CurDir => {}
            _ => return Err(ArchiveError::UnsafeFileName(file_name.to_string())),
        }
    }
    if !has_normal {
        return Err(ArchiveError::UnsafeFileName(file_name.to_string()));
    }
    Ok(dest_dir.join(relative))
}
