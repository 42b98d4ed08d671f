//! Works out which identifiers still need fetching.
//!
//! The done list is the only record of finished items. Nothing here looks at the save
//! directory, so a run never infers completion from whatever happens to be on disk.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum WorkListError {
    #[error("Input missing: {0}")]
    InputMissing(PathBuf),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed record on line {line} of {path}: {source}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub type WorkListResult<T> = Result<T, WorkListError>;

/// How an identifier list is stored, chosen by file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// One identifier per line.
    PlainText,
    /// Gzip-compressed JSON lines, each with an `identifier` field.
    GzipJsonLines,
}

impl ListFormat {
    pub fn for_path(path: &Path) -> Self {
        let is_txt = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("txt"))
            .unwrap_or(false);
        if is_txt {
            ListFormat::PlainText
        } else {
            ListFormat::GzipJsonLines
        }
    }
}

#[derive(Deserialize)]
struct IdentifierRecord {
    identifier: Option<Value>,
}

/// Trims every entry and drops the empty ones.
pub fn normalize<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(|entry| entry.as_ref().trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Every identifier of `all` not in `done`, in the order of `all`.
///
/// Duplicates in `all` are kept.
pub fn resolve<I, S>(all: I, done: &HashSet<String>) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    normalize(all)
        .into_iter()
        .filter(|identifier| !done.contains(identifier))
        .collect()
}

/// Reads the raw identifiers of a list file in either format.
pub fn read_identifiers(path: &Path) -> WorkListResult<Vec<String>> {
    let file = open_input(path)?;
    match ListFormat::for_path(path) {
        ListFormat::PlainText => read_lines(path, BufReader::new(file)),
        ListFormat::GzipJsonLines => {
            read_json_records(path, BufReader::new(MultiGzDecoder::new(file)))
        }
    }
}

/// Reads a done list. `None` means no done list was given.
pub fn read_done_set(path: Option<&Path>) -> WorkListResult<HashSet<String>> {
    let Some(path) = path else {
        return Ok(HashSet::new());
    };
    let file = open_input(path)?;
    let lines = read_lines(path, BufReader::new(file))?;
    Ok(normalize(lines).into_iter().collect())
}

/// Loads both lists and returns what is left to do.
pub fn load_work_list(all_path: &Path, done_path: Option<&Path>) -> WorkListResult<Vec<String>> {
    let all = read_identifiers(all_path)?;
    let done = read_done_set(done_path)?;
    let remaining = resolve(&all, &done);
    info!(
        listed = all.len(),
        done = done.len(),
        remaining = remaining.len(),
        "Resolved work list"
    );
    Ok(remaining)
}

fn open_input(path: &Path) -> WorkListResult<File> {
    File::open(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            WorkListError::InputMissing(path.to_path_buf())
        } else {
            WorkListError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn read_lines(path: &Path, reader: impl BufRead) -> WorkListResult<Vec<String>> {
    reader
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| WorkListError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read_json_records(path: &Path, reader: impl BufRead) -> WorkListResult<Vec<String>> {
    let mut identifiers = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| WorkListError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record: IdentifierRecord =
            serde_json::from_str(&line).map_err(|source| WorkListError::MalformedRecord {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
        match record.identifier {
            Some(Value::String(identifier)) => identifiers.push(identifier),
            Some(Value::Null) | None => debug!(line = index + 1, "Record without identifier"),
            Some(other) => warn!(line = index + 1, "Ignoring non-string identifier {}", other),
        }
    }
    Ok(identifiers)
}

/// Appends finished identifiers to a done list, one per line.
pub struct DoneListWriter {
    path: PathBuf,
    file: File,
}

impl DoneListWriter {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, identifier: &str) -> io::Result<()> {
        writeln!(self.file, "{}", identifier)?;
        self.file.flush()
    }
}
