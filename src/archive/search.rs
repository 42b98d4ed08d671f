//! Discovery of candidate identifiers.
//!
//! Pages through an archive search, scans the metadata of every hit on a [WorkerPool]
//! and appends each newly found, license-passing identifier to a save file.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::archive::client::{ArchiveClient, ArchiveError, ArchiveResult, MetadataRecord};
use crate::archive::license;
use crate::archive::pool::{PoolError, WorkerPool};
use crate::archive::tui::{SCAN_TEMPLATE, counting_bar};
use crate::archive::worklist::{self, WorkListError};

/// Fields every search term is matched against.
const SEARCH_FIELDS: &[&str] = &["title", "description", "creator", "subject"];

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search request failed on page {page}: {source}")]
    Search {
        page: usize,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    SaveFile(#[from] WorkListError),

    #[error("Failed to append to {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type SearchResult<T> = Result<T, SearchError>;

/// One page of search hits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub identifiers: Vec<String>,
    /// Total hits the archive reports for the query, when it says.
    pub num_found: Option<u64>,
}

/// Paged full-text search over the archive.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Fetches page `page` (1-based) of `rows` hits.
    async fn search_page(&self, query: &str, rows: usize, page: usize) -> ArchiveResult<SearchPage>;
}

/// Settings of one discovery run.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub rows_per_page: usize,
    /// `None` means every hit.
    pub max_results: Option<usize>,
    pub check_license: bool,
    pub workers: usize,
    pub show_progress: bool,
}

/// Counts reported at the end of a discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchSummary {
    pub hits: usize,
    pub scanned: usize,
    pub scan_failures: usize,
    pub accepted: usize,
    pub total_in_file: usize,
}

fn term_clause(terms: &[String]) -> String {
    terms
        .iter()
        .map(|term| {
            let fields: Vec<String> = SEARCH_FIELDS
                .iter()
                .map(|field| format!("{}:({})", field, term))
                .collect();
            format!("({})", fields.join(" OR "))
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Builds the default discovery query from content terms and keyword terms.
///
/// An empty term list drops its clause.
pub fn build_query(content_terms: &[String], keyword_terms: &[String]) -> String {
    let mut clauses = vec!["(mediatype:movies OR mediatype:audio)".to_string()];
    for terms in [content_terms, keyword_terms] {
        if !terms.is_empty() {
            clauses.push(format!("({})", term_clause(terms)));
        }
    }
    clauses.push("(NOT access-restricted-item:TRUE)".to_string());
    clauses.join(" AND ")
}

/// Scans search hits and grows the save file.
pub struct MetadataScanner<C: ?Sized> {
    client: Arc<C>,
    cancel: CancellationToken,
}

impl<C> MetadataScanner<C>
where
    C: ArchiveClient + SearchClient + ?Sized + 'static,
{
    pub fn new(client: Arc<C>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Collects hit identifiers page by page, in search order without duplicates.
    pub async fn collect_hits(&self, options: &SearchOptions) -> SearchResult<Vec<String>> {
        let limit = options.max_results.unwrap_or(usize::MAX);
        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        let mut page = 1;

        while hits.len() < limit && !self.cancel.is_cancelled() {
            let result = self
                .client
                .search_page(&options.query, options.rows_per_page, page)
                .await
                .map_err(|source| SearchError::Search { page, source })?;
            if result.identifiers.is_empty() {
                break;
            }
            debug!(page, hits = result.identifiers.len(), num_found = ?result.num_found, "Search page");
            for identifier in result.identifiers {
                if hits.len() >= limit {
                    break;
                }
                if seen.insert(identifier.clone()) {
                    hits.push(identifier);
                }
            }
            page += 1;
        }

        info!(hits = hits.len(), pages = page - 1, "Search finished");
        Ok(hits)
    }

    /// Searches, scans, and appends every new accepted identifier to `save_file`.
    pub async fn run(&self, options: &SearchOptions, save_file: &Path) -> SearchResult<SearchSummary> {
        let known = read_save_file(save_file)?;
        let hits = self.collect_hits(options).await?;

        let pool = WorkerPool::new("scan", options.workers, self.cancel.clone())?;
        let progress = counting_bar(hits.len() as u64, SCAN_TEMPLATE, options.show_progress);
        let client = self.client.clone();

        let report = pool
            .run(
                hits.clone(),
                move |identifier: String| {
                    let client = client.clone();
                    let span = info_span!("scan", identifier = %identifier);
                    async move {
                        let metadata = client.fetch_metadata(&identifier).await;
                        (identifier, metadata)
                    }
                    .instrument(span)
                },
                |_| progress.inc(1),
            )
            .await?;
        progress.finish_and_clear();

        // Keep search order so the save file is stable between runs.
        let mut scanned: Vec<(String, ArchiveResult<MetadataRecord>)> = report.results;
        let order: HashMap<&str, usize> = hits
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        scanned.sort_by_key(|(id, _)| order.get(id.as_str()).copied().unwrap_or(usize::MAX));

        let mut summary = SearchSummary {
            hits: hits.len(),
            scanned: scanned.len(),
            ..SearchSummary::default()
        };

        let mut accepted = Vec::new();
        let mut in_file = known;
        for (identifier, metadata) in scanned {
            let metadata = match metadata {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(identifier = %identifier, "Metadata scan failed: {}", e);
                    summary.scan_failures += 1;
                    continue;
                }
            };
            if options.check_license && !license::permits(&metadata) {
                continue;
            }
            if in_file.insert(identifier.clone()) {
                accepted.push(identifier);
            }
        }

        append_identifiers(save_file, &accepted)?;
        summary.accepted = accepted.len();
        summary.total_in_file = in_file.len();
        info!(
            hits = summary.hits,
            scanned = summary.scanned,
            accepted = summary.accepted,
            total = summary.total_in_file,
            "Scan finished"
        );
        Ok(summary)
    }
}

/// Identifiers already in the save file; a missing file is empty.
fn read_save_file(path: &Path) -> SearchResult<HashSet<String>> {
    match worklist::read_done_set(Some(path)) {
        Ok(known) => Ok(known),
        Err(WorkListError::InputMissing(_)) => {
            info!("Save file {} does not exist yet, starting empty", path.display());
            Ok(HashSet::new())
        }
        Err(e) => Err(e.into()),
    }
}

fn append_identifiers(path: &Path, identifiers: &[String]) -> SearchResult<()> {
    if identifiers.is_empty() {
        return Ok(());
    }
    let append_err = |source| SearchError::Append {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(append_err)?;
    for identifier in identifiers {
        writeln!(file, "{}", identifier).map_err(append_err)?;
    }
    file.flush().map_err(append_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::tempdir;

    use crate::archive::client::{FetchOutcome, FileManifest};

    /// Serves fixed search pages and per-identifier metadata.
    struct FakeSearch {
        pages: Vec<Vec<&'static str>>,
        licenses: Vec<(&'static str, &'static str)>,
        broken: Vec<&'static str>,
        requested_pages: Mutex<Vec<usize>>,
    }

    impl FakeSearch {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                licenses: Vec::new(),
                broken: Vec::new(),
                requested_pages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SearchClient for FakeSearch {
        async fn search_page(&self, _query: &str, _rows: usize, page: usize) -> ArchiveResult<SearchPage> {
            self.requested_pages.lock().push(page);
            let identifiers = self
                .pages
                .get(page - 1)
                .map(|ids| ids.iter().map(|id| id.to_string()).collect())
                .unwrap_or_default();
            Ok(SearchPage {
                identifiers,
                num_found: None,
            })
        }
    }

    #[async_trait]
    impl ArchiveClient for FakeSearch {
        async fn fetch_manifest(&self, _identifier: &str) -> ArchiveResult<FileManifest> {
            Ok(FileManifest::default())
        }

        async fn fetch_metadata(&self, identifier: &str) -> ArchiveResult<MetadataRecord> {
            if self.broken.iter().any(|id| *id == identifier) {
                return Err(ArchiveError::InvalidResponse {
                    identifier: identifier.to_string(),
                    message: "HTTP error: 502 Bad Gateway".to_string(),
                });
            }
            let license = self
                .licenses
                .iter()
                .find(|(id, _)| *id == identifier)
                .map(|(_, url)| *url)
                .unwrap_or("https://creativecommons.org/publicdomain/zero/1.0/");
            Ok(serde_json::from_value(json!({ "identifier": identifier, "licenseurl": license }))
                .unwrap())
        }

        async fn fetch_file(
            &self,
            _identifier: &str,
            _file_name: &str,
            _dest_dir: &Path,
        ) -> ArchiveResult<FetchOutcome> {
            Ok(FetchOutcome::AlreadyPresent)
        }
    }

    fn options() -> SearchOptions {
        SearchOptions {
            query: "q".to_string(),
            rows_per_page: 2,
            max_results: None,
            check_license: true,
            workers: 3,
            show_progress: false,
        }
    }

    #[test]
    fn test_build_query_expands_terms_over_fields() {
        let query = build_query(&["podcast".to_string()], &["a b".to_string(), "c".to_string()]);
        assert_eq!(
            query,
            "(mediatype:movies OR mediatype:audio) AND \
             ((title:(podcast) OR description:(podcast) OR creator:(podcast) OR subject:(podcast))) AND \
             ((title:(a b) OR description:(a b) OR creator:(a b) OR subject:(a b)) OR \
             (title:(c) OR description:(c) OR creator:(c) OR subject:(c))) AND \
             (NOT access-restricted-item:TRUE)"
        );
    }

    #[test]
    fn test_build_query_without_keywords() {
        let query = build_query(&["talk".to_string()], &[]);
        assert!(query.starts_with("(mediatype:movies OR mediatype:audio) AND ((title:(talk)"));
        assert_eq!(query.matches(" AND ").count(), 2);
    }

    #[tokio::test]
    async fn test_collect_hits_pages_until_empty_and_dedupes() {
        let client = Arc::new(FakeSearch::new(vec![vec!["a", "b"], vec!["b", "c"]]));
        let scanner = MetadataScanner::new(client.clone(), CancellationToken::new());

        let hits = scanner.collect_hits(&options()).await.unwrap();
        assert_eq!(hits, vec!["a", "b", "c"]);
        assert_eq!(*client.requested_pages.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_collect_hits_respects_max_results() {
        let client = Arc::new(FakeSearch::new(vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]));
        let scanner = MetadataScanner::new(client.clone(), CancellationToken::new());

        let mut opts = options();
        opts.max_results = Some(3);
        let hits = scanner.collect_hits(&opts).await.unwrap();
        assert_eq!(hits, vec!["a", "b", "c"]);
        assert_eq!(*client.requested_pages.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_appends_only_new_permissive_identifiers() {
        let dir = tempdir().unwrap();
        let save = dir.path().join("ids.txt");
        fs::write(&save, "b\n").unwrap();

        let mut fake = FakeSearch::new(vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
        fake.licenses = vec![("c", "https://example.com/allrights")];
        fake.broken = vec!["d"];
        let scanner = MetadataScanner::new(Arc::new(fake), CancellationToken::new());

        let summary = scanner.run(&options(), &save).await.unwrap();
        assert_eq!(
            summary,
            SearchSummary {
                hits: 5,
                scanned: 5,
                scan_failures: 1,
                accepted: 2,
                total_in_file: 3,
            }
        );
        assert_eq!(fs::read_to_string(&save).unwrap(), "b\na\ne\n");

        // A second run finds nothing new.
        let again = scanner.run(&options(), &save).await.unwrap();
        assert_eq!(again.accepted, 0);
        assert_eq!(fs::read_to_string(&save).unwrap(), "b\na\ne\n");
    }

    #[tokio::test]
    async fn test_run_without_license_check_keeps_restricted_items() {
        let dir = tempdir().unwrap();
        let save = dir.path().join("new.txt");

        let mut fake = FakeSearch::new(vec![vec!["a", "c"]]);
        fake.licenses = vec![("c", "https://example.com/allrights")];
        let scanner = MetadataScanner::new(Arc::new(fake), CancellationToken::new());

        let mut opts = options();
        opts.check_license = false;
        let summary = scanner.run(&opts, &save).await.unwrap();
        assert_eq!(summary.accepted, 2);
        assert_eq!(fs::read_to_string(&save).unwrap(), "a\nc\n");
    }
}
