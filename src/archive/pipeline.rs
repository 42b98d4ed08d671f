//! Per-identifier fetch pipeline.
//!
//! Each item walks `Start -> MetadataFetched -> LicenseChecked -> MediaSelected -> ContentFetched`.
//! Any gating failure ends the item in `Aborted(reason)` and removes its directory before
//! [ItemPipeline::run] returns, so an aborted item never leaves state on disk.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::archive::captions::{CaptionError, CaptionOutcome, fetch_captions};
use crate::archive::client::{ArchiveClient, FetchOutcome, FileManifest, MetadataRecord, local_path};
use crate::archive::license;
use crate::archive::media::{self, MediaPreference, SelectionError};

/// Settings shared by every pipeline run of one download session.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub save_dir: PathBuf,
    pub media: MediaPreference,
    pub check_license: bool,
    pub get_captions: bool,
}

impl PipelineOptions {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            media: MediaPreference::Both,
            check_license: true,
            get_captions: true,
        }
    }
}

/// The last state an item reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Start,
    MetadataFetched,
    LicenseChecked,
    MediaSelected,
    ContentFetched,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStage::Start => write!(f, "start"),
            PipelineStage::MetadataFetched => write!(f, "metadata_fetched"),
            PipelineStage::LicenseChecked => write!(f, "license_checked"),
            PipelineStage::MediaSelected => write!(f, "media_selected"),
            PipelineStage::ContentFetched => write!(f, "content_fetched"),
        }
    }
}

/// Why an item was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The identifier cannot name a single directory under the save directory.
    InvalidIdentifier,
    /// A directory was left behind by an earlier, unfinished run.
    PreexistingDirectory,
    MetadataFetchFailed(String),
    ManifestMissing,
    LicenseDenied,
    NoMedia(SelectionError),
    /// Shutdown was requested while the item was in progress.
    Interrupted,
}

impl AbortReason {
    /// Stable short name used for logging and the run summary.
    pub fn label(&self) -> &'static str {
        match self {
            AbortReason::InvalidIdentifier => "invalid_identifier",
            AbortReason::PreexistingDirectory => "preexisting_directory",
            AbortReason::MetadataFetchFailed(_) => "metadata_fetch_failed",
            AbortReason::ManifestMissing => "manifest_missing",
            AbortReason::LicenseDenied => "license_denied",
            AbortReason::NoMedia(SelectionError::NoManifestContent) => "no_manifest_content",
            AbortReason::NoMedia(SelectionError::NoEligibleMedia) => "no_eligible_media",
            AbortReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::InvalidIdentifier => write!(f, "identifier is not a valid directory name"),
            AbortReason::PreexistingDirectory => write!(f, "stale directory from an earlier run"),
            AbortReason::MetadataFetchFailed(e) => write!(f, "metadata fetch failed: {}", e),
            AbortReason::ManifestMissing => write!(f, "file manifest missing"),
            AbortReason::LicenseDenied => write!(f, "license not permissive"),
            AbortReason::NoMedia(e) => write!(f, "no media: {}", e),
            AbortReason::Interrupted => write!(f, "interrupted by shutdown"),
        }
    }
}

/// What a successful item left on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedItem {
    pub fetched: Vec<String>,
    pub already_present: Vec<String>,
    pub failed: Vec<String>,
    /// `None` when caption retrieval was disabled.
    pub captions: Option<Result<CaptionOutcome, CaptionError>>,
}

impl CompletedItem {
    /// True when the item finished without a single media file on disk.
    pub fn is_empty(&self) -> bool {
        self.fetched.is_empty() && self.already_present.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Completed(CompletedItem),
    Aborted {
        stage: PipelineStage,
        reason: AbortReason,
    },
}

/// Terminal state of one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemResult {
    pub identifier: String,
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Completed(_))
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match &self.outcome {
            ItemOutcome::Aborted { reason, .. } => Some(reason),
            ItemOutcome::Completed(_) => None,
        }
    }
}

/// Manifest and metadata as fetched; a missing manifest is only judged after the license.
struct Descriptors {
    manifest: Option<FileManifest>,
    metadata: MetadataRecord,
}

/// Runs the fetch state machine for one identifier at a time.
#[derive(Clone)]
pub struct ItemPipeline {
    client: Arc<dyn ArchiveClient>,
    options: Arc<PipelineOptions>,
    cancel: CancellationToken,
}

impl ItemPipeline {
    pub fn new(
        client: Arc<dyn ArchiveClient>,
        options: PipelineOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            options: Arc::new(options),
            cancel,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Directory that holds everything fetched for `identifier`.
    pub fn item_dir(&self, identifier: &str) -> Option<PathBuf> {
        let dir = local_path(&self.options.save_dir, identifier).ok()?;
        // Exactly one path component, so the item can never reach outside its own directory.
        (Path::new(identifier).components().count() == 1).then_some(dir)
    }

    /// Drives one identifier to a terminal state.
    pub async fn run(&self, identifier: &str) -> ItemResult {
        let span = info_span!("item", identifier = %identifier);
        async {
            let Some(dir) = self.item_dir(identifier) else {
                warn!("Skipping identifier that is not a plain directory name");
                return ItemResult {
                    identifier: identifier.to_string(),
                    outcome: ItemOutcome::Aborted {
                        stage: PipelineStage::Start,
                        reason: AbortReason::InvalidIdentifier,
                    },
                };
            };

            let mut stage = PipelineStage::Start;
            let outcome = match self.advance(identifier, &dir, &mut stage).await {
                Ok(completed) => {
                    if completed.is_empty() {
                        warn!(
                            failed = completed.failed.len(),
                            "Completed without any media file on disk"
                        );
                    } else {
                        info!(
                            fetched = completed.fetched.len(),
                            already_present = completed.already_present.len(),
                            failed = completed.failed.len(),
                            "Item complete"
                        );
                    }
                    ItemOutcome::Completed(completed)
                }
                Err(reason) => {
                    warn!(%stage, reason = reason.label(), "Item aborted: {}", reason);
                    purge_item_dir(&dir).await;
                    ItemOutcome::Aborted { stage, reason }
                }
            };

            ItemResult {
                identifier: identifier.to_string(),
                outcome,
            }
        }
        .instrument(span)
        .await
    }

    async fn advance(
        &self,
        identifier: &str,
        dir: &Path,
        stage: &mut PipelineStage,
    ) -> Result<CompletedItem, AbortReason> {
        // Done-ness comes from the done list only; anything on disk here is a crashed attempt.
        if fs::symlink_metadata(dir).await.is_ok() {
            return Err(AbortReason::PreexistingDirectory);
        }
        self.checkpoint()?;

        let descriptors = self.fetch_descriptors(identifier, dir).await?;
        *stage = PipelineStage::MetadataFetched;
        self.checkpoint()?;

        let manifest = self.check_license(descriptors)?;
        *stage = PipelineStage::LicenseChecked;

        let captions = if self.options.get_captions {
            let result = fetch_captions(self.client.as_ref(), identifier, &manifest, dir).await;
            if let Err(e) = &result {
                debug!("No captions: {}", e);
            }
            Some(result)
        } else {
            None
        };
        self.checkpoint()?;

        let selection = self.select_media(&manifest)?;
        *stage = PipelineStage::MediaSelected;
        debug!(files = ?selection, "Selected media");

        let mut completed = self.fetch_content(identifier, dir, &selection).await?;
        *stage = PipelineStage::ContentFetched;
        completed.captions = captions;
        Ok(completed)
    }

    fn checkpoint(&self) -> Result<(), AbortReason> {
        if self.cancel.is_cancelled() {
            Err(AbortReason::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Start -> MetadataFetched. Stores both descriptors in the item directory.
    async fn fetch_descriptors(&self, identifier: &str, dir: &Path) -> Result<Descriptors, AbortReason> {
        let manifest = match self.client.fetch_manifest(identifier).await {
            Ok(manifest) => Some(manifest),
            Err(e) if e.is_missing_descriptor() => {
                debug!("Archive reported no file list: {}", e);
                None
            }
            Err(e) => return Err(AbortReason::MetadataFetchFailed(e.to_string())),
        };
        let metadata = self
            .client
            .fetch_metadata(identifier)
            .await
            .map_err(|e| AbortReason::MetadataFetchFailed(e.to_string()))?;

        store_descriptors(identifier, dir, manifest.as_ref(), &metadata)
            .await
            .map_err(|e| AbortReason::MetadataFetchFailed(format!("could not store descriptors: {}", e)))?;

        Ok(Descriptors { manifest, metadata })
    }

    /// MetadataFetched -> LicenseChecked.
    fn check_license(&self, descriptors: Descriptors) -> Result<FileManifest, AbortReason> {
        if self.options.check_license && !license::permits(&descriptors.metadata) {
            return Err(AbortReason::LicenseDenied);
        }
        descriptors.manifest.ok_or(AbortReason::ManifestMissing)
    }

    /// LicenseChecked -> MediaSelected. A direct `.mp3`/`.mp4` hit anywhere in the manifest wins.
    fn select_media(&self, manifest: &FileManifest) -> Result<Vec<String>, AbortReason> {
        let direct = media::preferred_matches(manifest, self.options.media);
        if !direct.is_empty() {
            return Ok(direct);
        }
        debug!("No preferred container, falling back to the extension allow-list");
        media::select(manifest, self.options.media).map_err(AbortReason::NoMedia)
    }

    /// MediaSelected -> ContentFetched. Individual file failures are recorded, not fatal.
    async fn fetch_content(
        &self,
        identifier: &str,
        dir: &Path,
        selection: &[String],
    ) -> Result<CompletedItem, AbortReason> {
        let mut completed = CompletedItem::default();
        for name in selection {
            self.checkpoint()?;
            match self.client.fetch_file(identifier, name, dir).await {
                Ok(FetchOutcome::Fetched { bytes }) => {
                    debug!(file = %name, bytes, "Fetched file");
                    completed.fetched.push(name.clone());
                }
                Ok(FetchOutcome::AlreadyPresent) => {
                    debug!(file = %name, "File already present");
                    completed.already_present.push(name.clone());
                }
                Err(e) => {
                    warn!(file = %name, "File download failed: {}", e);
                    completed.failed.push(name.clone());
                }
            }
        }
        Ok(completed)
    }
}

async fn store_descriptors(
    identifier: &str,
    dir: &Path,
    manifest: Option<&FileManifest>,
    metadata: &MetadataRecord,
) -> io::Result<()> {
    fs::create_dir_all(dir).await?;
    if let Some(manifest) = manifest {
        let body = serde_json::to_vec_pretty(manifest)?;
        fs::write(dir.join(format!("{}_files.json", identifier)), body).await?;
    }
    let body = serde_json::to_vec_pretty(metadata)?;
    fs::write(dir.join(format!("{}_meta.json", identifier)), body).await?;
    Ok(())
}

/// Removes an item directory; if it is not a directory, removes it as a file.
pub async fn purge_item_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "Removed item directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(dir_err) => match fs::remove_file(dir).await {
            Ok(()) => debug!(path = %dir.display(), "Removed stray item file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(file_err) => error!(
                path = %dir.display(),
                "Failed to clean up item: {} (as file: {})", dir_err, file_err
            ),
        },
    }
}
