//! Drives the item pipeline over a whole work list.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::archive::client::ArchiveClient;
use crate::archive::pipeline::{ItemOutcome, ItemPipeline, ItemResult, PipelineOptions};
use crate::archive::pool::{PoolResult, WorkerPool};
use crate::archive::tui::{ITEM_TEMPLATE, counting_bar};
use crate::archive::worklist::DoneListWriter;

/// Counts of terminal outcomes for one download run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub completed: usize,
    /// Completed items that ended without a single media file.
    pub completed_empty: usize,
    /// Aborted items by reason label.
    pub aborted: BTreeMap<&'static str, usize>,
    pub not_started: usize,
    /// Repeated work-list entries that were not dispatched again.
    pub duplicates: usize,
}

impl RunSummary {
    fn new(total: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            total,
            completed: 0,
            completed_empty: 0,
            aborted: BTreeMap::new(),
            not_started: 0,
            duplicates: 0,
        }
    }

    fn record(&mut self, result: &ItemResult) {
        match &result.outcome {
            ItemOutcome::Completed(item) => {
                self.completed += 1;
                if item.is_empty() {
                    self.completed_empty += 1;
                }
            }
            ItemOutcome::Aborted { reason, .. } => {
                *self.aborted.entry(reason.label()).or_default() += 1;
            }
        }
    }

    pub fn aborted_total(&self) -> usize {
        self.aborted.values().sum()
    }

    /// Items that reached a terminal state.
    pub fn finished(&self) -> usize {
        self.completed + self.aborted_total()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} completed ({} empty), {} aborted",
            self.completed,
            self.total,
            self.completed_empty,
            self.aborted_total()
        )?;
        if self.not_started > 0 {
            write!(f, ", {} not started", self.not_started)?;
        }
        if self.duplicates > 0 {
            write!(f, ", {} duplicates skipped", self.duplicates)?;
        }
        Ok(())
    }
}

/// Runs [ItemPipeline] for every identifier on a bounded [WorkerPool].
pub struct FetchOrchestrator {
    pipeline: ItemPipeline,
    pool: WorkerPool,
    done_list: Option<DoneListWriter>,
    show_progress: bool,
}

impl FetchOrchestrator {
    pub fn new(
        client: Arc<dyn ArchiveClient>,
        options: PipelineOptions,
        workers: usize,
        cancel: CancellationToken,
    ) -> PoolResult<Self> {
        Ok(Self {
            pool: WorkerPool::new("download", workers, cancel.clone())?,
            pipeline: ItemPipeline::new(client, options, cancel),
            done_list: None,
            show_progress: false,
        })
    }

    /// Appends each completed identifier to `writer` as soon as it completes.
    pub fn with_done_list(mut self, writer: DoneListWriter) -> Self {
        self.done_list = Some(writer);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Runs every identifier to a terminal state, or until cancellation stops new work.
    pub async fn run(self, identifiers: Vec<String>) -> PoolResult<RunSummary> {
        let Self {
            pipeline,
            pool,
            mut done_list,
            show_progress,
        } = self;

        let listed = identifiers.len();
        let identifiers = distinct(identifiers);
        let mut summary = RunSummary::new(identifiers.len());
        summary.duplicates = listed - summary.total;
        if summary.duplicates > 0 {
            warn!(
                duplicates = summary.duplicates,
                "Work list repeats identifiers, each one runs once"
            );
        }
        info!(
            run_id = %summary.run_id,
            items = summary.total,
            workers = pool.workers(),
            save_dir = %pipeline.options().save_dir.display(),
            "Starting download run"
        );

        let progress: ProgressBar = counting_bar(summary.total as u64, ITEM_TEMPLATE, show_progress);
        let report = pool
            .run(
                identifiers,
                move |identifier: String| {
                    let pipeline = pipeline.clone();
                    async move { pipeline.run(&identifier).await }
                },
                |result: &ItemResult| {
                    summary.record(result);
                    progress.inc(1);
                    progress.set_message(result.identifier.clone());
                    if result.is_completed() {
                        if let Some(writer) = done_list.as_mut() {
                            if let Err(e) = writer.record(&result.identifier) {
                                error!(
                                    identifier = %result.identifier,
                                    path = %writer.path().display(),
                                    "Failed to record done identifier: {}", e
                                );
                            }
                        }
                    }
                },
            )
            .await?;
        progress.finish_and_clear();

        summary.not_started = report.not_started;
        if summary.not_started > 0 {
            warn!(not_started = summary.not_started, "Run interrupted before every item started");
        }
        info!(
            run_id = %summary.run_id,
            completed = summary.completed,
            completed_empty = summary.completed_empty,
            aborted = summary.aborted_total(),
            not_started = summary.not_started,
            "Download run finished"
        );
        Ok(summary)
    }
}

/// Keeps the first occurrence of each identifier. Two runs of one identifier
/// would share an item directory.
fn distinct(identifiers: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(identifiers.len());
    identifiers
        .into_iter()
        .filter(|identifier| seen.insert(identifier.clone()))
        .collect()
}
