use std::env::current_dir;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use console::{Term, style};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::archive::client::ArchiveError;
use crate::archive::pool::PoolError;
use crate::archive::search::{SearchError, build_query};
use crate::archive::worklist::{self, DoneListWriter, WorkListError};
use crate::archive::{
    ArchiveOrgClient, FetchOrchestrator, MetadataScanner, PipelineOptions, RunSummary,
    SearchOptions, SearchSummary,
};
use crate::cli::{Command, DownloadArgs, SearchArgs};
use crate::config::AppConfig;

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

#[derive(Error, Debug)]
pub(crate) enum ProgramError {
    #[error("Input missing: {0}")]
    InputMissing(PathBuf),

    #[error(transparent)]
    WorkList(WorkListError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("Cannot create save directory {path}: {source}")]
    SaveDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<WorkListError> for ProgramError {
    fn from(err: WorkListError) -> Self {
        match err {
            WorkListError::InputMissing(path) => ProgramError::InputMissing(path),
            other => ProgramError::WorkList(other),
        }
    }
}

/// Handles the flow of one command from loaded config to printed summary.
pub(crate) struct Program {
    config: AppConfig,
    cancel: CancellationToken,
}

impl Program {
    pub(crate) fn new(config: AppConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Runs a command to completion, or until Ctrl-C stops new work.
    pub(crate) async fn run(&self, command: Command) -> anyhow::Result<()> {
        Term::stdout().set_title("archive fetch");
        trace!("Starting archive fetch...");
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        let working_dir = current_dir().context("Failed to get working directory")?;
        trace!("Program Working Directory: {}", working_dir.display());

        self.listen_for_shutdown();

        match command {
            Command::Download(args) => {
                let summary = self.download(&args).await?;
                print_run_summary(&summary);
            }
            Command::Search(args) => {
                let summary = self.search(&args).await?;
                print_search_summary(&summary, &args.save_file);
            }
        }

        if self.cancel.is_cancelled() {
            warn!("Stopped early on shutdown request");
        }
        Ok(())
    }

    /// Cancels the shared token on the first Ctrl-C and exits on the second.
    fn listen_for_shutdown(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            match wait_for_forced_shutdown(tokio::signal::ctrl_c, cancel).await {
                Ok(()) => {
                    error!("Second shutdown request, exiting without waiting for in-flight items");
                    std::process::exit(130);
                }
                Err(e) => error!("Unable to listen for shutdown signal: {}", e),
            }
        });
    }

    fn client(&self) -> Result<Arc<ArchiveOrgClient>, ProgramError> {
        Ok(Arc::new(ArchiveOrgClient::new(
            self.config.archive_client_config(),
        )?))
    }

    async fn download(&self, args: &DownloadArgs) -> Result<RunSummary, ProgramError> {
        // Both lists are read before any directory or request is touched.
        let identifiers = worklist::load_work_list(&args.id_list, args.done_list.as_deref())?;

        std::fs::create_dir_all(&args.save_dir).map_err(|source| ProgramError::SaveDir {
            path: args.save_dir.clone(),
            source,
        })?;

        let settings = &self.config.download;
        let options = PipelineOptions {
            save_dir: args.save_dir.clone(),
            media: args.media.unwrap_or(settings.media),
            check_license: settings.check_license && !args.no_license_check,
            get_captions: settings.get_captions && !args.no_captions,
        };
        let workers = args.workers.unwrap_or(self.config.pools.max_download_concurrency);
        info!(
            media = %options.media,
            check_license = options.check_license,
            get_captions = options.get_captions,
            workers,
            "Download settings"
        );

        let mut orchestrator = FetchOrchestrator::new(self.client()?, options, workers, self.cancel.clone())?
            .with_progress(Term::stderr().is_term());

        let record_done = args.record_done || settings.record_done;
        match (record_done, args.done_list.as_deref()) {
            (true, Some(path)) => {
                let writer = DoneListWriter::open(path).map_err(|source| {
                    ProgramError::WorkList(WorkListError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                })?;
                info!("Recording completed identifiers in {}", writer.path().display());
                orchestrator = orchestrator.with_done_list(writer);
            }
            (true, None) => warn!("Done-list recording is enabled but no done list was given"),
            (false, _) => {}
        }

        Ok(orchestrator.run(identifiers).await?)
    }

    async fn search(&self, args: &SearchArgs) -> Result<SearchSummary, ProgramError> {
        let settings = &self.config.search;
        let query = match &args.query {
            Some(query) => query.clone(),
            None => build_query(&settings.content_terms, &settings.keyword_terms),
        };
        let max_results = args
            .max_results
            .or((settings.max_results > 0).then_some(settings.max_results));
        trace!("Search query: {}", query);

        let options = SearchOptions {
            query,
            rows_per_page: settings.rows_per_page,
            max_results,
            check_license: self.config.download.check_license && !args.no_license_check,
            workers: args.workers.unwrap_or(self.config.pools.max_scan_concurrency),
            show_progress: Term::stderr().is_term(),
        };

        let scanner = MetadataScanner::new(self.client()?, self.cancel.clone());
        Ok(scanner.run(&options, &args.save_file).await?)
    }
}

/// Returns once `next_signal` has fired twice. The first signal cancels `cancel`.
async fn wait_for_forced_shutdown<F, Fut>(
    mut next_signal: F,
    cancel: CancellationToken,
) -> std::io::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    next_signal().await?;
    warn!("Shutdown requested, finishing in-flight items. Press Ctrl-C again to quit now");
    cancel.cancel();
    next_signal().await
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("{} {}", style("Run").bold(), style(summary.run_id).dim());
    println!(
        "  {} {} of {}",
        style("completed").green(),
        summary.completed,
        summary.total
    );
    if summary.completed_empty > 0 {
        println!(
            "  {} {}",
            style("completed (empty)").yellow(),
            summary.completed_empty
        );
    }
    for (reason, count) in &summary.aborted {
        println!("  {} {}", style(format!("aborted: {}", reason)).red(), count);
    }
    if summary.not_started > 0 {
        println!("  {} {}", style("not started").yellow(), summary.not_started);
    }
    if summary.duplicates > 0 {
        println!("  {} {}", style("duplicates skipped").dim(), summary.duplicates);
    }
    let elapsed = chrono::Utc::now() - summary.started_at;
    println!("  {} {}s", style("elapsed").dim(), elapsed.num_seconds());
}

fn print_search_summary(summary: &SearchSummary, save_file: &Path) {
    println!();
    println!("{} {}", style("Search").bold(), style(save_file.display()).dim());
    println!("  {} {}", style("hits").cyan(), summary.hits);
    println!("  {} {}", style("scanned").cyan(), summary.scanned);
    if summary.scan_failures > 0 {
        println!("  {} {}", style("scan failures").red(), summary.scan_failures);
    }
    println!("  {} {}", style("new identifiers").green(), summary.accepted);
    println!("  {} {}", style("total in file").bold(), summary.total_in_file);
}
