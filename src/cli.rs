//! Command line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::archive::media::MediaPreference;

/// Fetches license-checked media items from the public archive.
#[derive(Debug, Parser)]
#[command(name = "archive_fetch", version)]
pub struct Cli {
    /// Config file, created with defaults when missing
    #[arg(short, long, global = true, default_value = "archive_fetch.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download every listed identifier not on the done list
    Download(DownloadArgs),
    /// Search the archive and append new identifiers to a list file
    Search(SearchArgs),
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Identifier list: `.txt` with one id per line, otherwise gzip JSON lines
    #[arg(short = 'f', long = "file")]
    pub id_list: PathBuf,

    /// Directory that receives one sub-directory per identifier
    #[arg(short = 'd', long = "save-dir")]
    pub save_dir: PathBuf,

    /// Media kind to keep (defaults to the config file)
    #[arg(short, long, value_enum)]
    pub media: Option<MediaPreference>,

    /// Download regardless of license
    #[arg(long)]
    pub no_license_check: bool,

    /// Skip caption and subtitle files
    #[arg(long)]
    pub no_captions: bool,

    /// Plain-text list of identifiers already done
    #[arg(short = 'a', long = "done-list")]
    pub done_list: Option<PathBuf>,

    /// Append each completed identifier to the done list
    #[arg(long, requires = "done_list")]
    pub record_done: bool,

    /// Concurrent items (defaults to the config file)
    #[arg(short, long)]
    pub workers: Option<usize>,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// File that collects identifiers, one per line
    #[arg(short = 'o', long = "save-file")]
    pub save_file: PathBuf,

    /// Keep hits regardless of license
    #[arg(long)]
    pub no_license_check: bool,

    /// Raw search query replacing the configured terms
    #[arg(short, long)]
    pub query: Option<String>,

    /// Stop after this many hits
    #[arg(long)]
    pub max_results: Option<usize>,

    /// Concurrent metadata scans (defaults to the config file)
    #[arg(short, long)]
    pub workers: Option<usize>,
}
