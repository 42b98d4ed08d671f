//! Orchestrator scenarios: bounded concurrency, one terminal state per identifier,
//! done-list recording and shutdown.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use super::fake_client::{FakeArchive, permissive, restrictive};
use crate::archive::client::FileManifest;
use crate::archive::orchestrator::{FetchOrchestrator, RunSummary};
use crate::archive::pipeline::PipelineOptions;
use crate::archive::worklist::{DoneListWriter, load_work_list, read_done_set};

/// Ten items: every third is closed, item 7 has no media, the rest are fetchable.
fn mixed_archive(latency: Duration) -> (FakeArchive, Vec<String>) {
    let mut archive = FakeArchive::new().with_latency(latency);
    let mut ids = Vec::new();
    for n in 0..10 {
        let id = format!("item-{n}");
        let metadata = if n % 3 == 0 { restrictive() } else { permissive() };
        let manifest = if n == 7 {
            FileManifest::from_names([format!("{id}.txt")])
        } else {
            FileManifest::from_names([format!("{id}.mp3"), format!("{id}_meta.xml")])
        };
        archive = archive.with_item(&id, manifest, metadata);
        ids.push(id);
    }
    (archive, ids)
}

fn options(save_dir: &Path) -> PipelineOptions {
    PipelineOptions {
        get_captions: false,
        ..PipelineOptions::new(save_dir)
    }
}

async fn run_with_workers(workers: usize) -> (RunSummary, Vec<String>, Arc<FakeArchive>) {
    let save = tempdir().unwrap();
    let (archive, ids) = mixed_archive(Duration::from_millis(5));
    let archive = Arc::new(archive);

    let summary = FetchOrchestrator::new(
        archive.clone(),
        options(save.path()),
        workers,
        CancellationToken::new(),
    )
    .unwrap()
    .run(ids)
    .await
    .unwrap();

    let mut on_disk: Vec<String> = fs::read_dir(save.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    on_disk.sort();
    (summary, on_disk, archive)
}

#[tokio::test]
async fn test_every_identifier_reaches_one_terminal_state() {
    let (summary, on_disk, _) = run_with_workers(3).await;

    assert_eq!(summary.total, 10);
    assert_eq!(summary.finished(), 10);
    assert_eq!(summary.not_started, 0);
    // item-0, 3, 6, 9 are closed; item-7 has only a text file.
    assert_eq!(summary.aborted.get("license_denied"), Some(&4));
    assert_eq!(summary.aborted.get("no_manifest_content"), Some(&1));
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.completed_empty, 0);
    assert_eq!(
        on_disk,
        vec!["item-1", "item-2", "item-4", "item-5", "item-8"]
    );
}

#[tokio::test]
async fn test_outcome_is_independent_of_worker_count() {
    let (one, disk_one, _) = run_with_workers(1).await;
    let (four, disk_four, _) = run_with_workers(4).await;
    let (many, disk_many, _) = run_with_workers(32).await;

    for summary in [&four, &many] {
        assert_eq!(summary.completed, one.completed);
        assert_eq!(summary.aborted, one.aborted);
    }
    assert_eq!(disk_one, disk_four);
    assert_eq!(disk_one, disk_many);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_worker_count() {
    let (_, _, archive) = run_with_workers(3).await;
    assert!(archive.peak_in_flight() <= 3);
    assert!(archive.peak_in_flight() >= 1);
}

#[tokio::test]
async fn test_each_item_is_fetched_once() {
    let (_, _, archive) = run_with_workers(4).await;
    for n in [1, 2, 4, 5, 8] {
        assert_eq!(archive.file_requests(&format!("item-{n}")), 1);
    }
    for n in [0, 3, 6, 7, 9] {
        assert_eq!(archive.file_requests(&format!("item-{n}")), 0);
    }
}

#[tokio::test]
async fn test_record_done_makes_next_run_converge() {
    let dir = tempdir().unwrap();
    let save = dir.path().join("save");
    fs::create_dir(&save).unwrap();
    let all_path = dir.path().join("all.txt");
    let done_path = dir.path().join("done.txt");

    let (archive, ids) = mixed_archive(Duration::ZERO);
    fs::write(&all_path, ids.join("\n")).unwrap();
    let archive = Arc::new(archive);

    let remaining = load_work_list(&all_path, None).unwrap();
    let summary = FetchOrchestrator::new(archive.clone(), options(&save), 4, CancellationToken::new())
        .unwrap()
        .with_done_list(DoneListWriter::open(&done_path).unwrap())
        .run(remaining)
        .await
        .unwrap();
    assert_eq!(summary.completed, 5);

    let done = read_done_set(Some(&done_path)).unwrap();
    let expected: HashSet<String> = [1, 2, 4, 5, 8].iter().map(|n| format!("item-{n}")).collect();
    assert_eq!(done, expected);

    // Completed items are skipped; aborted ones are tried again.
    let next = load_work_list(&all_path, Some(&done_path)).unwrap();
    assert_eq!(next, vec!["item-0", "item-3", "item-6", "item-7", "item-9"]);

    let second = FetchOrchestrator::new(archive.clone(), options(&save), 4, CancellationToken::new())
        .unwrap()
        .run(next)
        .await
        .unwrap();
    assert_eq!(second.completed, 0);
    assert_eq!(second.finished(), 5);
    assert_eq!(archive.file_requests("item-1"), 1);
}

#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let save = tempdir().unwrap();
    let (archive, ids) = mixed_archive(Duration::ZERO);
    let archive = Arc::new(archive);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = FetchOrchestrator::new(archive.clone(), options(save.path()), 2, cancel)
        .unwrap()
        .run(ids)
        .await
        .unwrap();

    assert_eq!(summary.not_started, 10);
    assert_eq!(summary.finished(), 0);
    assert_eq!(fs::read_dir(save.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_leaves_no_partial_directories() {
    let save = tempdir().unwrap();
    let (archive, ids) = mixed_archive(Duration::from_millis(30));
    let archive = Arc::new(archive);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        trigger.cancel();
    });

    let summary = FetchOrchestrator::new(archive, options(save.path()), 2, cancel)
        .unwrap()
        .run(ids)
        .await
        .unwrap();

    assert_eq!(summary.finished() + summary.not_started, 10);
    assert!(summary.not_started > 0);
    // Only completed items may have a directory.
    assert_eq!(fs::read_dir(save.path()).unwrap().count(), summary.completed);
}

#[test]
fn test_summary_display() {
    let mut summary = RunSummary {
        run_id: uuid::Uuid::nil(),
        started_at: chrono::Utc::now(),
        total: 4,
        completed: 2,
        completed_empty: 1,
        aborted: Default::default(),
        not_started: 1,
        duplicates: 0,
    };
    summary.aborted.insert("license_denied", 1);
    assert_eq!(
        summary.to_string(),
        "2 of 4 completed (1 empty), 1 aborted, 1 not started"
    );
}

#[test]
fn test_summary_display_mentions_duplicates() {
    let summary = RunSummary {
        run_id: uuid::Uuid::nil(),
        started_at: chrono::Utc::now(),
        total: 1,
        completed: 1,
        completed_empty: 0,
        aborted: Default::default(),
        not_started: 0,
        duplicates: 2,
    };
    assert_eq!(
        summary.to_string(),
        "1 of 1 completed (0 empty), 0 aborted, 2 duplicates skipped"
    );
}

async fn run_duplicated(workers: usize) -> (RunSummary, bool, Arc<FakeArchive>) {
    let save = tempdir().unwrap();
    let archive = Arc::new(
        FakeArchive::new()
            .with_latency(Duration::from_millis(20))
            .with_item(
                "dup",
                FileManifest::from_names(["dup.mp3", "dup_meta.xml"]),
                permissive(),
            ),
    );

    let summary = FetchOrchestrator::new(
        archive.clone(),
        options(save.path()),
        workers,
        CancellationToken::new(),
    )
    .unwrap()
    .run(vec!["dup".to_string(), "dup".to_string()])
    .await
    .unwrap();

    let kept = save.path().join("dup").join("dup.mp3").exists();
    (summary, kept, archive)
}

#[tokio::test]
async fn test_repeated_identifier_runs_once_for_any_worker_count() {
    for workers in [1, 2] {
        let (summary, kept, archive) = run_duplicated(workers).await;
        assert_eq!(summary.total, 1, "workers = {workers}");
        assert_eq!(summary.completed, 1, "workers = {workers}");
        assert_eq!(summary.aborted_total(), 0, "workers = {workers}");
        assert_eq!(summary.duplicates, 1, "workers = {workers}");
        assert!(kept, "completed item lost its files with workers = {workers}");
        assert_eq!(archive.metadata_requests("dup"), 1, "workers = {workers}");
        assert_eq!(archive.file_requests("dup"), 1, "workers = {workers}");
    }
}
