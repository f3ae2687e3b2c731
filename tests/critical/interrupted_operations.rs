//! P0: interrupted runs leave state that the next run recovers from.

use std::time::Duration;

use grabia_core::{JobOptions, StateStore, TaskKey, TaskStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::support::archive_mock::{mirror_for, mount_file, mount_metadata, range_headers};
use crate::support::critical_utils::seed_tasks;

const BODY: &[u8] = b"the quick brown fox jumps over the lazy dog";

#[tokio::test]
async fn p0_in_progress_tasks_are_reset_on_restart() {
    let dir = TempDir::new().expect("temp dir");
    {
        let store = StateStore::open(dir.path()).await.expect("open store");
        seed_tasks(&store, dir.path(), "item", 3).await;
        store.claim_next(i64::MAX).await.expect("claim").expect("task");
        store.claim_next(i64::MAX).await.expect("claim").expect("task");
        // Simulated crash: the store is dropped with two tasks claimed.
    }

    let store = StateStore::open(dir.path()).await.expect("reopen store");
    assert_eq!(store.status_counts().await.expect("counts").in_progress, 2);
    assert_eq!(store.reset_in_progress().await.expect("reset"), 2);
    let counts = store.status_counts().await.expect("counts");
    assert_eq!(counts.in_progress, 0);
    assert_eq!(counts.pending, 3);
}

#[tokio::test]
async fn p0_cancel_during_request_refunds_attempt_and_resume_finishes() {
    let server = require_mock_server!();
    mount_metadata(
        &server,
        "item",
        serde_json::json!({"files": [{"name": "slow.bin", "size": BODY.len().to_string()}]}),
    )
    .await;
    // The first response stalls long enough for the stop signal to land.
    Mock::given(method("GET"))
        .and(path("/download/item/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(BODY.to_vec())
                .set_delay(Duration::from_secs(30)),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_file(&server, "item", "slow.bin", BODY).await;

    let dir = TempDir::new().expect("temp dir");
    let mirror = mirror_for(&server);
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let options = JobOptions::new(vec!["item".into()], dir.path().to_path_buf());
    let started = std::time::Instant::now();
    let summary = mirror.start(&options, cancel).await.expect("start returns");
    assert!(started.elapsed() < Duration::from_secs(10), "stop signal honoured");
    assert!(summary.cancelled);
    assert_eq!(summary.counts.pending, 1);

    let store = StateStore::open(dir.path()).await.expect("open store");
    let task = store
        .get(&TaskKey::new("item", "slow.bin"))
        .await
        .expect("get")
        .expect("task");
    assert_eq!(task.status(), TaskStatus::Pending);
    assert_eq!(task.attempts, 0, "cancelled attempt is refunded");
    store.close().await;

    let resumed = mirror
        .resume(dir.path(), None, CancellationToken::new())
        .await
        .expect("resume");
    assert!(resumed.is_complete());
    assert_eq!(
        std::fs::read(dir.path().join("item/slow.bin")).expect("file"),
        BODY
    );
}

#[tokio::test]
async fn p0_overlong_part_file_is_discarded() {
    let server = require_mock_server!();
    mount_metadata(
        &server,
        "item",
        serde_json::json!({"files": [{"name": "a.bin", "size": BODY.len().to_string()}]}),
    )
    .await;
    mount_file(&server, "item", "a.bin", BODY).await;
    let dir = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(dir.path().join("item")).expect("mkdir");
    let mut junk = BODY.to_vec();
    junk.extend_from_slice(b"garbage past the end");
    std::fs::write(dir.path().join("item/a.bin.part"), junk).expect("write part");

    let summary = mirror_for(&server)
        .start(
            &JobOptions::new(vec!["item".into()], dir.path().to_path_buf()),
            CancellationToken::new(),
        )
        .await
        .expect("start");

    assert_eq!(summary.counts.completed, 1);
    assert_eq!(range_headers(&server).await, vec![None]);
    assert_eq!(std::fs::read(dir.path().join("item/a.bin")).expect("file"), BODY);
}

#[tokio::test]
async fn p0_completed_file_removed_from_disk_is_requeued() {
    let server = require_mock_server!();
    mount_metadata(
        &server,
        "item",
        serde_json::json!({"files": [{"name": "a.bin", "size": BODY.len().to_string()}]}),
    )
    .await;
    mount_file(&server, "item", "a.bin", BODY).await;
    let dir = TempDir::new().expect("temp dir");
    let mirror = mirror_for(&server);
    let options = JobOptions::new(vec!["item".into()], dir.path().to_path_buf());

    mirror.start(&options, CancellationToken::new()).await.expect("first run");
    // Truncated behind the store's back.
    std::fs::write(dir.path().join("item/a.bin"), b"short").expect("truncate");

    let summary = mirror.start(&options, CancellationToken::new()).await.expect("second run");

    assert_eq!(summary.prepared.requeued, 1);
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(std::fs::read(dir.path().join("item/a.bin")).expect("file"), BODY);
}
