//! P0: concurrent claimers and the worker pool never share a task.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grabia_core::{StateStore, TaskKey};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::Mock;
use wiremock::matchers::{method, path};

use crate::support::archive_mock::{
    RangeResponder, download_requests, mirror_for, mount_item, mount_metadata,
};
use crate::support::critical_utils::seed_tasks;

#[tokio::test]
async fn p0_concurrent_claims_never_overlap() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(StateStore::open(dir.path()).await.expect("open store"));
    seed_tasks(&store, dir.path(), "item", 60).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = store.claim_next(i64::MAX).await.expect("claim") {
                claimed.push(task.key());
            }
            claimed
        }));
    }

    let mut all: Vec<TaskKey> = Vec::new();
    for handle in handles {
        all.extend(handle.await.expect("claimer task"));
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 60, "every task claimed exactly once");
    assert_eq!(unique.len(), 60);

    let counts = store.status_counts().await.expect("counts");
    assert_eq!(counts.in_progress, 60);
    assert_eq!(counts.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn p0_claims_held_across_slow_work_never_overlap() {
    let dir = TempDir::new().expect("temp dir");
    let store = Arc::new(StateStore::open(dir.path()).await.expect("open store"));
    seed_tasks(&store, dir.path(), "item", 40).await;
    let held: Arc<Mutex<HashSet<TaskKey>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let held = Arc::clone(&held);
        handles.push(tokio::spawn(async move {
            let mut done = 0usize;
            while let Some(task) = store.claim_next(i64::MAX).await.expect("claim") {
                let key = task.key();
                assert!(
                    held.lock().expect("held set").insert(key.clone()),
                    "{key} claimed while another claimer held it"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
                held.lock().expect("held set").remove(&key);
                store.mark_completed(&key, 4).await.expect("complete");
                done += 1;
            }
            done
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.expect("claimer task");
    }
    assert_eq!(total, 40);
    let counts = store.status_counts().await.expect("counts");
    assert_eq!(counts.completed, 40);
    assert_eq!(counts.pending + counts.in_progress, 0);
}

#[tokio::test]
async fn p0_claim_counts_one_attempt_per_claim() {
    let dir = TempDir::new().expect("temp dir");
    let store = StateStore::open(dir.path()).await.expect("open store");
    seed_tasks(&store, dir.path(), "item", 1).await;

    let first = store.claim_next(i64::MAX).await.expect("claim").expect("task");
    assert!(store.claim_next(i64::MAX).await.expect("claim").is_none());
    store
        .requeue(&first.key(), Some("timeout"), 0, false)
        .await
        .expect("requeue");
    let second = store.claim_next(i64::MAX).await.expect("claim").expect("task");

    assert_eq!(first.attempts, 1);
    assert_eq!(second.attempts, 2);
}

#[tokio::test]
async fn p0_worker_pool_downloads_each_file_once() {
    let server = require_mock_server!();
    let bodies: Vec<(String, Vec<u8>)> = (0..24)
        .map(|i| (format!("track{i:02}.mp3"), vec![b'x'; 100 + i]))
        .collect();
    let files: Vec<(&str, &[u8])> = bodies
        .iter()
        .map(|(name, body)| (name.as_str(), body.as_slice()))
        .collect();
    mount_item(&server, "album", &files).await;
    let dir = TempDir::new().expect("temp dir");

    let mut options = grabia_core::JobOptions::new(vec!["album".into()], dir.path().to_path_buf());
    options.max_workers = 8;
    options.dynamic_scaling = false;
    let summary = mirror_for(&server)
        .start(&options, CancellationToken::new())
        .await
        .expect("job runs");

    assert_eq!(summary.counts.completed, 24);
    assert_eq!(download_requests(&server).await, 24);
    for (name, body) in &bodies {
        let on_disk = std::fs::read(dir.path().join("album").join(name)).expect("file exists");
        assert_eq!(&on_disk, body, "{name} content");
    }
}

#[tokio::test]
async fn p0_scaling_pool_with_slow_responses_dispatches_each_file_once() {
    let server = require_mock_server!();
    let bodies: Vec<(String, Vec<u8>)> = (0..30)
        .map(|i| (format!("track{i:02}.mp3"), vec![b'y'; 64 + i]))
        .collect();
    let listing: Vec<_> = bodies
        .iter()
        .map(|(name, body)| json!({"name": name, "size": body.len().to_string()}))
        .collect();
    mount_metadata(&server, "album", json!({ "files": listing })).await;
    for (name, body) in &bodies {
        Mock::given(method("GET"))
            .and(path(format!("/download/album/{name}")))
            .respond_with(RangeResponder::delayed(body, Duration::from_millis(80)))
            .mount(&server)
            .await;
    }
    let dir = TempDir::new().expect("temp dir");

    let mut options = grabia_core::JobOptions::new(vec!["album".into()], dir.path().to_path_buf());
    options.max_workers = 8;
    options.dynamic_scaling = true;
    let summary = mirror_for(&server)
        .start(&options, CancellationToken::new())
        .await
        .expect("job runs");

    assert_eq!(summary.counts.completed, 30);
    assert_eq!(summary.run.completed, 30);
    assert_eq!(summary.run.failed, 0);
    assert_eq!(summary.run.retried, 0);
    assert_eq!(summary.run.cancelled, 0);
    assert!(summary.run.peak_workers <= 8, "peak {}", summary.run.peak_workers);

    let mut per_path: HashMap<String, usize> = HashMap::new();
    for request in server.received_requests().await.unwrap_or_default() {
        if request.url.path().starts_with("/download/") {
            *per_path.entry(request.url.path().to_string()).or_default() += 1;
        }
    }
    assert_eq!(per_path.len(), 30);
    assert!(per_path.values().all(|&n| n == 1), "{per_path:?}");
}
