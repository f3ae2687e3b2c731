//! P0: a damaged state database is fatal and never silently replaced.

use grabia_core::db::Database;
use grabia_core::{ArchiveEndpoints, HttpClient, JobOptions, Mirror, StateStore, TaskKey};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::support::critical_utils::{corrupted_state_dir, seed_tasks, truncated_state_dir};

fn offline_mirror() -> Mirror {
    // Nothing listens here; corruption must be detected before any request.
    Mirror::new(
        HttpClient::new(),
        ArchiveEndpoints::with_root("http://127.0.0.1:9").expect("valid root"),
    )
}

#[tokio::test]
async fn p0_corrupted_state_open_is_corruption() {
    let dir = corrupted_state_dir();

    let err = StateStore::open(dir.path())
        .await
        .expect_err("opening corrupted state should fail");

    assert!(err.is_corruption(), "expected corruption, got {err:?}");
    assert!(err.to_string().contains("--fresh"));
}

#[tokio::test]
async fn p0_start_on_corrupted_state_is_fatal() {
    let dir = corrupted_state_dir();
    let options = JobOptions::new(vec!["item".into()], dir.path().to_path_buf());

    let err = offline_mirror()
        .start(&options, CancellationToken::new())
        .await
        .expect_err("start must refuse corrupted state");

    assert!(err.is_corruption(), "expected corruption, got {err:?}");
}

#[tokio::test]
async fn p0_resume_and_status_on_corrupted_state_are_fatal() {
    let dir = corrupted_state_dir();

    let resume = offline_mirror()
        .resume(dir.path(), None, CancellationToken::new())
        .await
        .expect_err("resume must refuse corrupted state");
    assert!(resume.is_corruption());

    let status = Mirror::status(dir.path())
        .await
        .expect_err("status must refuse corrupted state");
    assert!(status.is_corruption());
}

#[tokio::test]
async fn p0_corrupted_state_file_is_left_in_place() {
    let dir = corrupted_state_dir();
    let db_path = grabia_core::state::state_db_path(dir.path());
    let before = std::fs::read(&db_path).expect("read");

    let _ = StateStore::open(dir.path()).await;

    assert_eq!(std::fs::read(&db_path).expect("read"), before);
}

#[tokio::test]
#[ignore] // depends on SQLite page-size behaviour; run with --ignored
async fn p0_truncated_state_open_fails() {
    let dir = truncated_state_dir().await;

    let result = StateStore::open(dir.path()).await;

    assert!(result.is_err(), "opening truncated state should fail");
}

#[tokio::test]
async fn p0_state_persists_after_reopen() {
    let dir = TempDir::new().expect("temp dir");
    {
        let store = StateStore::open(dir.path()).await.expect("create store");
        seed_tasks(&store, dir.path(), "item", 3).await;
        let claimed = store.claim_next(i64::MAX).await.expect("claim").expect("task");
        store
            .mark_completed(&claimed.key(), 4)
            .await
            .expect("complete");
        store.close().await;
    }

    let store = StateStore::open(dir.path()).await.expect("reopen store");
    let counts = store.status_counts().await.expect("counts");
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.pending, 2);
    let task = store
        .get(&TaskKey::new("item", "f000.bin"))
        .await
        .expect("get")
        .expect("task still there");
    assert_eq!(task.bytes_done, 4);
}

#[tokio::test]
async fn p0_state_database_uses_wal() {
    let dir = TempDir::new().expect("temp dir");
    let db = Database::new(&dir.path().join("good.db"))
        .await
        .expect("create valid db");
    assert!(db.is_wal_enabled().await.expect("pragma journal_mode"));
}
