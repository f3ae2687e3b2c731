//! Shared utilities for critical tests (damaged state files, bulk task setup).

use std::path::{Path, PathBuf};

use grabia_core::state::{NewTask, STATE_DIR_NAME, STATE_DB_FILE};
use grabia_core::{StateStore, TaskKey};
use tempfile::TempDir;

/// Creates an output directory whose state database is garbage.
///
/// The returned `TempDir` must be kept alive for the path to stay valid.
pub fn corrupted_state_dir() -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state_dir = temp_dir.path().join(STATE_DIR_NAME);
    std::fs::create_dir_all(&state_dir).expect("Failed to create state dir");
    std::fs::write(
        state_dir.join(STATE_DB_FILE),
        b"not a valid sqlite file\x00\x00\x00 padding padding padding padding padding",
    )
    .expect("Failed to write corrupted db file");
    temp_dir
}

/// Creates a valid state database, then truncates it mid-page.
pub async fn truncated_state_dir() -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = StateStore::open(temp_dir.path()).await.expect("create store");
    seed_tasks(&store, temp_dir.path(), "item", 20).await;
    store.close().await;

    let db_path = temp_dir.path().join(STATE_DIR_NAME).join(STATE_DB_FILE);
    let content = std::fs::read(&db_path).expect("read db");
    let truncated_len = std::cmp::min(1536, content.len());
    std::fs::write(&db_path, &content[..truncated_len]).expect("truncate");
    for sidecar in ["-wal", "-shm"] {
        let mut path = db_path.clone().into_os_string();
        path.push(sidecar);
        let _ = std::fs::remove_file(PathBuf::from(path));
    }
    temp_dir
}

/// Registers `count` pending tasks named `f000.bin`, `f001.bin`, ... for `item`.
pub async fn seed_tasks(store: &StateStore, output_dir: &Path, item: &str, count: usize) {
    for i in 0..count {
        let name = format!("f{i:03}.bin");
        store
            .register(&NewTask {
                key: TaskKey::new(item, &name),
                target_path: output_dir.join(item).join(&name),
                size_bytes: Some(4),
            })
            .await
            .expect("register task");
    }
}
