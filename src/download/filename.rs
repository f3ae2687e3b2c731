//! Local path mapping for remote file names.
//!
//! Manifest names may contain `/` for nested files. Each segment is sanitized
//! on its own so the tree structure survives while no segment can escape the
//! item directory.

use std::path::{Component, Path, PathBuf};

/// Replaces characters that are invalid in file names on common platforms.
///
/// `.` and `..` segments are rewritten so the result is always a plain name.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            // Also handle null and control characters
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Maps a manifest file name to a path relative to the item directory.
///
/// Empty segments (from `a//b` or a leading `/`) are dropped.
#[must_use]
pub fn item_relative_path(file_name: &str) -> PathBuf {
    let mut path = PathBuf::new();
    for segment in file_name.split('/').filter(|segment| !segment.is_empty()) {
        path.push(sanitize_filename(segment));
    }
    if path.as_os_str().is_empty() {
        path.push("_");
    }
    path
}

/// Directory holding the files of one item.
#[must_use]
pub fn item_dir(output_dir: &Path, item_id: &str) -> PathBuf {
    output_dir.join(sanitize_filename(item_id))
}

/// Full local destination for a remote file.
#[must_use]
pub fn target_path(output_dir: &Path, item_id: &str, file_name: &str) -> PathBuf {
    item_dir(output_dir, item_id).join(item_relative_path(file_name))
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
