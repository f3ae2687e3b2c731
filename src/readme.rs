//! Generated `README.txt` placed at the root of each mirrored item.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::download::item_dir;
use crate::filter::README_FILE_NAME;
use crate::manifest::{RemoteFile, details_url};

/// Renders the README text for an item.
#[must_use]
pub fn render(item_id: &str, files: &[RemoteFile]) -> String {
    let total: u64 = files.iter().filter_map(|f| f.size_bytes).sum();
    let unknown = files.iter().filter(|f| f.size_bytes.is_none()).count();

    let mut text = String::new();
    let _ = writeln!(text, "{item_id}");
    let _ = writeln!(text, "{}", "=".repeat(item_id.chars().count().max(3)));
    let _ = writeln!(text);
    let _ = writeln!(text, "Source: {}", details_url(item_id));
    let _ = writeln!(text, "Files selected: {}", files.len());
    if unknown > 0 {
        let _ = writeln!(text, "Declared size: {total} bytes ({unknown} files of unknown size)");
    } else {
        let _ = writeln!(text, "Declared size: {total} bytes");
    }
    let _ = writeln!(text);
    for file in files {
        match file.size_bytes {
            Some(size) => {
                let _ = writeln!(text, "  {}  ({size} bytes)", file.name);
            }
            None => {
                let _ = writeln!(text, "  {}", file.name);
            }
        }
    }
    let _ = writeln!(text);
    let _ = writeln!(
        text,
        "Mirrored with grabia {}. This file is kept by `grabia clean` unless --no-keep-readme is given.",
        env!("CARGO_PKG_VERSION")
    );
    text
}

/// Writes `<output_dir>/<item>/README.txt`, replacing any previous one.
///
/// # Errors
///
/// Returns the I/O error from creating the directory or writing the file.
pub async fn write_readme(
    output_dir: &Path,
    item_id: &str,
    files: &[RemoteFile],
) -> std::io::Result<PathBuf> {
    let dir = item_dir(output_dir, item_id);
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(README_FILE_NAME);
    tokio::fs::write(&path, render(item_id, files)).await?;
    debug!(item_id, path = %path.display(), "README written");
    Ok(path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_files_and_source() {
        let files = vec![
            RemoteFile::new("gd77", "a.mp3", Some(10)),
            RemoteFile::new("gd77", "b.flac", None),
        ];
        let text = render("gd77", &files);
        assert!(text.contains("https://archive.org/details/gd77"));
        assert!(text.contains("Files selected: 2"));
        assert!(text.contains("10 bytes (1 files of unknown size)"));
        assert!(text.contains("  a.mp3  (10 bytes)"));
        assert!(text.contains("  b.flac\n"));
    }

    #[tokio::test]
    async fn test_write_readme_creates_item_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_readme(dir.path(), "item", &[]).await.unwrap();
        assert_eq!(path, dir.path().join("item").join("README.txt"));
        assert!(std::fs::read_to_string(path).unwrap().contains("Files selected: 0"));
    }
}
