//! Item list loading.
//!
//! Lists are plain text (one identifier per line) or CSV (identifier in the
//! first column). Lines may also hold an archive.org URL, which is reduced
//! to its identifier. Blank lines, `#` comments and an `identifier` header
//! are ignored; duplicates are dropped keeping first-seen order.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

static ARCHIVE_URL: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:https?://)?(?:www\.)?archive\.org/(?:details|download|metadata)/([^/?#\s]+)")
        .ok()
});

/// Errors loading an item list. Fatal for a run.
#[derive(Debug, Error)]
pub enum InputError {
    /// The list could not be read.
    #[error("cannot read item list {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The list held no identifiers.
    #[error("item list {} contains no identifiers", path.display())]
    Empty { path: PathBuf },
}

/// List file flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Text,
    Csv,
}

impl ListFormat {
    /// Picks the format from the file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::Text,
        }
    }
}

/// Reads and parses an item list file.
///
/// # Errors
///
/// Returns [`InputError::Io`] when the file cannot be read and
/// [`InputError::Empty`] when it yields no identifier.
#[instrument]
pub async fn load_item_list(path: &Path) -> Result<Vec<String>, InputError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    let items = parse_item_list(&text, ListFormat::from_path(path));
    if items.is_empty() {
        return Err(InputError::Empty {
            path: path.to_path_buf(),
        });
    }
    debug!(count = items.len(), "item list loaded");
    Ok(items)
}

/// Parses list text into unique identifiers.
#[must_use]
pub fn parse_item_list(text: &str, format: ListFormat) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for line in text.lines() {
        let line = line.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cell = match format {
            ListFormat::Text => line.to_string(),
            ListFormat::Csv => first_csv_cell(line),
        };
        let Some(id) = normalize_identifier(&cell) else {
            warn!(line, "ignoring unusable item list entry");
            continue;
        };
        if format == ListFormat::Csv && id.eq_ignore_ascii_case("identifier") {
            continue;
        }
        if seen.insert(id.clone()) {
            items.push(id);
        }
    }
    items
}

/// Reduces a list entry to a bare identifier.
///
/// Accepts plain identifiers and `archive.org/{details,download,metadata}/…`
/// URLs. Returns `None` for entries that are empty or contain whitespace.
#[must_use]
pub fn normalize_identifier(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let id = ARCHIVE_URL
        .as_ref()
        .and_then(|re| re.captures(raw))
        .and_then(|caps| caps.get(1))
        .map_or(raw, |m| m.as_str());
    let id = urlencoding::decode(id).map_or_else(|_| id.to_string(), |d| d.into_owned());
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return None;
    }
    Some(id)
}

/// First cell of a CSV row, honouring double quotes.
fn first_csv_cell(line: &str) -> String {
    let mut cell = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => break,
            _ => cell.push(c),
        }
    }
    cell.trim().to_string()
}
