//! Reduction of a raw manifest to the set of files a run selects.
//!
//! [`select`] is pure and order-preserving. Stages run in a fixed order:
//!
//! 1. anti-clutter (fixed, always on)
//! 2. extension whitelist
//! 3. name regex (matches anywhere in the name)
//! 4. metadata-only
//!
//! Metadata-only is the last stage and always narrows the result to the
//! metadata formats, whatever the whitelist allowed.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::RemoteFile;

/// Server-generated housekeeping files never worth mirroring.
const ANTI_CLUTTER_PATTERNS: [&str; 5] = [
    r"_meta\.xml$",
    r"_meta\.sqlite$",
    r"_files\.xml$",
    r"_thumb\.jpg$",
    r"_itemimage\.jpg$",
];

/// Extensions kept by metadata-only mode.
const METADATA_EXTENSIONS: [&str; 3] = ["xml", "json", "txt"];

/// Name of the README file written next to mirrored items.
pub const README_FILE_NAME: &str = "README.txt";

static ANTI_CLUTTER: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    ANTI_CLUTTER_PATTERNS
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
});

/// Filter configuration errors. Fatal for a run.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The name filter did not compile.
    #[error("invalid file name regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Serializable form of [`FilterConfig`], stored with the job settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub metadata_only: bool,
    #[serde(default = "default_keep_readme")]
    pub keep_readme: bool,
}

fn default_keep_readme() -> bool {
    true
}

/// Compiled selection rules.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    extensions: Vec<String>,
    regex: Option<Regex>,
    metadata_only: bool,
    keep_readme: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            regex: None,
            metadata_only: false,
            keep_readme: true,
        }
    }
}

impl FilterConfig {
    /// Compiles a filter from its parts.
    ///
    /// Extensions are trimmed, lowercased and stripped of a leading dot;
    /// blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidRegex`] when `regex` does not compile.
    pub fn from_spec(spec: &FilterSpec) -> Result<Self, FilterError> {
        let regex = spec
            .regex
            .as_deref()
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| FilterError::InvalidRegex {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;

        let mut extensions: Vec<String> = spec
            .extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        extensions.dedup();

        Ok(Self {
            extensions,
            regex,
            metadata_only: spec.metadata_only,
            keep_readme: spec.keep_readme,
        })
    }

    /// Round-trips back to the serializable form.
    #[must_use]
    pub fn to_spec(&self) -> FilterSpec {
        FilterSpec {
            extensions: self.extensions.clone(),
            regex: self.regex.as_ref().map(|re| re.as_str().to_string()),
            metadata_only: self.metadata_only,
            keep_readme: self.keep_readme,
        }
    }

    #[must_use]
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    #[must_use]
    pub fn metadata_only(&self) -> bool {
        self.metadata_only
    }

    #[must_use]
    pub fn keep_readme(&self) -> bool {
        self.keep_readme
    }

    /// Returns whether a single name passes every stage.
    #[must_use]
    pub fn accepts(&self, name: &str) -> bool {
        if is_clutter(name) {
            return false;
        }
        let lower = name.to_ascii_lowercase();
        if !self.extensions.is_empty()
            && !self
                .extensions
                .iter()
                .any(|ext| lower.ends_with(&format!(".{ext}")))
        {
            return false;
        }
        if let Some(regex) = &self.regex
            && !regex.is_match(name)
        {
            return false;
        }
        if self.metadata_only && !is_metadata_name(&lower) {
            return false;
        }
        true
    }
}

/// Applies the filter pipeline, preserving manifest order.
#[must_use]
pub fn select(files: &[RemoteFile], cfg: &FilterConfig) -> Vec<RemoteFile> {
    files
        .iter()
        .filter(|file| cfg.accepts(&file.name))
        .cloned()
        .collect()
}

/// Returns true for server-generated housekeeping files.
#[must_use]
pub fn is_clutter(name: &str) -> bool {
    ANTI_CLUTTER.iter().any(|re| re.is_match(name))
}

fn is_metadata_name(lower: &str) -> bool {
    METADATA_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(&format!(".{ext}")))
        || lower.rsplit('/').next().is_some_and(|base| base.contains("readme"))
}
