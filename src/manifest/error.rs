//! Error types for manifest resolution.

use thiserror::Error;

/// Failure to obtain the file listing of one item.
///
/// Always scoped to a single item: the caller records it and moves on.
#[derive(Debug, Clone, Error)]
pub enum ManifestError {
    /// The metadata request failed, returned an error status, or did not
    /// contain a usable file listing.
    #[error("manifest unavailable for {item_id}: {cause}")]
    Unavailable {
        /// Item whose listing could not be obtained.
        item_id: String,
        /// Human-readable cause.
        cause: String,
    },
}

impl ManifestError {
    /// Creates an `Unavailable` error.
    pub fn unavailable(item_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Unavailable {
            item_id: item_id.into(),
            cause: cause.into(),
        }
    }

    /// Item the error refers to.
    #[must_use]
    pub fn item_id(&self) -> &str {
        match self {
            Self::Unavailable { item_id, .. } => item_id,
        }
    }

    /// Human-readable cause without the item prefix.
    #[must_use]
    pub fn cause(&self) -> &str {
        match self {
            Self::Unavailable { cause, .. } => cause,
        }
    }
}
