//! Source management errors.

use thiserror::Error;

/// Errors from [`MirrorResolver`](super::MirrorResolver) operations.
#[derive(Debug, Error)]
pub enum SourceError {
    /// No source with this key.
    #[error("unknown download source: {key}")]
    UnknownSource {
        /// Requested key.
        key: String,
    },

    /// Built-in sources cannot be removed or replaced.
    #[error("download source '{key}' is built in and cannot be modified")]
    BuiltIn {
        /// Requested key.
        key: String,
    },

    /// A custom source definition is unusable.
    #[error("invalid download source '{key}': {reason}")]
    InvalidSource {
        /// Requested key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Every probe failed.
    #[error("no download source is reachable")]
    NoneReachable,

    /// Every source failed for one request.
    #[error("all download sources failed for {url}: {last}")]
    AllSourcesFailed {
        /// Origin URL.
        url: String,
        /// Message of the last failure.
        last: String,
    },

    /// The probe HTTP client could not be built.
    #[error("failed to build source probe client: {source}")]
    Client {
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },
}

impl SourceError {
    /// Creates an unknown-source error.
    pub fn unknown(key: impl Into<String>) -> Self {
        Self::UnknownSource { key: key.into() }
    }

    /// Creates a built-in-source error.
    pub fn built_in(key: impl Into<String>) -> Self {
        Self::BuiltIn { key: key.into() }
    }

    /// Creates an invalid-source error.
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSource {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_error_display() {
        assert_eq!(
            SourceError::unknown("nope").to_string(),
            "unknown download source: nope"
        );
        assert!(SourceError::built_in("official").to_string().contains("built in"));
        assert_eq!(
            SourceError::NoneReachable.to_string(),
            "no download source is reachable"
        );
    }
}
