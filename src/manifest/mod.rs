//! Turning version descriptors and asset indexes into download tasks.
//!
//! The scheduler treats its input as an opaque list of [`TaskSpec`]s; this
//! module is one producer of that list. It knows the game directory layout
//! (`versions/`, `libraries/`, `assets/`) and the priority each kind of file
//! gets on a fresh install and during repair.
//!
//! ```
//! use std::path::Path;
//!
//! use assetfetch_core::manifest::{AssetIndex, download_tasks};
//!
//! let index = AssetIndex::from_slice(br#"{"objects":{
//!     "icons/icon_16x16.png":{"hash":"bdf48ef6b5d0d23bbb02e17d04865216179f510a","size":3665}
//! }}"#).unwrap();
//! let files = index.expected_files(Path::new("game"));
//! let tasks = download_tasks(&files).unwrap();
//! assert_eq!(tasks[0].priority(), 1);
//! ```

mod rules;
mod version;

pub use rules::{OsName, OsRule, Platform, Rule, RuleAction, rules_allow};
pub use version::{
    Artifact, AssetIndex, AssetIndexRef, AssetObject, Library, LibraryDownloads, Logging,
    LoggingEntry, LoggingFile, VersionDownloads, VersionManifest, maven_path,
};

use std::path::PathBuf;

use thiserror::Error;

use crate::scheduler::{TaskError, TaskSpec};

/// Base URL of the content-addressed asset store.
pub const ASSET_BASE_URL: &str = "https://resources.download.minecraft.net";

/// Errors raised while reading descriptors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The document is not valid JSON for the expected shape.
    #[error("failed to parse descriptor: {source}")]
    Parse {
        /// Underlying parse error.
        #[from]
        source: serde_json::Error,
    },

    /// The descriptor file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A derived task descriptor was rejected.
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl ManifestError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Category of a game file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// The client JAR.
    Client,
    /// The asset index JSON.
    AssetIndex,
    /// A library archive.
    Library,
    /// A platform-specific natives archive.
    Natives,
    /// The logging configuration.
    Logging,
    /// A content-addressed asset object.
    Asset,
}

impl FileKind {
    /// Stable lowercase name, used as the task kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::AssetIndex => "asset-index",
            Self::Library => "library",
            Self::Natives => "natives",
            Self::Logging => "logging",
            Self::Asset => "asset",
        }
    }

    /// Priority on a fresh download.
    #[must_use]
    pub fn download_priority(self) -> i32 {
        match self {
            Self::Client => 10,
            Self::AssetIndex => 8,
            Self::Library | Self::Natives => 5,
            Self::Logging => 3,
            Self::Asset => 1,
        }
    }

    /// Priority when re-fetching a missing or corrupted file. Libraries jump
    /// ahead of the index here since the index is usually intact.
    #[must_use]
    pub fn repair_priority(self) -> i32 {
        match self {
            Self::Client => 10,
            Self::Library => 8,
            Self::AssetIndex => 7,
            Self::Natives => 6,
            Self::Asset => 5,
            Self::Logging => 3,
        }
    }
}

/// One file the game directory should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFile {
    /// Category.
    pub kind: FileKind,
    /// Origin URL.
    pub url: String,
    /// Absolute or game-dir-relative destination.
    pub path: PathBuf,
    /// Expected size; 0 when unknown.
    pub size: u64,
    /// Expected SHA-1 digest in hex.
    pub sha1: Option<String>,
}

impl ExpectedFile {
    /// Builds the task descriptor for this file at `priority`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] when the URL or digest is malformed.
    pub fn to_task(&self, priority: i32) -> Result<TaskSpec, TaskError> {
        let mut builder = TaskSpec::builder(self.url.clone(), self.path.clone())
            .priority(priority)
            .size(self.size)
            .kind(self.kind.as_str());
        if let Some(sha1) = self.sha1.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.hash(sha1);
        }
        builder.build()
    }
}

/// Task descriptors for a fresh download of `files`.
///
/// # Errors
///
/// Stops at the first file whose descriptor is rejected.
pub fn download_tasks(files: &[ExpectedFile]) -> Result<Vec<TaskSpec>, TaskError> {
    files
        .iter()
        .map(|file| file.to_task(file.kind.download_priority()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn file(kind: FileKind, sha1: Option<&str>) -> ExpectedFile {
        ExpectedFile {
            kind,
            url: "https://example.com/f".into(),
            path: PathBuf::from("game/f"),
            size: 10,
            sha1: sha1.map(str::to_string),
        }
    }

    #[test]
    fn test_priorities_by_kind() {
        assert!(FileKind::Client.download_priority() > FileKind::AssetIndex.download_priority());
        assert!(FileKind::Library.download_priority() > FileKind::Logging.download_priority());
        assert_eq!(FileKind::Asset.download_priority(), 1);
        assert!(FileKind::Library.repair_priority() > FileKind::AssetIndex.repair_priority());
        assert!(FileKind::Asset.repair_priority() > FileKind::Logging.repair_priority());
    }

    #[test]
    fn test_to_task_carries_kind_and_hash() {
        let task = file(FileKind::Library, Some("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"))
            .to_task(5)
            .unwrap();
        assert_eq!(task.kind(), Some("library"));
        assert_eq!(task.priority(), 5);
        assert_eq!(task.size(), 10);
        assert!(task.expected_hash().is_some());
    }

    #[test]
    fn test_empty_hash_is_ignored() {
        let task = file(FileKind::Asset, Some("")).to_task(1).unwrap();
        assert!(task.expected_hash().is_none());
    }

    #[test]
    fn test_malformed_hash_is_rejected() {
        let err = file(FileKind::Asset, Some("xyz")).to_task(1).unwrap_err();
        assert!(matches!(err, TaskError::InvalidHash { .. }));
    }
}
