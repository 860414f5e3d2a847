//! Verifying a game directory and re-fetching what is broken.
//!
//! [`verify_files`] checks an expected file set with bounded concurrency.
//! [`RepairService`] deletes corrupted files, enqueues every missing or
//! corrupted file on a [`DownloadManager`] at its repair priority, waits for
//! the session to drain, then verifies the same files again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use futures_util::{StreamExt, stream};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::download::{ExpectedHash, FileState, check_file, discard};
use crate::manifest::ExpectedFile;
use crate::scheduler::{CompletionSummary, DownloadManager, ManagerError, TaskError};

/// Default number of files hashed at once.
pub const DEFAULT_VERIFY_CONCURRENCY: usize = 16;

/// Errors that abort a repair run. Individual download failures do not;
/// they show up in [`RepairReport::remaining`].
#[derive(Debug, Error)]
pub enum RepairError {
    /// The manager refused the tasks (stopped, id conflict).
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// An expected file could not be turned into a task.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Files sorted by their on-disk state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Number of files examined.
    pub checked: usize,
    /// Number of files that matched.
    pub valid: usize,
    /// Files absent from disk.
    pub missing: Vec<PathBuf>,
    /// Files present with the wrong size or digest.
    pub corrupted: Vec<PathBuf>,
}

impl VerificationReport {
    /// `true` when every checked file was valid.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupted.is_empty()
    }

    /// Missing plus corrupted.
    #[must_use]
    pub fn broken(&self) -> usize {
        self.missing.len() + self.corrupted.len()
    }
}

/// Outcome of [`RepairService::repair`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// State before anything was touched.
    pub before: VerificationReport,
    /// Download session summary; `None` when nothing needed fetching.
    pub downloads: Option<CompletionSummary>,
    /// State after the downloads finished.
    pub after: VerificationReport,
}

impl RepairReport {
    /// Files still broken after the repair.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.after.broken()
    }
}

async fn classify(file: &ExpectedFile) -> FileState {
    // A digest that does not parse cannot be checked; fall back to size only.
    let expected = file
        .sha1
        .as_deref()
        .filter(|s| !s.is_empty())
        .and_then(|s| ExpectedHash::parse(s).ok());
    let size = (file.size > 0).then_some(file.size);
    check_file(&file.path, size, expected.as_ref()).await
}

/// Checks every file in `files`, at most `concurrency` at a time.
#[instrument(level = "debug", skip(files), fields(files = files.len()))]
pub async fn verify_files(files: &[ExpectedFile], concurrency: usize) -> VerificationReport {
    let states: Vec<(&ExpectedFile, FileState)> = stream::iter(files)
        .map(|file| async move { (file, classify(file).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut report = VerificationReport {
        checked: states.len(),
        ..VerificationReport::default()
    };
    for (file, state) in states {
        match state {
            FileState::Valid => report.valid += 1,
            FileState::Missing => report.missing.push(file.path.clone()),
            FileState::Corrupted => report.corrupted.push(file.path.clone()),
        }
    }
    report
}

/// Verifies and repairs a file set through a download manager.
///
/// The manager deduplicates by destination for the whole session, so a
/// file already completed in the current session is not fetched again.
/// Use a fresh manager (or [`DownloadManager::reset`]) per repair run.
#[derive(Clone)]
pub struct RepairService {
    manager: DownloadManager,
    verify_concurrency: usize,
}

impl RepairService {
    /// Wraps `manager` with the default verification concurrency.
    #[must_use]
    pub fn new(manager: DownloadManager) -> Self {
        Self {
            manager,
            verify_concurrency: DEFAULT_VERIFY_CONCURRENCY,
        }
    }

    /// Overrides how many files are hashed at once.
    #[must_use]
    pub fn with_verify_concurrency(mut self, concurrency: usize) -> Self {
        self.verify_concurrency = concurrency.max(1);
        self
    }

    /// Verification without repair.
    pub async fn verify(&self, files: &[ExpectedFile]) -> VerificationReport {
        verify_files(files, self.verify_concurrency).await
    }

    /// Verifies `files`, re-fetches the broken ones, and verifies again.
    ///
    /// # Errors
    ///
    /// [`RepairError`] when tasks cannot be enqueued or the manager is
    /// stopped while waiting.
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn repair(&self, files: &[ExpectedFile]) -> Result<RepairReport, RepairError> {
        let before = self.verify(files).await;
        info!(
            checked = before.checked,
            missing = before.missing.len(),
            corrupted = before.corrupted.len(),
            "verification finished"
        );
        if before.is_clean() {
            return Ok(RepairReport {
                after: before.clone(),
                before,
                downloads: None,
            });
        }

        for path in &before.corrupted {
            discard(path).await;
        }

        let broken = select_broken(files, &before);
        let mut specs = Vec::with_capacity(broken.len());
        for file in &broken {
            specs.push(
                file.to_task(file.kind.repair_priority())?
                    .with_metadata("repair", true),
            );
        }
        self.manager.add_tasks(specs)?;
        let downloads = self.manager.wait_for_completion().await?;

        let broken_files: Vec<ExpectedFile> = broken.into_iter().cloned().collect();
        let rechecked = self.verify(&broken_files).await;
        let after = VerificationReport {
            checked: before.checked,
            valid: before.valid + rechecked.valid,
            missing: rechecked.missing,
            corrupted: rechecked.corrupted,
        };
        if after.is_clean() {
            info!(repaired = broken_files.len(), "repair finished");
        } else {
            warn!(remaining = after.broken(), "repair left broken files");
        }

        Ok(RepairReport {
            before,
            downloads: Some(downloads),
            after,
        })
    }
}

/// Files from `files` that `report` found missing or corrupted, in input order.
fn select_broken<'a>(files: &'a [ExpectedFile], report: &VerificationReport) -> Vec<&'a ExpectedFile> {
    let broken: HashSet<&Path> = report
        .missing
        .iter()
        .chain(&report.corrupted)
        .map(PathBuf::as_path)
        .collect();
    files
        .iter()
        .filter(|file| broken.contains(file.path.as_path()))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::manifest::FileKind;

    // sha1("hello")
    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    fn expected(dir: &Path, name: &str, size: u64, sha1: Option<&str>) -> ExpectedFile {
        ExpectedFile {
            kind: FileKind::Asset,
            url: format!("https://example.com/{name}"),
            path: dir.join(name),
            size,
            sha1: sha1.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_verify_classifies_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("good"), b"hello").await.unwrap();
        tokio::fs::write(dir.path().join("bad"), b"jello").await.unwrap();
        tokio::fs::write(dir.path().join("short"), b"hel").await.unwrap();

        let files = vec![
            expected(dir.path(), "good", 5, Some(HELLO_SHA1)),
            expected(dir.path(), "bad", 5, Some(HELLO_SHA1)),
            expected(dir.path(), "short", 5, None),
            expected(dir.path(), "gone", 5, Some(HELLO_SHA1)),
        ];
        let report = verify_files(&files, 2).await;

        assert_eq!(report.checked, 4);
        assert_eq!(report.valid, 1);
        assert_eq!(report.missing, vec![dir.path().join("gone")]);
        assert_eq!(
            report.corrupted,
            vec![dir.path().join("bad"), dir.path().join("short")]
        );
        assert_eq!(report.broken(), 3);
    }

    #[test]
    fn test_select_broken_keeps_input_order_over_large_sets() {
        let dir = Path::new("/game/assets");
        let files: Vec<ExpectedFile> = (0..20_000)
            .map(|i| expected(dir, &format!("obj-{i}"), 1, None))
            .collect();
        let report = VerificationReport {
            checked: files.len(),
            valid: files.len() - 3,
            missing: vec![dir.join("obj-19999"), dir.join("obj-7")],
            corrupted: vec![dir.join("obj-123")],
        };

        let names: Vec<&Path> = select_broken(&files, &report)
            .into_iter()
            .map(|file| file.path.as_path())
            .collect();
        assert_eq!(
            names,
            vec![dir.join("obj-7"), dir.join("obj-123"), dir.join("obj-19999")]
        );
    }

    #[tokio::test]
    async fn test_unknown_size_and_hash_only_requires_presence() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("any"), b"whatever").await.unwrap();
        let report = verify_files(&[expected(dir.path(), "any", 0, None)], 1).await;
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_clean_set_needs_no_downloads() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("good"), b"hello").await.unwrap();
        let manager = DownloadManager::new(crate::scheduler::ManagerConfig::default()).unwrap();

        let report = RepairService::new(manager)
            .repair(&[expected(dir.path(), "good", 5, Some(HELLO_SHA1))])
            .await
            .unwrap();

        assert!(report.downloads.is_none());
        assert_eq!(report.remaining(), 0);
        assert_eq!(report.after.valid, 1);
    }

    #[tokio::test]
    async fn test_repair_on_stopped_manager_errors_and_deletes_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad");
        tokio::fs::write(&bad, b"jello").await.unwrap();
        let config = crate::scheduler::ManagerConfig {
            temp_dir: dir.path().join("chunks"),
            ..crate::scheduler::ManagerConfig::default()
        };
        let manager = DownloadManager::new(config).unwrap();
        manager.stop().await;

        let err = RepairService::new(manager)
            .repair(&[expected(dir.path(), "bad", 5, Some(HELLO_SHA1))])
            .await
            .unwrap_err();

        assert!(matches!(err, RepairError::Manager(ManagerError::Stopped)));
        assert!(!bad.exists());
    }
}
