//! Progress bar for download runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use assetfetch_core::{AggregateStats, DownloadEvent, DownloadManager};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

const REFRESH: Duration = Duration::from_millis(120);

/// Spawns the progress bar when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already true.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    manager: &DownloadManager,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let handle = spawn_bar_inner(manager.clone(), Arc::clone(&stop));
    (Some(handle), stop)
}

/// Signals the progress task to stop and waits for it.
///
/// Returns false when the task panicked; the panic is logged, not propagated.
pub(crate) async fn stop_progress_ui(
    handle: Option<tokio::task::JoinHandle<()>>,
    stop: &AtomicBool,
) -> bool {
    stop.store(true, Ordering::SeqCst);
    let Some(handle) = handle else {
        return true;
    };
    match handle.await {
        Ok(()) => true,
        Err(error) => {
            warn!(error = %error, "progress display task failed");
            false
        }
    }
}

fn spawn_bar_inner(manager: DownloadManager, stop: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner} [{bar:30}] {bytes}/{total_bytes} {binary_bytes_per_sec} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
        );
        bar.enable_steady_tick(Duration::from_millis(100));

        while !stop.load(Ordering::SeqCst) {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(DownloadEvent::TaskFailed { dest_name, error, .. }) => {
                        bar.println(format!("failed: {dest_name}: {error}"));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                () = tokio::time::sleep(REFRESH) => {
                    render(&bar, &manager.stats());
                }
            }
        }

        bar.finish_and_clear();
    })
}

fn render(bar: &ProgressBar, stats: &AggregateStats) {
    bar.set_length(stats.total_bytes.max(stats.downloaded_bytes));
    bar.set_position(stats.downloaded_bytes);
    bar.set_message(status_line(stats));
}

fn status_line(stats: &AggregateStats) -> String {
    let mut line = format!(
        "[{}/{}] {} active",
        stats.finished_files(),
        stats.total_files,
        stats.active_count
    );
    if stats.failed_files > 0 {
        line.push_str(&format!(", {} failed", stats.failed_files));
    }
    line
}
