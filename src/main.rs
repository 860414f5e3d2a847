//! CLI entry point for assetfetch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use assetfetch_core::manifest::download_tasks;
use assetfetch_core::{
    AssetIndex, DownloadManager, ExpectedFile, ManagerConfig, MirrorResolver, Platform,
    RepairService, RetryPolicy, VersionManifest,
};
use clap::Parser;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use app_config::FileConfig;
use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let file_config = app_config::load_file_config(args.config.as_deref())?.unwrap_or_default();
    let settings = Settings::resolve(&args, &file_config)?;
    debug!(?settings, "resolved settings");

    let resolver = Arc::new(MirrorResolver::new()?);
    select_source(&resolver, settings.source.as_deref()).await?;

    let manifest = load_manifest(&resolver, &args.input).await?;
    info!(version = %manifest.id, game_dir = %settings.game_dir.display(), "version descriptor loaded");

    let manager = DownloadManager::with_resolver(settings.manager.clone(), resolver.clone())?;
    let show_progress = settings.progress && !args.quiet;
    let (progress_handle, progress_stop) = progress::spawn_progress_ui(show_progress, &manager);

    let result = if args.repair {
        run_repair(&manager, &manifest, &settings.game_dir).await
    } else {
        run_download(&manager, &manifest, &settings.game_dir).await
    };

    progress::stop_progress_ui(progress_handle, &progress_stop).await;

    let failed = result?;
    let stats = manager.stats();
    info!(
        completed = stats.completed_files,
        failed = stats.failed_files,
        total = stats.total_files,
        "Download complete"
    );
    manager.stop().await;

    if failed > 0 {
        for task in manager.failed_tasks() {
            warn!(
                file = %task.dest.display(),
                error = task.last_error.as_deref().unwrap_or("unknown error"),
                "failed"
            );
        }
        bail!("{failed} file(s) could not be downloaded");
    }
    Ok(())
}

/// Effective settings after merging the config file and CLI flags.
#[derive(Debug, Clone)]
struct Settings {
    game_dir: PathBuf,
    source: Option<String>,
    progress: bool,
    manager: ManagerConfig,
}

impl Settings {
    fn resolve(args: &Args, file: &FileConfig) -> Result<Self> {
        let game_dir = args
            .game_dir
            .clone()
            .or_else(|| file.game_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut manager = ManagerConfig::default();
        let controller = &mut manager.controller;
        if let Some(min) = args.min_concurrency.map(usize::from).or(file.min_concurrency) {
            controller.min_concurrency = min;
        }
        if let Some(max) = args.max_concurrency.map(usize::from).or(file.max_concurrency) {
            controller.max_concurrency = max;
        }
        match args
            .initial_concurrency
            .map(usize::from)
            .or(file.initial_concurrency)
        {
            Some(initial) => controller.initial_concurrency = initial,
            None if controller.min_concurrency <= controller.max_concurrency => {
                controller.initial_concurrency = controller
                    .initial_concurrency
                    .clamp(controller.min_concurrency, controller.max_concurrency);
            }
            None => {}
        }
        if let Some(retries) = args.max_retries.map(u32::from).or(file.max_retries) {
            manager.retry = RetryPolicy::with_max_retries(retries);
        }
        if let Some(threads) = file.threads_per_file {
            manager.max_threads_per_file = threads;
        }
        manager
            .validate()
            .context("Invalid concurrency or retry settings")?;

        Ok(Self {
            game_dir,
            source: args.source.clone().or_else(|| file.source.clone()),
            progress: !args.no_progress && file.progress.unwrap_or(true),
            manager,
        })
    }
}

async fn select_source(resolver: &MirrorResolver, source: Option<&str>) -> Result<()> {
    match source {
        None => {}
        Some("auto") => match resolver.select_best().await {
            Ok(key) => info!(source = %key, "selected fastest source"),
            Err(error) => warn!(error = %error, source = %resolver.current(), "source probe failed, keeping default"),
        },
        Some(key) => resolver
            .set_current(key)
            .with_context(|| format!("Cannot use source '{key}'"))?,
    }
    Ok(())
}

async fn load_manifest(resolver: &MirrorResolver, input: &str) -> Result<VersionManifest> {
    if input.starts_with("http://") || input.starts_with("https://") {
        let response = resolver
            .fetch_with_fallback(input)
            .await
            .with_context(|| format!("Failed to fetch version descriptor '{input}'"))?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read version descriptor '{input}'"))?;
        return VersionManifest::from_slice(&bytes).context("Invalid version descriptor");
    }
    VersionManifest::load(Path::new(input))
        .await
        .with_context(|| format!("Failed to load version descriptor '{input}'"))
}

async fn asset_files(manifest: &VersionManifest, game_dir: &Path) -> Result<Vec<ExpectedFile>> {
    let Some(index_path) = manifest.asset_index_path(game_dir) else {
        return Ok(Vec::new());
    };
    let index = AssetIndex::load(&index_path)
        .await
        .context("Asset index unavailable after download")?;
    Ok(index.expected_files(game_dir))
}

/// Downloads version files, then assets. Returns the number of failed files.
async fn run_download(
    manager: &DownloadManager,
    manifest: &VersionManifest,
    game_dir: &Path,
) -> Result<usize> {
    let files = manifest.expected_files(game_dir, &Platform::current());
    info!(files = files.len(), "downloading version files");
    manager.add_tasks(download_tasks(&files)?)?;
    let summary = manager.wait_for_completion().await?;
    if manifest.asset_index.is_some() && !summary.is_success() {
        // The index may be among the failures; assets cannot be listed then.
        if let Some(path) = manifest.asset_index_path(game_dir)
            && !path.exists()
        {
            return Ok(summary.failed);
        }
    }

    let assets = asset_files(manifest, game_dir).await?;
    info!(files = assets.len(), "downloading assets");
    manager.add_tasks(download_tasks(&assets)?)?;
    let summary = manager.wait_for_completion().await?;
    Ok(summary.failed)
}

/// Verifies and repairs version files, then assets.
async fn run_repair(
    manager: &DownloadManager,
    manifest: &VersionManifest,
    game_dir: &Path,
) -> Result<usize> {
    let service = RepairService::new(manager.clone());
    let files = manifest.expected_files(game_dir, &Platform::current());
    let report = service.repair(&files).await?;
    info!(
        checked = report.before.checked,
        broken = report.before.broken(),
        remaining = report.remaining(),
        "version files verified"
    );
    let mut remaining = report.remaining();

    if let Some(path) = manifest.asset_index_path(game_dir)
        && path.exists()
    {
        let assets = asset_files(manifest, game_dir).await?;
        let report = service.repair(&assets).await?;
        info!(
            checked = report.before.checked,
            broken = report.before.broken(),
            remaining = report.remaining(),
            "assets verified"
        );
        remaining += report.remaining();
    }
    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["assetfetch", "v.json"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::resolve(&args(&[]), &FileConfig::default()).unwrap();
        assert_eq!(settings.game_dir, PathBuf::from("."));
        assert!(settings.progress);
        assert!(settings.source.is_none());
        assert_eq!(settings.manager.controller.initial_concurrency, 12);
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig {
            game_dir: Some(PathBuf::from("/from/file")),
            source: Some("official".into()),
            max_concurrency: Some(20),
            max_retries: Some(1),
            progress: Some(false),
            ..FileConfig::default()
        };
        let settings =
            Settings::resolve(&args(&["--game-dir", "/cli", "--max-concurrency", "30"]), &file)
                .unwrap();
        assert_eq!(settings.game_dir, PathBuf::from("/cli"));
        assert_eq!(settings.source.as_deref(), Some("official"));
        assert_eq!(settings.manager.controller.max_concurrency, 30);
        assert_eq!(settings.manager.retry.max_retries(), 1);
        assert!(!settings.progress);
    }

    #[test]
    fn test_initial_clamped_into_narrow_bounds() {
        let settings = Settings::resolve(
            &args(&["--min-concurrency", "1", "--max-concurrency", "4"]),
            &FileConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.manager.controller.initial_concurrency, 4);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let result = Settings::resolve(
            &args(&["--min-concurrency", "9", "--max-concurrency", "4"]),
            &FileConfig::default(),
        );
        assert!(result.is_err());
    }
}
