//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Download and verify a game version: client, libraries, natives, logging
/// config and every asset object.
///
/// INPUT is a version descriptor, either a local JSON file or an http(s) URL.
#[derive(Parser, Debug)]
#[command(name = "assetfetch")]
#[command(author, version, about)]
pub struct Args {
    /// Version descriptor path or URL
    #[arg(value_name = "INPUT")]
    pub input: String,

    /// Game directory to install into
    #[arg(short = 'd', long, value_name = "DIR")]
    pub game_dir: Option<PathBuf>,

    /// Download source key, or "auto" to probe and pick the fastest
    #[arg(short = 's', long, value_name = "KEY")]
    pub source: Option<String>,

    /// Lower bound for the adaptive concurrency ceiling (1-256)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub min_concurrency: Option<u16>,

    /// Upper bound for the adaptive concurrency ceiling (1-256)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub max_concurrency: Option<u16>,

    /// Starting concurrency ceiling (1-256)
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..=256))]
    pub initial_concurrency: Option<u16>,

    /// Retries per file after the first attempt (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Verify existing files and re-fetch only the missing or corrupted ones
    #[arg(long)]
    pub repair: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Read defaults from this config file instead of the default location
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
