//! Optional config file supplying CLI defaults.
//!
//! The format is a flat `key = value` subset of TOML: strings are
//! double-quoted, integers and booleans are bare, `#` starts a comment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Defaults read from the config file. Every field is optional; CLI flags win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Game directory to install into.
    pub game_dir: Option<PathBuf>,
    /// Source key, or "auto" to pick the fastest.
    pub source: Option<String>,
    /// Lower bound for the adaptive ceiling.
    pub min_concurrency: Option<usize>,
    /// Upper bound for the adaptive ceiling.
    pub max_concurrency: Option<usize>,
    /// Starting ceiling.
    pub initial_concurrency: Option<usize>,
    /// Retries per file after the first attempt.
    pub max_retries: Option<u32>,
    /// Concurrent range requests per large file.
    pub threads_per_file: Option<usize>,
    /// Show the progress bar.
    pub progress: Option<bool>,
}

impl FileConfig {
    /// Range checks that do not depend on other sources of configuration.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("min_concurrency", self.min_concurrency),
            ("max_concurrency", self.max_concurrency),
            ("initial_concurrency", self.initial_concurrency),
            ("threads_per_file", self.threads_per_file),
        ] {
            if let Some(value) = value
                && !(1..=256).contains(&value)
            {
                bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=256");
            }
        }
        if let Some(retries) = self.max_retries
            && retries > 10
        {
            bail!("Invalid config value for `max_retries`: {retries}. Expected range: 0..=10");
        }
        if let (Some(min), Some(max)) = (self.min_concurrency, self.max_concurrency)
            && min > max
        {
            bail!("Invalid config: `min_concurrency` ({min}) exceeds `max_concurrency` ({max})");
        }
        Ok(())
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/assetfetch/config.toml`
/// 2. `$HOME/.config/assetfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("assetfetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("assetfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file.
///
/// An explicit path must exist; the default path is optional.
pub fn load_file_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = explicit {
        return read_file_config(path).map(Some);
    }
    let Some(path) = resolve_default_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    read_file_config(&path).map(Some)
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "game_dir" => {
                cfg.game_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "source" => {
                cfg.source = Some(parse_string_literal(value).with_context(context)?);
            }
            "min_concurrency" => {
                cfg.min_concurrency = Some(parse_usize(value).with_context(context)?);
            }
            "max_concurrency" => {
                cfg.max_concurrency = Some(parse_usize(value).with_context(context)?);
            }
            "initial_concurrency" => {
                cfg.initial_concurrency = Some(parse_usize(value).with_context(context)?);
            }
            "threads_per_file" => {
                cfg.threads_per_file = Some(parse_usize(value).with_context(context)?);
            }
            "max_retries" => {
                let parsed = parse_usize(value).with_context(context)?;
                cfg.max_retries = Some(
                    u32::try_from(parsed)
                        .map_err(|_| anyhow::anyhow!("max_retries out of range for u32"))?,
                );
            }
            "progress" => {
                cfg.progress = Some(parse_boolean(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_usize(raw_value: &str) -> Result<usize> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    if token.starts_with('-') {
        bail!("Expected non-negative integer");
    }
    Ok(token.parse::<usize>()?)
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
            # install target
            game_dir = "/opt/game"   # trailing comment
            source = "bmclapi"
            min_concurrency = 2
            max_concurrency = 32
            initial_concurrency = 8
            max_retries = 5
            threads_per_file = 4
            progress = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.game_dir, Some(PathBuf::from("/opt/game")));
        assert_eq!(cfg.source.as_deref(), Some("bmclapi"));
        assert_eq!(cfg.min_concurrency, Some(2));
        assert_eq!(cfg.max_concurrency, Some(32));
        assert_eq!(cfg.initial_concurrency, Some(8));
        assert_eq!(cfg.max_retries, Some(5));
        assert_eq!(cfg.threads_per_file, Some(4));
        assert_eq!(cfg.progress, Some(false));
    }

    #[test]
    fn test_parse_config_empty_is_default() {
        assert_eq!(parse_config_str("\n# nothing\n").unwrap(), FileConfig::default());
    }

    #[test]
    fn test_unknown_key_reports_line() {
        let err = parse_config_str("source = \"official\"\nspeed = 3\n").unwrap_err();
        assert!(err.to_string().contains("'speed' on line 2"), "{err}");
    }

    #[test]
    fn test_missing_equals_reports_line() {
        let err = parse_config_str("progress\n").unwrap_err();
        assert!(err.to_string().contains("line 1"), "{err}");
    }

    #[test]
    fn test_unquoted_string_rejected() {
        let err = parse_config_str("game_dir = /opt/game\n").unwrap_err();
        assert!(format!("{err:#}").contains("double-quoted"), "{err:#}");
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        assert!(parse_config_str("max_retries = 11").is_err());
        assert!(parse_config_str("max_concurrency = 0").is_err());
        assert!(parse_config_str("min_concurrency = 9\nmax_concurrency = 4").is_err());
        assert!(parse_config_str("threads_per_file = -1").is_err());
    }

    #[test]
    fn test_explicit_missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_file_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_explicit_path_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "progress = true\n").unwrap();
        let cfg = load_file_config(Some(&path)).unwrap().unwrap();
        assert_eq!(cfg.progress, Some(true));
    }
}
