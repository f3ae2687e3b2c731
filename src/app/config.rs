//! Optional `key = value` config file for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Environment variable that may carry the access token.
pub(crate) const ACCESS_TOKEN_ENV: &str = "GRABIA_ACCESS_TOKEN";

/// Defaults read from the config file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FileConfig {
    pub output_dir: Option<PathBuf>,
    pub max_workers: Option<u8>,
    /// MB/s, `0` for unlimited.
    pub speed_limit: Option<f64>,
    pub dynamic_scaling: Option<bool>,
    pub sync: Option<bool>,
    pub keep_readme: Option<bool>,
    pub verbosity: Option<VerbositySetting>,
    /// Sent as the `Authorization` header.
    pub access_token: Option<String>,
    pub idle_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Validates config values against the same ranges as the CLI.
    pub fn validate(&self) -> Result<()> {
        if let Some(workers) = self.max_workers
            && !(1..=64).contains(&workers)
        {
            bail!("Invalid config value for `max_workers`: {workers}. Expected range: 1..=64");
        }
        if let Some(limit) = self.speed_limit
            && (!limit.is_finite() || limit < 0.0)
        {
            bail!("Invalid config value for `speed_limit`: {limit}. Expected a number >= 0");
        }
        if let Some(secs) = self.idle_timeout_secs
            && !(1..=3600).contains(&secs)
        {
            bail!("Invalid config value for `idle_timeout_secs`: {secs}. Expected range: 1..=3600");
        }
        if self.access_token.as_deref().is_some_and(str::is_empty) {
            bail!("Invalid config value for `access_token`: must not be empty");
        }
        Ok(())
    }

    /// Token from the environment, falling back to the file.
    pub fn resolved_access_token(&self) -> Option<String> {
        env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
            .or_else(|| self.access_token.clone())
    }
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Log level used when neither `RUST_LOG` nor a CLI flag decides.
    #[must_use]
    pub fn level(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose | Self::Debug => "debug",
            Self::Quiet => "error",
        }
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/grabia/config.toml`
/// 2. `$HOME/.config/grabia/config.toml`
#[must_use]
pub(crate) fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("grabia")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("grabia")
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
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<FileConfig> {
    if let Some(path) = explicit {
        return load_file_config(path);
    }
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
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
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "max_workers" => {
                cfg.max_workers = Some(parse_integer_u8(value).with_context(context)?);
            }
            "speed_limit" => {
                cfg.speed_limit = Some(parse_number(value).with_context(context)?);
            }
            "dynamic_scaling" => {
                cfg.dynamic_scaling = Some(parse_boolean(value).with_context(context)?);
            }
            "sync" => {
                cfg.sync = Some(parse_boolean(value).with_context(context)?);
            }
            "keep_readme" => {
                cfg.keep_readme = Some(parse_boolean(value).with_context(context)?);
            }
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            "access_token" => {
                cfg.access_token = Some(parse_string_literal(value).with_context(context)?);
            }
            "idle_timeout_secs" => {
                cfg.idle_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
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

fn parse_integer_u8(raw_value: &str) -> Result<u8> {
    let value = parse_integer_u64(raw_value)?;
    u8::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u8"))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_number(raw_value: &str) -> Result<f64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected numeric value");
    }
    Ok(token.parse::<f64>()?)
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
