//! File configuration for the `transfer` binary.
//!
//! Precedence, highest first: command-line flags, `TRANSFER_ACCESS_TOKEN`
//! (token only), the config file, built-in defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use transfer_core::{EngineConfig, HttpApiConfig, RetryPolicy};

use crate::cli::Args;

/// Environment variable that overrides the access token from the file.
pub const ACCESS_TOKEN_ENV: &str = "TRANSFER_ACCESS_TOKEN";

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 32;
const MIN_ATTEMPTS: u32 = 1;
const MAX_ATTEMPTS: u32 = 10;
const MIN_PART_SIZE: u64 = 64 * 1024;
const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Values read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub library_id: Option<String>,
    pub space_id: Option<String>,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub part_size: Option<u64>,
    pub verify_integrity: Option<bool>,
    pub quick_upload: Option<bool>,
}

impl FileConfig {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency)
        {
            bail!(
                "Invalid config value for `concurrency`: {concurrency}. Expected range: {MIN_CONCURRENCY}..={MAX_CONCURRENCY}"
            );
        }

        if let Some(max_retries) = self.max_retries
            && !(MIN_ATTEMPTS..=MAX_ATTEMPTS).contains(&max_retries)
        {
            bail!(
                "Invalid config value for `max_retries`: {max_retries}. Expected range: {MIN_ATTEMPTS}..={MAX_ATTEMPTS}"
            );
        }

        if let Some(part_size) = self.part_size
            && !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&part_size)
        {
            bail!(
                "Invalid config value for `part_size`: {part_size}. Expected range: {MIN_PART_SIZE}..={MAX_PART_SIZE}"
            );
        }

        if let Some(base_url) = &self.base_url
            && base_url.trim().is_empty()
        {
            bail!("Invalid config value for `base_url`: must not be empty");
        }

        Ok(())
    }
}

/// Config file contents plus where they came from.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// Path that was consulted, if one could be resolved.
    pub path: Option<PathBuf>,
    /// Parsed contents; `None` when no file exists at the default path.
    pub config: Option<FileConfig>,
}

/// Settings the binary runs with after merging every source.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub api: HttpApiConfig,
    pub engine: EngineConfig,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/transfer/config.toml`
/// 2. `$HOME/.config/transfer/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("transfer")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("transfer")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads `explicit` if given (it must exist), otherwise the default file if present.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Merges flags, the token override and the file into runnable settings.
pub fn resolve_settings(
    args: &Args,
    loaded: &LoadedConfig,
    token_override: Option<String>,
) -> Result<ResolvedSettings> {
    let file = loaded.config.clone().unwrap_or_default();
    let location = loaded
        .path
        .as_deref()
        .map_or_else(|| "the config file".to_string(), |p| format!("'{}'", p.display()));

    let Some(base_url) = args.base_url.clone().or(file.base_url) else {
        bail!("No service URL configured. Set `base_url` in {location} or pass --base-url");
    };
    let Some(library_id) = args.library_id.clone().or(file.library_id) else {
        bail!("No library configured. Set `library_id` in {location} or pass --library-id");
    };
    let Some(space_id) = args.space_id.clone().or(file.space_id) else {
        bail!("No space configured. Set `space_id` in {location} or pass --space-id");
    };

    let mut api = HttpApiConfig::new(base_url, library_id, space_id);
    if let Some(token) = token_override.or(file.access_token) {
        api = api.with_access_token(token);
    }
    if let Some(user_id) = file.user_id {
        api = api.with_user_id(user_id);
    }

    let defaults = EngineConfig::default();
    let max_attempts = args
        .max_retries
        .map(u32::from)
        .or(file.max_retries)
        .unwrap_or_else(|| defaults.retry_policy.max_attempts());
    let engine = EngineConfig {
        part_size: args.part_size.or(file.part_size).unwrap_or(defaults.part_size),
        concurrency: args
            .concurrency
            .map(usize::from)
            .or(file.concurrency)
            .unwrap_or(defaults.concurrency),
        retry_policy: RetryPolicy::with_max_attempts(max_attempts),
        verify_integrity: file.verify_integrity.unwrap_or(defaults.verify_integrity),
        quick_upload: file.quick_upload.unwrap_or(defaults.quick_upload),
    };

    Ok(ResolvedSettings { api, engine })
}

/// Reads the token override from the environment, ignoring empty values.
#[must_use]
pub fn access_token_from_env() -> Option<String> {
    env::var(ACCESS_TOKEN_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
