//! Configuration file management for savesync.
//!
//! Provides a TOML-based config file at `~/.config/savesync/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use savesync_core::compression::ZstdLoader;
use savesync_core::compression::zstd_codec::DEFAULT_LEVEL;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

pub const ENV_SERVER_URL: &str = "SAVESYNC_SERVER_URL";
pub const ENV_STORAGE_DIR: &str = "SAVESYNC_STORAGE_DIR";
pub const ENV_VALIDATOR_URL: &str = "SAVESYNC_VALIDATOR_URL";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub compression: CompressionSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    /// Base URL uploads are sent to.
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory the server keeps artifacts in.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ValidationSection {
    /// Remote validation endpoint used by `savesync serve`.
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CompressionSection {
    pub level: Option<i32>,
    /// Optional zstd dictionary loaded alongside the encoder.
    pub dictionary: Option<PathBuf>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the savesync config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/savesync` or `~/.config/savesync`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("savesync");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("savesync")
}

/// Return the path to the savesync config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default artifact directory: `<data dir>/savesync/saves`.
pub fn default_storage_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("savesync")
        .join("saves")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(&config_path(), config)
}

/// Write `config` to `path` with 0600 permissions on Unix.
pub fn save_config_to(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` falls through to env/file.
#[derive(Debug, Default)]
pub struct CliOverrides<'a> {
    pub server_url: Option<&'a str>,
    pub storage_dir: Option<&'a Path>,
    pub validator_url: Option<&'a str>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct SavesyncConfig {
    pub server_url: String,
    pub storage_dir: PathBuf,
    /// `None` when nothing configures one; `serve` refuses to start then.
    pub validator_url: Option<String>,
    pub compression_level: i32,
    pub dictionary: Option<PathBuf>,
}

impl SavesyncConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Server URL: `--server-url` > `SAVESYNC_SERVER_URL` > `server.url` > [`DEFAULT_SERVER_URL`]
    /// - Storage dir: `--storage-dir` > `SAVESYNC_STORAGE_DIR` > `storage.dir` > [`default_storage_dir`]
    /// - Validator URL: `--validator-url` > `SAVESYNC_VALIDATOR_URL` > `validation.url` > none
    pub fn resolve(cli: &CliOverrides<'_>) -> Self {
        Self::resolve_with(cli, load_config().ok())
    }

    pub fn resolve_with(cli: &CliOverrides<'_>, file: Option<ConfigFile>) -> Self {
        let file = file.unwrap_or_default();

        let server_url = pick(cli.server_url.map(str::to_string), ENV_SERVER_URL, file.server.url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        let storage_dir = cli
            .storage_dir
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_STORAGE_DIR).map(PathBuf::from))
            .or(file.storage.dir)
            .unwrap_or_else(default_storage_dir);

        let validator_url = pick(cli.validator_url.map(str::to_string), ENV_VALIDATOR_URL, file.validation.url);

        Self {
            server_url,
            storage_dir,
            validator_url,
            compression_level: file.compression.level.unwrap_or(DEFAULT_LEVEL),
            dictionary: file.compression.dictionary,
        }
    }

    pub fn zstd_loader(&self) -> ZstdLoader {
        let loader = ZstdLoader::new().with_level(self.compression_level);
        match &self.dictionary {
            Some(path) => loader.with_dictionary(path),
            None => loader,
        }
    }

    /// Upload endpoint for `subject` on the configured server.
    pub fn upload_url(&self, subject: &str) -> String {
        format!("{}/api/saves/{subject}", self.server_url.trim_end_matches('/'))
    }
}

fn pick(cli: Option<String>, env: &str, file: Option<String>) -> Option<String> {
    cli.or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
        .or(file)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
