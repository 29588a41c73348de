//! Client settings.
//!
//! Each value is taken from the first source that sets it:
//! 1. command-line flags
//! 2. `PARLEY_*` environment variables (read by clap)
//! 3. `~/.config/parley/config.toml`
//! 4. built-in defaults
//!
//! The default file may be absent. A file named with `--config` must exist.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::net::NetConfig;

/// Settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read, or was named
    /// explicitly and is missing.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        /// File that was opened.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this layout.
    #[error("invalid settings file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// No platform data directory to keep client state in.
    #[error("no data directory available for client state")]
    NoDataDir,
}

// ---------------------------------------------------------------------------
// On-disk layout; every key is optional
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    sync: SyncFileConfig,
    storage: StorageFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    token: Option<String>,
    user_id: Option<i64>,
    force_https_media: Option<bool>,
    connect_timeout_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    duplicate_window_ms: Option<u64>,
    echo_window_ms: Option<u64>,
    send_latch_timeout_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
    edit_window_secs: Option<u64>,
    page_size: Option<u32>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    cleared_markers_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Timing and sizing knobs for reconciliation and outbound commands.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Window within which two messages with the same sender and payload
    /// are treated as one delivery.
    pub duplicate_window: Duration,
    /// Window within which a confirmed own message collapses into an
    /// entry that already shows the same payload.
    pub echo_window: Duration,
    /// How long the send latch stays set without a confirmation.
    pub send_latch_timeout: Duration,
    /// Idle time after the last keystroke before `typing=false` is sent.
    pub typing_idle: Duration,
    /// How long after creation a message may still be edited.
    pub edit_window: Duration,
    /// Messages requested per history page.
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_secs(2),
            echo_window: Duration::from_secs(5),
            send_latch_timeout: Duration::from_secs(3),
            typing_idle: Duration::from_secs(1),
            edit_window: Duration::from_secs(120),
            page_size: 50,
        }
    }
}

/// Client settings after merging every source.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Backend base URL (`http(s)://host`).
    pub server_url: Option<String>,
    /// Authentication token.
    pub token: Option<String>,
    /// The authenticated user's numeric id.
    pub user_id: Option<i64>,
    /// Upgrade absolute `http` media URLs to `https`.
    pub force_https_media: bool,
    /// Timeout for opening the chat stream.
    pub connect_timeout: Duration,
    /// Keep-alive ping interval.
    pub heartbeat_interval: Duration,
    /// Channel capacity for session event mpsc channels.
    pub channel_capacity: usize,

    // -- Sync --
    /// Reconciliation and outbound timing.
    pub sync: SyncConfig,

    // -- Storage --
    /// Cleared-conversation marker file. `None` uses the data directory.
    pub cleared_markers_path: Option<PathBuf>,

    // -- Startup --
    /// Conversation to open at startup.
    pub conversation: Option<String>,
    /// Peer to message when no conversation exists yet.
    pub peer: Option<i64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            user_id: None,
            force_https_media: false,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            channel_capacity: 256,
            sync: SyncConfig::default(),
            cleared_markers_path: None,
            conversation: None,
            peer: None,
        }
    }
}

impl ClientConfig {
    /// Merge parsed flags with the settings file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a settings file is present but unreadable
    /// or malformed, or when `--config` names a missing file.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let sync = &file.sync;

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.network.server_url.clone()),
            token: cli.token.clone().or_else(|| file.network.token.clone()),
            user_id: cli.user_id.or(file.network.user_id),
            force_https_media: file
                .network
                .force_https_media
                .unwrap_or(defaults.force_https_media),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            heartbeat_interval: file
                .network
                .heartbeat_interval_secs
                .map_or(defaults.heartbeat_interval, Duration::from_secs),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            sync: SyncConfig {
                duplicate_window: sync
                    .duplicate_window_ms
                    .map_or(defaults.sync.duplicate_window, Duration::from_millis),
                echo_window: sync
                    .echo_window_ms
                    .map_or(defaults.sync.echo_window, Duration::from_millis),
                send_latch_timeout: sync
                    .send_latch_timeout_ms
                    .map_or(defaults.sync.send_latch_timeout, Duration::from_millis),
                typing_idle: sync
                    .typing_idle_ms
                    .map_or(defaults.sync.typing_idle, Duration::from_millis),
                edit_window: sync
                    .edit_window_secs
                    .map_or(defaults.sync.edit_window, Duration::from_secs),
                page_size: sync.page_size.unwrap_or(defaults.sync.page_size),
            },
            cleared_markers_path: file.storage.cleared_markers_path.clone(),
            conversation: cli.conversation.clone(),
            peer: cli.peer,
        }
    }

    /// Networking settings, or `None` until a backend URL, a non-empty
    /// token and a user id are all known.
    #[must_use]
    pub fn to_net_config(&self) -> Option<NetConfig> {
        let server_url = self.server_url.clone()?;
        let token = self.token.clone()?;
        let user_id = self.user_id?;

        if token.is_empty() {
            return None;
        }

        Some(NetConfig {
            server_url,
            token,
            user_id,
            force_https_media: self.force_https_media,
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            channel_capacity: self.channel_capacity,
        })
    }

    /// Location of the cleared-conversation marker file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoDataDir`] when no path is configured and
    /// the platform data directory cannot be determined.
    pub fn cleared_markers_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.cleared_markers_path {
            return Ok(path.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("parley").join("cleared.json"))
            .ok_or(ConfigError::NoDataDir)
    }
}

/// Command-line flags.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Line-oriented chat client with live sync")]
pub struct CliArgs {
    /// Backend base URL, e.g. `https://chat.example.com`.
    #[arg(long, env = "PARLEY_SERVER")]
    pub server_url: Option<String>,

    /// Authentication token.
    #[arg(long, env = "PARLEY_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Your numeric user id.
    #[arg(long, env = "PARLEY_USER_ID")]
    pub user_id: Option<i64>,

    /// Conversation to open at startup.
    #[arg(long)]
    pub conversation: Option<String>,

    /// User to message when no conversation exists yet.
    #[arg(long)]
    pub peer: Option<i64>,

    /// Settings file to use instead of `~/.config/parley/config.toml`.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Tracing filter, e.g. `debug` or `parley=trace,info`.
    #[arg(long, default_value = "info", env = "PARLEY_LOG")]
    pub log_level: String,

    /// Log file location. Defaults to `parley.log` in the temp directory.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// File loading
// ---------------------------------------------------------------------------

fn load_config_file(named: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let (path, required) = match named {
        Some(path) => (path.to_path_buf(), true),
        None => match dirs::config_dir() {
            Some(dir) => (dir.join("parley").join("config.toml"), false),
            None => return Ok(ConfigFile::default()),
        },
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(source) if !required && source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            Ok(ConfigFile::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
