//! Application configuration for Natrium.
//!
//! User config lives at `~/.natrium/natrium.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NatriumError, Result};
use crate::types::{PostLength, TOPIC_LIMIT, Technique};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "natrium.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".natrium";

// ---------------------------------------------------------------------------
// Config structs (matching natrium.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Generation defaults and bounds.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// External generator bridge.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Chat bot process settings.
    #[serde(default)]
    pub bot: BotConfig,
}

/// `[generation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Technique used when the user has not picked one.
    #[serde(default)]
    pub default_technique: Technique,

    /// Post length used when the user has not picked one.
    #[serde(default = "default_post_length")]
    pub default_post_length: u32,

    #[serde(default = "default_min_post_length")]
    pub min_post_length: u32,

    #[serde(default = "default_max_post_length")]
    pub max_post_length: u32,

    /// Lengths offered as buttons.
    #[serde(default = "default_length_presets")]
    pub length_presets: Vec<u32>,

    /// Maximum number of topics offered to the user.
    #[serde(default = "default_topic_limit")]
    pub topic_limit: usize,

    /// Request-level deadline for a single generator call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_technique: Technique::default(),
            default_post_length: default_post_length(),
            min_post_length: default_min_post_length(),
            max_post_length: default_max_post_length(),
            length_presets: default_length_presets(),
            topic_limit: default_topic_limit(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl GenerationConfig {
    /// Validate a requested length against the configured bounds.
    pub fn validate_length(&self, chars: u32) -> Result<PostLength> {
        PostLength::new(chars, self.min_post_length, self.max_post_length)
    }

    /// The configured default length, clamped into bounds.
    pub fn default_length(&self) -> PostLength {
        let chars = self
            .default_post_length
            .clamp(self.min_post_length, self.max_post_length);
        PostLength::new(chars, self.min_post_length, self.max_post_length)
            .unwrap_or_default()
    }
}

fn default_post_length() -> u32 {
    PostLength::DEFAULT.get()
}
fn default_min_post_length() -> u32 {
    PostLength::MIN
}
fn default_max_post_length() -> u32 {
    PostLength::MAX
}
fn default_length_presets() -> Vec<u32> {
    vec![500, 700, 1000]
}
fn default_topic_limit() -> usize {
    TOPIC_LIMIT
}
fn default_timeout_secs() -> u64 {
    180
}

/// `[bridge]` section: how to launch the external generator process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Executable to spawn.
    #[serde(default = "default_bridge_command")]
    pub command: String,

    /// Arguments passed to the executable.
    #[serde(default = "default_bridge_args")]
    pub args: Vec<String>,

    /// Working directory for the bridge (defaults to the current directory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            args: default_bridge_args(),
            working_dir: None,
        }
    }
}

fn default_bridge_command() -> String {
    "python3".into()
}
fn default_bridge_args() -> Vec<String> {
    vec!["-m".into(), "natrium_bridge".into()]
}

/// `[bot]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Name of the env var holding the bot token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// PID file guarding against a second running instance.
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            lock_file: default_lock_file(),
        }
    }
}

fn default_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".into()
}
fn default_lock_file() -> String {
    "/tmp/natrium-smm-bot.pid".into()
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.natrium/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| NatriumError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.natrium/natrium.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NatriumError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| NatriumError::config(format!("failed to parse {}: {e}", path.display())))?;

    let generation = &config.generation;
    if generation.min_post_length > generation.max_post_length {
        return Err(NatriumError::config(format!(
            "min_post_length ({}) exceeds max_post_length ({})",
            generation.min_post_length, generation.max_post_length
        )));
    }

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NatriumError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| NatriumError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NatriumError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the bot token env var is set and non-empty.
pub fn validate_bot_token(config: &AppConfig) -> Result<()> {
    let var_name = &config.bot.token_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(NatriumError::config(format!(
            "bot token not found. Set the {var_name} environment variable."
        ))),
    }
}
