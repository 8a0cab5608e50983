//! Application configuration for CaseBrief.
//!
//! User config lives at `~/.casebrief/casebrief.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CaseBriefError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "casebrief.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".casebrief";

/// Default character budget for accumulated prior-stage context.
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 24_000;

// ---------------------------------------------------------------------------
// Config structs (matching casebrief.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Analysis service settings.
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Case store settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[analysis]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Endpoint receiving the analysis POST requests.
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Upper bound on a single analysis call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Character budget for prior-stage context sent to regular stages.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Pause between receiving a result and marking it revealed.
    #[serde(default = "default_reveal_delay_ms")]
    pub reveal_delay_ms: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            max_context_chars: default_max_context_chars(),
            reveal_delay_ms: default_reveal_delay_ms(),
        }
    }
}

fn default_endpoint() -> Url {
    Url::parse("http://localhost:3000/api/analyze").expect("static default endpoint parses")
}
fn default_api_key_env() -> String {
    "CASEBRIEF_API_KEY".into()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_context_chars() -> usize {
    DEFAULT_MAX_CONTEXT_CHARS
}
fn default_reveal_delay_ms() -> u64 {
    400
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file. A leading `~` expands to the home dir.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Key under which the whole case collection is stored.
    #[serde(default = "default_collection_key")]
    pub collection_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            collection_key: default_collection_key(),
        }
    }
}

fn default_db_path() -> String {
    "~/.casebrief/casebrief.db".into()
}
fn default_collection_key() -> String {
    "cases".into()
}

// ---------------------------------------------------------------------------
// Orchestrator config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Character budget for regular-stage context.
    pub max_context_chars: usize,
    /// Delay before a fresh result is marked revealed.
    pub reveal_delay: Duration,
    /// Deadline for a single analysis call.
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_context_chars: config.analysis.max_context_chars,
            reveal_delay: Duration::from_millis(config.analysis.reveal_delay_ms),
            request_timeout: Duration::from_secs(config.analysis.request_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.casebrief/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CaseBriefError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.casebrief/casebrief.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| CaseBriefError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CaseBriefError::config(format!("failed to parse {}: {e}", path.display()))
    })?;

    if config.analysis.max_context_chars == 0 {
        return Err(CaseBriefError::config(
            "analysis.max_context_chars must be greater than zero",
        ));
    }

    if config.analysis.request_timeout_secs == 0 {
        return Err(CaseBriefError::config(
            "analysis.request_timeout_secs must be greater than zero",
        ));
    }

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CaseBriefError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CaseBriefError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CaseBriefError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the env var named in the config, if set and non-empty.
pub fn resolve_api_key(config: &AppConfig) -> Option<String> {
    std::env::var(&config.analysis.api_key_env)
        .ok()
        .filter(|val| !val.trim().is_empty())
}

/// Expand a leading `~/` in a configured path.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| CaseBriefError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
