//! Configuration loading and root folder resolution

use crate::{Error, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;

/// Default delivery-code lifetime in hours
pub const DEFAULT_CODE_TTL_HOURS: i64 = 72;

/// Default escalation sweep interval in seconds
pub const DEFAULT_ESCALATION_INTERVAL_SECS: i64 = 60;

/// Default time a task may sit unclaimed before escalating, in seconds
pub const DEFAULT_ESCALATION_DEADLINE_SECS: i64 = 1800;

/// Default maximum total time to retry a locked database operation
pub const DEFAULT_MAX_LOCK_WAIT_MS: u64 = 5000;

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> PathBuf {
    if let Some(path) = cli_arg {
        return PathBuf::from(path);
    }

    if let Ok(path) = std::env::var(env_var_name) {
        return PathBuf::from(path);
    }

    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                    return PathBuf::from(root_folder);
                }
            }
        }
    }

    default_root_folder()
}

/// Path of the SQLite database under the root folder
pub fn database_path(root: &std::path::Path) -> PathBuf {
    root.join("opost.db")
}

/// Locate the platform config file, if any
fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        if let Some(path) = dirs::config_dir().map(|d| d.join("opost").join("config.toml")) {
            if path.exists() {
                return Ok(path);
            }
        }
        let system_config = PathBuf::from("/etc/opost/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }
        Err(Error::Config("No config file found".to_string()))
    } else {
        let path = dirs::config_dir()
            .map(|d| d.join("opost").join("config.toml"))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
        if path.exists() {
            Ok(path)
        } else {
            Err(Error::Config(format!("Config file not found: {:?}", path)))
        }
    }
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("opost"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/opost"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("opost"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/opost"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("opost"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\opost"))
    } else {
        PathBuf::from("./opost_data")
    }
}

/// Read a setting value, falling back to `default` when absent or unparsable
pub async fn setting_or<T: std::str::FromStr>(
    db: &SqlitePool,
    key: &str,
    default: T,
) -> Result<T> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    Ok(row
        .and_then(|(v,)| v.parse::<T>().ok())
        .unwrap_or(default))
}

/// Runtime tuning values loaded from the settings table at startup
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Delivery-code lifetime before the expiry sweep marks it expired
    pub code_ttl_hours: i64,
    /// Interval between escalation/expiry sweep ticks
    pub escalation_interval_secs: i64,
    /// How long a task may sit unclaimed before one escalation step
    pub escalation_deadline_secs: i64,
    /// Retry budget for transient database lock errors
    pub max_lock_wait_ms: u64,
}

impl HubSettings {
    pub async fn load(db: &SqlitePool) -> Result<Self> {
        Ok(Self {
            code_ttl_hours: setting_or(db, "code_ttl_hours", DEFAULT_CODE_TTL_HOURS).await?,
            escalation_interval_secs: setting_or(
                db,
                "escalation_interval_secs",
                DEFAULT_ESCALATION_INTERVAL_SECS,
            )
            .await?,
            escalation_deadline_secs: setting_or(
                db,
                "escalation_deadline_secs",
                DEFAULT_ESCALATION_DEADLINE_SECS,
            )
            .await?,
            max_lock_wait_ms: setting_or(db, "max_lock_wait_ms", DEFAULT_MAX_LOCK_WAIT_MS).await?,
        })
    }
}
