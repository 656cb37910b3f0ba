//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.talentflow/` by
//! default) into [`EngineConfig`]. Falls back to defaults when the file is
//! missing or malformed.

use std::path::{Path, PathBuf};

use talentflow_types::config::EngineConfig;

use crate::sqlite::pool::database_url_for;

pub const DATA_DIR_ENV: &str = "TALENTFLOW_DATA_DIR";
pub const DATABASE_URL_ENV: &str = "TALENTFLOW_DATABASE_URL";

/// Data directory: `TALENTFLOW_DATA_DIR`, else `~/.talentflow`.
pub fn data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn data_dir_from(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".talentflow")
    })
}

/// Database URL: `TALENTFLOW_DATABASE_URL`, else `sqlite://{data_dir}/talentflow.db`.
pub fn database_url(data_dir: &Path) -> String {
    std::env::var(DATABASE_URL_ENV).unwrap_or_else(|_| database_url_for(data_dir))
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
/// - A relative `templates_dir` is resolved against `data_dir`.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(mut config) => {
            if let Some(dir) = config.templates_dir.as_mut().filter(|d| d.is_relative()) {
                *dir = data_dir.join(&*dir);
            }
            config
        }
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
