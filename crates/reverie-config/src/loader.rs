use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::ReverieConfig;
use reverie_core::{Result, ReverieError};

/// Loads the Reverie configuration from disk with environment overrides.
pub struct ConfigLoader {
    config: ReverieConfig,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > REVERIE_CONFIG env > ~/.reverie/reverie.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("REVERIE_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reverie")
            .join("reverie.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<ReverieConfig>(&raw).map_err(|e| {
                ReverieError::Config(format!("failed to parse {}: {}", config_path.display(), e))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            ReverieConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Validate config — log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(ReverieError::Config(e)),
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Get a snapshot of the loaded config.
    pub fn get(&self) -> ReverieConfig {
        self.config.clone()
    }

    /// Path the config was loaded from (or would have been).
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (REVERIE_DB_PATH, REVERIE_LOG_LEVEL, ...).
    fn apply_env_overrides(mut config: ReverieConfig) -> ReverieConfig {
        if let Ok(v) = std::env::var("REVERIE_DB_PATH") {
            config.storage.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("REVERIE_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("REVERIE_SYNTHESIS_MODEL") {
            config.llm.synthesis_model = v;
        }
        if let Ok(v) = std::env::var("REVERIE_EMBEDDING_MODEL") {
            config.llm.embedding_model = v;
        }
        // API key: config file takes priority, env is the fallback.
        if config.llm.api_key.is_none() {
            if let Ok(v) = std::env::var("OPENAI_API_KEY") {
                config.llm.api_key = Some(v);
            }
        }
        config
    }
}
