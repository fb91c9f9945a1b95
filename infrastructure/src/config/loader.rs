//! Configuration file loader with multi-source merging

use super::file_config::FileConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::PathBuf;

/// Prefix of the environment overrides, e.g. `PROMPT_RELAY_BROKER__PREFETCH`.
pub const ENV_PREFIX: &str = "PROMPT_RELAY_";

/// Broker URL variable shared with the other services.
pub const RABBITMQ_URL_VAR: &str = "RABBITMQ_URL";

const PROJECT_FILES: [&str; 2] = ["prompt-relay.toml", ".prompt-relay.toml"];

/// Configuration loader that handles file discovery and merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from all sources with proper priority
    ///
    /// Priority (highest to lowest):
    /// 1. `RABBITMQ_URL` (broker URL only)
    /// 2. `PROMPT_RELAY_*` environment variables (`__` separates sections)
    /// 3. Explicit config path (if provided)
    /// 4. Project root: `./prompt-relay.toml` or `./.prompt-relay.toml`
    /// 5. Global config: `$XDG_CONFIG_HOME/prompt-relay/config.toml`
    /// 6. Default values
    pub fn load(config_path: Option<&PathBuf>) -> Result<FileConfig, Box<figment::Error>> {
        Self::figment(config_path).extract().map_err(Box::new)
    }

    /// Load only default configuration (for --no-config)
    ///
    /// The broker URL from the environment still applies.
    pub fn load_defaults() -> FileConfig {
        let mut config = FileConfig::default();
        if let Ok(url) = std::env::var(RABBITMQ_URL_VAR)
            && !url.trim().is_empty()
        {
            config.broker.url = url;
        }
        config
    }

    fn figment(config_path: Option<&PathBuf>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(FileConfig::default()));

        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            figment = figment.merge(Toml::file(&global_path));
        }

        if let Some(path) = Self::project_config_path() {
            figment = figment.merge(Toml::file(&path));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Ok(url) = std::env::var(RABBITMQ_URL_VAR)
            && !url.trim().is_empty()
        {
            figment = figment.merge(Serialized::default("broker.url", url));
        }
        figment
    }

    /// Get the global config file path
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("prompt-relay").join("config.toml"))
    }

    /// Get the project-level config file path (if it exists)
    pub fn project_config_path() -> Option<PathBuf> {
        PROJECT_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Print the config file locations being used (for debugging)
    pub fn print_config_sources(config_path: Option<&PathBuf>) {
        println!("Configuration sources (in priority order):");

        if std::env::var(RABBITMQ_URL_VAR).is_ok() {
            println!("  [FOUND] Env:     {}", RABBITMQ_URL_VAR);
        } else {
            println!("  [     ] Env:     {}", RABBITMQ_URL_VAR);
        }

        let overrides: Vec<String> = std::env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(ENV_PREFIX))
            .collect();
        if overrides.is_empty() {
            println!("  [     ] Env:     {}*", ENV_PREFIX);
        } else {
            println!("  [FOUND] Env:     {}", overrides.join(", "));
        }

        if let Some(path) = config_path {
            println!("  [FOUND] Explicit: {}", path.display());
        }

        if let Some(path) = Self::project_config_path() {
            println!("  [FOUND] Project: {}", path.display());
        } else {
            println!("  [     ] Project: ./prompt-relay.toml or ./.prompt-relay.toml");
        }

        if let Some(path) = Self::global_config_path() {
            if path.exists() {
                println!("  [FOUND] Global:  {}", path.display());
            } else {
                println!("  [     ] Global:  {}", path.display());
            }
        }

        println!("  [     ] Default: built-in defaults");
    }
}
