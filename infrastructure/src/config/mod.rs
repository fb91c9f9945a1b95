//! Configuration file loading for prompt-relay
//!
//! This module handles file I/O and merging of configuration from multiple sources.
//! The priority order (highest to lowest):
//!
//! 1. `RABBITMQ_URL` (broker URL only)
//! 2. `PROMPT_RELAY_*` environment variables
//! 3. `--config <path>` specified file
//! 4. Project root: `./prompt-relay.toml` or `./.prompt-relay.toml`
//! 5. XDG config: `$XDG_CONFIG_HOME/prompt-relay/config.toml`
//! 6. Default values

mod file_config;
mod loader;

pub use file_config::{
    ConfigValidationError, FileBrokerConfig, FileConfig, FileGeneratorConfig, FileQueuesConfig,
    FileRelayConfig, FileSinkKind,
};
pub use loader::{ConfigLoader, ENV_PREFIX, RABBITMQ_URL_VAR};
