//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Where the relay shows answers, overriding `relay.sink`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkArg {
    /// Print fragments to stdout
    Console,
    /// Append fragments to the JSONL answer log
    Jsonl,
    /// Console and JSONL
    Both,
}

/// CLI arguments for prompt-relay
#[derive(Parser, Debug)]
#[command(name = "prompt-relay")]
#[command(author, version, about = "Relay prompts and streamed answers over RabbitMQ")]
#[command(long_about = r#"
prompt-relay moves prompts to an answer generator and streams the answer
fragments back, in order, to whoever waits for them.

Each side runs as its own process:
  publish    Put a prompt on the prompt queue
  generate   Consume prompts and publish numbered answer fragments
  relay      Consume fragments and hand them, in order, to a sink
  cancel     Ask the generator to stop working on a prompt

Configuration is loaded from (in priority order):
1. RABBITMQ_URL                          Broker URL
2. PROMPT_RELAY_* environment variables  e.g. PROMPT_RELAY_BROKER__PREFETCH=32
3. --config <path>                       Explicit config file
4. ./prompt-relay.toml                   Project-level config
5. ~/.config/prompt-relay/config.toml    Global config

Example:
  prompt-relay generate
  prompt-relay relay --sink both
  prompt-relay publish "What is a message broker?"
  prompt-relay demo "first prompt" "second prompt"
"#)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Disable loading of configuration files
    #[arg(long, global = true)]
    pub no_config: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Publish a prompt and print its correlation id
    Publish {
        /// The prompt text
        text: String,

        /// Correlation id to use instead of a generated one
        #[arg(long, value_name = "ID")]
        id: Option<String>,
    },

    /// Run the answer generator until interrupted
    Generate {
        /// Fragments per placeholder answer
        #[arg(long, value_name = "N")]
        fragments: Option<usize>,

        /// Delay between placeholder fragments
        #[arg(long, value_name = "MS")]
        delay_ms: Option<u64>,
    },

    /// Run the answer relay until interrupted
    Relay {
        /// Where answers go
        #[arg(long, value_enum)]
        sink: Option<SinkArg>,

        /// Path of the JSONL answer log
        #[arg(long, value_name = "PATH")]
        jsonl: Option<PathBuf>,
    },

    /// Ask the generator to stop working on a prompt
    Cancel {
        /// Correlation id of the prompt
        id: String,
    },

    /// Run publisher, generator and relay in one process over an in-memory broker
    Demo {
        /// Prompts to publish
        #[arg(default_values_t = [String::from("Hello, relay!")])]
        prompts: Vec<String>,

        /// Fragments per answer
        #[arg(long, value_name = "N", default_value_t = 5)]
        fragments: usize,

        /// Delay between fragments
        #[arg(long, value_name = "MS", default_value_t = 200)]
        delay_ms: u64,
    },

    /// Show configuration sources and the effective configuration
    Config,
}
