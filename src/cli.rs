use clap::{Parser, Subcommand};
use eyre::{Context, Result};

use crate::config::{self, Configuration, load_configuration, lookup_config_path};

#[derive(Debug, Parser)]
#[command(
    version,
    about,
    long_about = r#"Drive conversation sessions against local and remote models

Default configuration file location looks up in the following order:
    * $XDG_CONFIG_HOME/palaver/config.toml
    * $HOME/.config/palaver/config.toml
    * $HOME/.palaver.toml
"#,
    disable_version_flag = true
)]
pub struct Command {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Principal that owns the sessions
    #[arg(
        short,
        long,
        env = "PALAVER_OWNER",
        default_value = "local",
        global = true
    )]
    owner: String,

    /// Show the version
    #[arg(short, long)]
    version: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Action {
    /// List the models sessions can be answered by
    Models,
    /// List sessions, most recently active first
    Sessions {
        /// Only sessions whose title contains this text
        #[arg(long)]
        title: Option<String>,
        /// Only sessions with a message containing this text
        #[arg(long)]
        contains: Option<String>,
    },
    /// Create an empty session
    New,
    /// Show a session and its messages
    Show { session_id: String },
    /// Append a message and stream the answer
    Send {
        session_id: String,
        content: String,
        #[arg(short, long)]
        model: String,
    },
    /// Replace the last message and stream a new answer
    Edit {
        session_id: String,
        message_idx: usize,
        content: String,
        #[arg(short, long)]
        model: String,
    },
    /// Stream a new answer for the last message
    Regenerate {
        session_id: String,
        #[arg(short, long)]
        model: String,
    },
    /// Delete the last message
    Pop { session_id: String },
    /// Delete a session and all its messages
    Delete { session_id: String },
}

impl Command {
    pub fn new() -> Command {
        Self::parse()
    }

    pub fn get_config(&self) -> Result<Configuration> {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| lookup_config_path().unwrap_or_default());

        if config_path.is_empty() {
            // No config path is specified just use the default config
            return Ok(Configuration::default());
        }
        load_configuration(config_path.as_str()).wrap_err("loading configuration")
    }

    pub fn version(&self) -> bool {
        self.version
    }

    pub fn print_version(&self) {
        println!("{}", config::version())
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }
}
