//! Layered settings: defaults, then an optional settings file, then
//! `AGENTFLOW__*` environment variables.
//!
//! ```toml
//! [log]
//! level = "debug"
//!
//! [agent]
//! program = "claude"
//! model = "sonnet"
//! timeout_secs = 900
//!
//! [sessions]
//! dir = "/home/me/.agent/sessions"
//! ```
//!
//! The same keys can be set from the environment, e.g.
//! `AGENTFLOW__AGENT__TIMEOUT_SECS=900`.

use crate::error::Result;
use crate::executors::agent::AgentSettings;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Base name of the settings file looked up in the working directory
pub const DEFAULT_SETTINGS_NAME: &str = "agentflow";

const ENV_PREFIX: &str = "AGENTFLOW";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    pub agent: AgentSettings,
    pub sessions: SessionSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

/// Where the agent keeps its session transcripts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Session directory; recovery is skipped when unset
    pub dir: Option<PathBuf>,
    /// A session idle for longer than this is no longer live
    pub max_idle_secs: u64,
    /// Delete live sessions of tasks marked interrupted
    pub discard_on_interrupt: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_idle_secs: 600,
            discard_on_interrupt: false,
        }
    }
}

impl SessionSettings {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl Settings {
    /// Load settings from `path` (required when given) or from an optional
    /// `agentflow.{toml,yaml,json}` in the working directory, then apply the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_SETTINGS_NAME).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;

        debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
