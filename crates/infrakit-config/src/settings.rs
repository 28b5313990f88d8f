//! Tool settings parsing.
//!
//! Settings live in an optional `infrakit.settings.kdl` next to the app:
//!
//! ```kdl
//! output-dir "infrakit.out"
//! state-dir ".infrakit/state"
//! work-dir ".infrakit/work"
//! executor "docker"
//! log-format "json"
//! secrets prefix="INFRAKIT_SECRET_"
//! ```

use crate::app::{get_first_string_arg, get_string_prop};
use crate::{ConfigError, ConfigResult};
use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default settings file name.
pub const SETTINGS_FILE: &str = "infrakit.settings.kdl";

/// Where commands run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Host processes.
    #[default]
    Process,
    /// Local Docker containers.
    Docker,
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "process" => Ok(ExecutorKind::Process),
            "docker" => Ok(ExecutorKind::Docker),
            _ => Err(format!("unknown executor: {} (expected process or docker)", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("unknown log format: {} (expected text or json)", s)),
        }
    }
}

/// Tool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Cloud assembly output directory.
    pub output_dir: PathBuf,
    /// Deployed stack state for the local deployer.
    pub state_dir: PathBuf,
    /// Pipeline run workspaces.
    pub workspace_dir: PathBuf,
    pub executor: ExecutorKind,
    pub log_format: LogFormat,
    /// Environment variable prefix of the env secret store.
    pub secret_prefix: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("infrakit.out"),
            state_dir: PathBuf::from(".infrakit/state"),
            workspace_dir: PathBuf::from(".infrakit/work"),
            executor: ExecutorKind::Process,
            log_format: LogFormat::Text,
            secret_prefix: "INFRAKIT_SECRET_".to_string(),
        }
    }
}

/// Parse settings from KDL text. Missing entries keep their defaults.
pub fn parse_settings(kdl: &str) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = Settings::default();

    for node in doc.nodes() {
        let name = node.name().value();
        let value = || {
            get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(name.to_string()))
        };

        match name {
            "output-dir" => settings.output_dir = PathBuf::from(value()?),
            "state-dir" => settings.state_dir = PathBuf::from(value()?),
            "work-dir" => settings.workspace_dir = PathBuf::from(value()?),
            "executor" => {
                settings.executor = value()?.parse().map_err(|message| {
                    ConfigError::InvalidValue {
                        field: "executor".to_string(),
                        message,
                    }
                })?;
            }
            "log-format" => {
                settings.log_format = value()?.parse().map_err(|message| {
                    ConfigError::InvalidValue {
                        field: "log-format".to_string(),
                        message,
                    }
                })?;
            }
            "secrets" => {
                if let Some(prefix) = get_string_prop(node, "prefix") {
                    settings.secret_prefix = prefix;
                }
            }
            other => {
                return Err(ConfigError::UnknownNode {
                    node: other.to_string(),
                    context: "settings".to_string(),
                });
            }
        }
    }

    Ok(settings)
}

/// Load settings from `path`. A missing file yields the defaults.
pub fn load_settings(path: &Path) -> ConfigResult<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let kdl = std::fs::read_to_string(path)?;
    parse_settings(&kdl)
}
