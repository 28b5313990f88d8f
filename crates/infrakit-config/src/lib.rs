//! KDL configuration parsing for infrakit.
//!
//! This crate handles parsing of:
//! - App definitions (infrakit.kdl) into a construct tree
//! - Tool settings (infrakit.settings.kdl)
//! - Variable interpolation

pub mod app;
pub mod error;
pub mod settings;
pub mod variables;

pub use app::{load_app, parse_app};
pub use error::{ConfigError, ConfigResult};
pub use settings::{ExecutorKind, LogFormat, SETTINGS_FILE, Settings, load_settings, parse_settings};
pub use variables::{AppContext, GitContext, VariableContext};
