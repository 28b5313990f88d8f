//! CLI command implementations.

pub mod deploy;
pub mod ls;
pub mod pipeline;
pub mod synth;
pub mod validate;

use anyhow::{Context, Result};
use infrakit_config::{
    ExecutorKind, SETTINGS_FILE, Settings, VariableContext, load_app, load_settings,
};
use infrakit_core::ConstructTree;
use infrakit_core::deployer::Deployer;
use infrakit_core::executor::{Executor, LogStream};
use infrakit_core::secret::{EnvSecretStore, SecretStore};
use infrakit_deployer::LocalDeployer;
use infrakit_executor::{LocalDockerExecutor, LocalProcessExecutor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An app definition together with the settings and variables used to
/// process it.
pub struct Project {
    pub app_file: PathBuf,
    /// Directory containing the app file; relative settings paths and asset
    /// paths are resolved against it.
    pub dir: PathBuf,
    pub settings: Settings,
    pub vars: VariableContext,
}

impl Project {
    pub fn open(app_file: &Path, settings: Settings) -> Result<Self> {
        let app_file = app_file
            .canonicalize()
            .with_context(|| format!("Failed to find app file: {}", app_file.display()))?;
        let dir = app_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut vars = VariableContext::from_git_repo(&dir.to_string_lossy());
        vars.populate_env();
        // Values of env-backed secrets are masked in job output.
        for (key, value) in &vars.env {
            if key.starts_with(&settings.secret_prefix) {
                vars.secrets.insert(key.clone(), value.clone());
            }
        }

        Ok(Self {
            app_file,
            dir,
            settings,
            vars,
        })
    }

    pub fn load(&self) -> Result<ConstructTree> {
        load_app(&self.app_file, &self.vars)
            .with_context(|| format!("Failed to load app: {}", self.app_file.display()))
    }

    /// Resolve a settings path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }

    pub fn executor(&self) -> Result<Arc<dyn Executor>> {
        Ok(match self.settings.executor {
            ExecutorKind::Process => Arc::new(LocalProcessExecutor::new()),
            ExecutorKind::Docker => {
                Arc::new(LocalDockerExecutor::new().context("Failed to connect to Docker")?)
            }
        })
    }

    pub fn deployer(&self) -> Arc<dyn Deployer> {
        Arc::new(LocalDeployer::new(self.resolve(&self.settings.state_dir)))
    }

    pub fn secrets(&self) -> Arc<dyn SecretStore> {
        Arc::new(EnvSecretStore::with_prefix(&self.settings.secret_prefix))
    }
}

/// Settings for the app at `app_file`. An explicit path is used as given and
/// must exist; otherwise [`SETTINGS_FILE`] next to the app file is read when
/// present.
pub fn project_settings(explicit: Option<&Path>, app_file: &Path) -> Result<Settings> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Settings file not found: {}", path.display());
            }
            path.to_path_buf()
        }
        None => app_file
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(SETTINGS_FILE),
    };
    load_settings(&path).with_context(|| format!("Failed to load settings: {}", path.display()))
}

pub fn stream_marker(stream: LogStream) -> &'static str {
    match stream {
        LogStream::Stdout => " ",
        LogStream::Stderr => "!",
        LogStream::System => "*",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_resolves_paths_against_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("infrakit.kdl");
        std::fs::write(&app, r#"app "demo""#).unwrap();

        let project = Project::open(&app, Settings::default()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(project.dir, root);
        assert_eq!(
            project.resolve(Path::new("infrakit.out")),
            root.join("infrakit.out")
        );
        assert_eq!(project.resolve(Path::new("/tmp/x")), PathBuf::from("/tmp/x"));
        assert_eq!(project.load().unwrap().app_id(), "demo");
    }

    #[test]
    fn test_settings_default_to_app_dir() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("infrakit.kdl");
        std::fs::write(&app, r#"app "demo""#).unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), r#"output-dir "cdk.out""#).unwrap();

        let settings = project_settings(None, &app).unwrap();
        assert_eq!(settings.output_dir, PathBuf::from("cdk.out"));

        // An app directory without a settings file uses the defaults.
        let other = tempfile::tempdir().unwrap();
        let settings = project_settings(None, &other.path().join("infrakit.kdl")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_explicit_settings_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("infrakit.kdl");
        let explicit = dir.path().join("ci.settings.kdl");
        assert!(project_settings(Some(&explicit), &app).is_err());

        std::fs::write(&explicit, r#"executor "docker""#).unwrap();
        let settings = project_settings(Some(&explicit), &app).unwrap();
        assert_eq!(settings.executor, ExecutorKind::Docker);
    }

    #[test]
    fn test_missing_app_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Project::open(&dir.path().join("nope.kdl"), Settings::default()).is_err());
    }
}
