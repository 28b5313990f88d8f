//! `${...}` interpolation of string values in app definitions.
//!
//! Known namespaces are `git`, `app`, `env` and `secrets`; `date` and
//! `timestamp` are computed at interpolation time and any other single name
//! is looked up in the custom variables. Unknown references are left as
//! written, so shell variables such as `${HOME}` in synth commands reach
//! the shell untouched.
//!
//! Secret values never belong in a synthesized template. App definitions are
//! parsed with [`VariableContext::without_secrets`], which keeps
//! `${secrets.*}` as written for the pipeline to resolve when it runs a
//! command, and template values go through
//! [`VariableContext::interpolate_public`], which refuses them.

use crate::{ConfigError, ConfigResult};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}").unwrap()
});

/// Values available to `${...}` references.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub app: AppContext,
    pub env: HashMap<String, String>,
    /// Masked wherever job output is logged.
    pub secrets: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

/// The checkout the app definition lives in.
#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AppContext {
    /// The app construct id; filled in by the loader when empty.
    pub name: String,
    pub dir: String,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose `git.*` values describe the repository at `dir`.
    /// Outside a repository the git values stay empty.
    pub fn from_git_repo(dir: &str) -> Self {
        let git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(Path::new(dir))
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|s| !s.is_empty())
        };

        let mut ctx = Self::new();
        if let Some(sha) = git(&["rev-parse", "HEAD"]) {
            ctx.git.short_sha = sha.chars().take(7).collect();
            ctx.git.sha = sha;
        }
        ctx.git.branch = git(&["rev-parse", "--abbrev-ref", "HEAD"])
            .filter(|b| b != "HEAD")
            .unwrap_or_default();
        ctx.git.tag = git(&["describe", "--tags", "--exact-match", "HEAD"]);
        ctx.app.dir = dir.to_string();
        ctx
    }

    /// Copy the process environment into `env`.
    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    pub fn with_var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        match name.split_once('.') {
            Some(("git", "sha")) => Some(self.git.sha.clone()),
            Some(("git", "short_sha")) => Some(self.git.short_sha.clone()),
            Some(("git", "branch")) => Some(self.git.branch.clone()),
            Some(("git", "tag")) => self.git.tag.clone(),
            Some(("git", "ref")) => Some(
                self.git
                    .tag
                    .clone()
                    .unwrap_or_else(|| self.git.branch.clone()),
            ),
            Some(("app", "name")) => Some(self.app.name.clone()),
            Some(("app", "dir")) => Some(self.app.dir.clone()),
            Some(("env", key)) => self.env.get(key).cloned(),
            Some(("secrets", key)) => self.secrets.get(key).cloned(),
            Some(_) => None,
            None => match name {
                "date" => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
                "timestamp" => Some(chrono::Utc::now().timestamp().to_string()),
                _ => self.custom.get(name).cloned(),
            },
        }
    }

    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &Captures| {
                self.resolve(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Interpolate a value that is written into a template or asset.
    /// `${secrets.*}` is rejected there.
    pub fn interpolate_public(&self, field: &str, input: &str) -> ConfigResult<String> {
        if let Some(name) = secret_reference(input) {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!(
                    "'${{secrets.{}}}' is only resolved in pipeline commands and environment; \
                     use a secret reference instead",
                    name
                ),
            });
        }
        Ok(self.interpolate(input))
    }

    pub fn interpolate_public_vec(&self, field: &str, inputs: &[String]) -> ConfigResult<Vec<String>> {
        inputs
            .iter()
            .map(|s| self.interpolate_public(field, s))
            .collect()
    }

    pub fn interpolate_public_map(
        &self,
        field: &str,
        map: &BTreeMap<String, String>,
    ) -> ConfigResult<BTreeMap<String, String>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.interpolate_public(field, v)?)))
            .collect()
    }

    /// The same context with no secret values, so `${secrets.*}` is left
    /// as written.
    pub fn without_secrets(&self) -> Self {
        Self {
            secrets: HashMap::new(),
            ..self.clone()
        }
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Replace every known secret value in `input` with `***`. Longer values
    /// are masked first so a secret containing another is hidden whole.
    pub fn mask(&self, input: &str) -> String {
        let mut values: Vec<&str> = self
            .secrets
            .values()
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        values
            .into_iter()
            .fold(input.to_string(), |masked, value| masked.replace(value, "***"))
    }
}

/// Name of the first `${secrets.*}` reference in `input`.
fn secret_reference(input: &str) -> Option<String> {
    VAR_REGEX.captures_iter(input).find_map(|caps| {
        caps[1]
            .strip_prefix("secrets.")
            .map(String::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces() {
        let mut ctx = VariableContext::new()
            .with_env("REGION", "eu-west-1")
            .with_secret("asset-test", "ghp_abc");
        ctx.git.sha = "abc1234567890".to_string();
        ctx.git.short_sha = "abc1234".to_string();
        ctx.git.branch = "master".to_string();
        ctx.app.name = "asset-test".to_string();

        assert_eq!(
            ctx.interpolate("${app.name}@${git.short_sha} on ${git.ref} in ${env.REGION}"),
            "asset-test@abc1234 on master in eu-west-1"
        );
        assert_eq!(ctx.interpolate("${secrets.asset-test}"), "ghp_abc");
    }

    #[test]
    fn test_tag_wins_over_branch_for_ref() {
        let mut ctx = VariableContext::new();
        ctx.git.branch = "master".to_string();
        ctx.git.tag = Some("v1.0.0".to_string());
        assert_eq!(ctx.interpolate("${git.ref}"), "v1.0.0");
    }

    #[test]
    fn test_unknown_references_are_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(
            ctx.interpolate("docker login -u ${DOCKERHUB_USERNAME} ${env.MISSING} ${git.nope}"),
            "docker login -u ${DOCKERHUB_USERNAME} ${env.MISSING} ${git.nope}"
        );
    }

    #[test]
    fn test_custom_and_computed() {
        let ctx = VariableContext::new().with_var("version", "1.2.3");
        assert_eq!(ctx.interpolate("v${version}"), "v1.2.3");

        let date = ctx.interpolate("${date}");
        assert_eq!(date.len(), 10);
        assert_eq!(date.matches('-').count(), 2);
    }

    #[test]
    fn test_json_braces_untouched() {
        let ctx = VariableContext::new().with_var("stage", "prod");
        assert_eq!(
            ctx.interpolate(r#"{"stage": "${stage}"}"#),
            r#"{"stage": "prod"}"#
        );
    }

    #[test]
    fn test_interpolate_collections() {
        let ctx = VariableContext::new().with_var("out", "cdk.out");
        assert_eq!(
            ctx.interpolate_vec(&["ls ${out}".to_string()]),
            vec!["ls cdk.out".to_string()]
        );

        let env = BTreeMap::from([("OUT".to_string(), "${out}".to_string())]);
        assert_eq!(ctx.interpolate_map(&env)["OUT"], "cdk.out");
    }

    #[test]
    fn test_mask_prefers_longest_secret() {
        let ctx = VariableContext::new()
            .with_secret("short", "abc")
            .with_secret("long", "abcdef")
            .with_secret("empty", "");
        assert_eq!(ctx.mask("token=abcdef other=abc"), "token=*** other=***");
    }

    #[test]
    fn test_public_values_refuse_secrets() {
        let ctx = VariableContext::new()
            .with_var("stage", "prod")
            .with_secret("token", "ghp_abc");

        assert_eq!(ctx.interpolate_public("handler", "${stage}.main").unwrap(), "prod.main");
        let err = ctx
            .interpolate_public("handler", "prefix-${secrets.token}")
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { field, message } => {
                assert_eq!(field, "handler");
                assert!(message.contains("secrets.token"));
                assert!(!message.contains("ghp_abc"));
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let env = BTreeMap::from([("TOKEN".to_string(), "${secrets.token}".to_string())]);
        assert!(ctx.interpolate_public_map("env", &env).is_err());
    }

    #[test]
    fn test_without_secrets_keeps_reference() {
        let ctx = VariableContext::new()
            .with_var("stage", "prod")
            .with_secret("token", "ghp_abc")
            .without_secrets();
        assert_eq!(
            ctx.interpolate("login ${secrets.token} ${stage}"),
            "login ${secrets.token} prod"
        );
    }

    #[test]
    fn test_from_git_repo_outside_repository() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = VariableContext::from_git_repo(&dir.path().to_string_lossy());
        assert!(ctx.git.sha.is_empty());
        assert_eq!(ctx.app.dir, dir.path().to_string_lossy());
    }
}
