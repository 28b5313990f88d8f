//! Identifiers: run ids, construct paths and provider logical ids.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unique identifier for runs, jobs and deployments.
/// Uses UUIDv7 for time-ordered, sortable IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ResourceId(Uuid);

impl ResourceId {
    /// Create a new unique ResourceId using UUIDv7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ResourceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for ResourceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Path of a construct from the app root, excluding the app id itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstructPath(Vec<String>);

impl ConstructPath {
    pub const SEPARATOR: char = '/';

    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Parse a `/`-separated path. Leading and trailing separators are ignored.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split(Self::SEPARATOR)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect(),
        )
    }

    pub fn child(&self, id: &str) -> Self {
        let mut components = self.0.clone();
        components.push(id.to_string());
        Self(components)
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Components after `prefix`, if `prefix` is an ancestor (or equal).
    pub fn strip_prefix(&self, prefix: &ConstructPath) -> Option<&[String]> {
        self.0.strip_prefix(prefix.0.as_slice())
    }

    /// Join the components with `-`, used for artifact and directory names.
    pub fn to_dashed(&self) -> String {
        self.0.join("-")
    }
}

impl std::fmt::Display for ConstructPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Components hidden from the human-readable part of a logical id.
const HIDDEN_COMPONENTS: &[&str] = &["Default", "Resource"];

/// Maximum length of a provider logical id.
const MAX_LOGICAL_ID_LEN: usize = 255;

const HASH_LEN: usize = 8;

/// Compute a stable provider logical id from construct path components
/// (relative to the enclosing stack).
///
/// A single component yields the component with non-alphanumeric characters
/// removed. Longer paths get the sanitized components concatenated and
/// suffixed with the first 8 hex digits of the path's md5, uppercased.
pub fn logical_id<S: AsRef<str>>(components: &[S]) -> String {
    let parts: Vec<&str> = components.iter().map(|c| c.as_ref()).collect();

    if parts.len() == 1 {
        let candidate = sanitize(parts[0]);
        if candidate.len() <= MAX_LOGICAL_ID_LEN {
            return candidate;
        }
    }

    let digest = md5::compute(parts.join("/").as_bytes());
    let hash = format!("{:x}", digest)[..HASH_LEN].to_uppercase();

    let mut human = String::new();
    let mut previous: Option<&str> = None;
    for part in &parts {
        if HIDDEN_COMPONENTS.contains(part) || previous == Some(*part) {
            continue;
        }
        human.push_str(&sanitize(part));
        previous = Some(*part);
    }
    human.truncate(MAX_LOGICAL_ID_LEN - HASH_LEN);

    format!("{}{}", human, hash)
}

fn sanitize(component: &str) -> String {
    component.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_component_logical_id() {
        assert_eq!(logical_id(&["hello"]), "hello");
        assert_eq!(logical_id(&["my-bucket_1"]), "mybucket1");
    }

    #[test]
    fn test_nested_logical_id_is_stable() {
        let first = logical_id(&["api", "handler"]);
        let second = logical_id(&["api", "handler"]);
        assert_eq!(first, second);
        assert!(first.starts_with("apihandler"));
        assert_eq!(first.len(), "apihandler".len() + 8);
        assert!(first[10..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_hidden_components_keep_hash() {
        let id = logical_id(&["hello", "Resource"]);
        assert!(id.starts_with("hello"));
        assert_ne!(id, logical_id(&["hello", "Default"]));
        assert_eq!(id.len(), "hello".len() + 8);
    }

    #[test]
    fn test_construct_path_parsing() {
        let path = ConstructPath::parse("/pipelinestack/stage/stack/");
        assert_eq!(path.components(), &["pipelinestack", "stage", "stack"]);
        assert_eq!(path.to_string(), "pipelinestack/stage/stack");
        assert_eq!(path.to_dashed(), "pipelinestack-stage-stack");

        let prefix = ConstructPath::parse("pipelinestack/stage");
        assert_eq!(path.strip_prefix(&prefix), Some(&["stack".to_string()][..]));
        assert!(prefix.strip_prefix(&path).is_none());
    }
}
