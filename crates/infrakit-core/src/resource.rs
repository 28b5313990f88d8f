//! Resource declarations and property values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::asset::Asset;
use crate::secret::SecretRef;

/// Provider resource type (e.g. `infrakit::function`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    /// A serverless function.
    pub const FUNCTION: &'static str = "infrakit::function";
    /// A deployment pipeline.
    pub const PIPELINE: &'static str = "infrakit::pipeline";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn function() -> Self {
        Self::new(Self::FUNCTION)
    }

    pub fn pipeline() -> Self {
        Self::new(Self::PIPELINE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value in a resource's property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Number(i64),
    Bool(bool),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    /// Reference to another resource. `target` is relative to the enclosing
    /// stack, or absolute from the app root when it starts with `/`.
    Ref {
        target: String,
        attribute: Option<String>,
    },
    /// Secret resolved by the provider at deploy time.
    Secret(SecretRef),
    /// Local file asset uploaded before deployment.
    Asset(Asset),
}

impl PropertyValue {
    pub fn reference(target: impl Into<String>) -> Self {
        PropertyValue::Ref {
            target: target.into(),
            attribute: None,
        }
    }

    pub fn attribute(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        PropertyValue::Ref {
            target: target.into(),
            attribute: Some(attribute.into()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// All references contained in this value, depth first.
    pub fn references(&self) -> Vec<(&str, Option<&str>)> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<(&'a str, Option<&'a str>)>) {
        match self {
            PropertyValue::Ref { target, attribute } => {
                refs.push((target.as_str(), attribute.as_deref()));
            }
            PropertyValue::List(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            PropertyValue::Map(map) => {
                for value in map.values() {
                    value.collect_references(refs);
                }
            }
            _ => {}
        }
    }

    /// All assets contained in this value, depth first.
    pub fn assets(&self) -> Vec<&Asset> {
        match self {
            PropertyValue::Asset(asset) => vec![asset],
            PropertyValue::List(items) => items.iter().flat_map(|v| v.assets()).collect(),
            PropertyValue::Map(map) => map.values().flat_map(|v| v.assets()).collect(),
            _ => Vec::new(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// A typed resource declaration owned by a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Construct id, unique within the parent stack.
    pub id: String,
    pub kind: ResourceKind,
    pub properties: BTreeMap<String, PropertyValue>,
    /// Explicit ordering dependencies (same addressing as `Ref` targets).
    pub depends_on: Vec<String>,
}

impl Resource {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_dependency(mut self, target: impl Into<String>) -> Self {
        self.depends_on.push(target.into());
        self
    }

    /// Every outgoing edge of this resource: property references followed by
    /// explicit dependencies.
    pub fn edges(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self
            .properties
            .values()
            .flat_map(|v| v.references())
            .map(|(target, _)| target)
            .collect();
        targets.extend(self.depends_on.iter().map(String::as_str));
        targets
    }

    pub fn assets(&self) -> Vec<&Asset> {
        self.properties.values().flat_map(|v| v.assets()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_references() {
        let mut env = BTreeMap::new();
        env.insert("TABLE".to_string(), PropertyValue::reference("table"));
        env.insert("QUEUE".to_string(), PropertyValue::attribute("queue", "Arn"));

        let resource = Resource::new("fn", ResourceKind::function())
            .with_property("environment", PropertyValue::Map(env))
            .with_property(
                "layers",
                PropertyValue::List(vec![PropertyValue::reference("/shared/layer")]),
            )
            .with_dependency("bucket");

        let mut edges = resource.edges();
        edges.sort();
        assert_eq!(edges, vec!["/shared/layer", "bucket", "queue", "table"]);
    }

    #[test]
    fn test_property_value_serialization() {
        let value = PropertyValue::attribute("queue", "Arn");
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ref": {"target": "queue", "attribute": "Arn"}})
        );
    }
}
