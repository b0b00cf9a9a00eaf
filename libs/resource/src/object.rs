//! Opaque cluster object representation.
//!
//! Only `metadata` is typed. Everything else (`apiVersion`, `kind`, `spec`,
//! `status`, ...) is carried verbatim so the agent never drops fields it
//! does not understand when it writes an object back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ResourceError;
use crate::key::ResourceKey;

/// Object metadata common to every resource kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Opaque store version. Only ever compared for equality.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Remaining metadata fields (creationTimestamp, ownerReferences, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A named, namespaced cluster object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Resource {
    /// Create an empty object of the given kind.
    pub fn new(
        api_version: &str,
        kind: &str,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        let mut body = Map::new();
        body.insert("apiVersion".to_string(), Value::String(api_version.to_string()));
        body.insert("kind".to_string(), Value::String(kind.to_string()));

        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.metadata.labels
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    /// The object's `kind`, if present.
    pub fn kind(&self) -> Option<&str> {
        self.body.get("kind").and_then(Value::as_str)
    }

    /// The object's `spec`, if present.
    pub fn spec(&self) -> Option<&Value> {
        self.body.get("spec")
    }

    /// Build the key this object is tracked under.
    pub fn key(&self) -> Result<ResourceKey, ResourceError> {
        ResourceKey::new(self.metadata.name.clone(), self.metadata.namespace.clone())
    }

    /// Convert to a JSON value.
    pub fn to_value(&self) -> Value {
        // Serializing maps of strings and JSON values cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse from a JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// The result of a list call: the items plus the store version the listing
/// is consistent with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub resource_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_preserves_unknown_fields() {
        let raw = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": "web",
                "namespace": "default",
                "resourceVersion": "42",
                "creationTimestamp": "2024-01-01T00:00:00Z",
                "annotations": { "a": "b" }
            },
            "spec": { "type": "ClusterIP" },
            "status": {}
        });

        let resource = Resource::from_value(raw.clone()).unwrap();
        assert_eq!(resource.name(), "web");
        assert_eq!(resource.namespace(), "default");
        assert_eq!(resource.resource_version(), Some("42"));
        assert_eq!(resource.kind(), Some("Service"));
        assert_eq!(resource.annotation("a"), Some("b"));
        assert_eq!(resource.to_value(), raw);
    }

    #[test]
    fn test_new_resource_key() {
        let resource = Resource::new("v1", "Service", "web", "default");
        let key = resource.key().unwrap();
        assert_eq!(key.to_string(), "default/web");

        let unnamed = Resource::new("v1", "Service", "", "default");
        assert_eq!(unnamed.key(), Err(ResourceError::EmptyName));
    }
}
