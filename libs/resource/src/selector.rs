//! Label and field selectors.
//!
//! Only equality requirements are supported: a label selector is a set of
//! `key=value` pairs that must all be present on the candidate, and a field
//! selector restricts a listing to one object name.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ResourceError;
use crate::object::Resource;

/// Returns true if every pair in `required` is present in `candidate`.
///
/// An empty requirement matches everything.
pub fn map_contains(candidate: &BTreeMap<String, String>, required: &BTreeMap<String, String>) -> bool {
    required
        .iter()
        .all(|(k, v)| candidate.get(k).is_some_and(|actual| actual == v))
}

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    required: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Build a selector, rejecting pairs that cannot be written as `k=v`.
    pub fn new(required: BTreeMap<String, String>) -> Result<Self, ResourceError> {
        for (key, value) in &required {
            validate_term(key, value)?;
        }
        Ok(Self { required })
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, ResourceError>
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    pub fn required(&self) -> &BTreeMap<String, String> {
        &self.required
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        map_contains(labels, &self.required)
    }

    pub fn matches_resource(&self, resource: &Resource) -> bool {
        self.matches(resource.labels())
    }

    /// Query string form, keys sorted: `app=web,tier=front`.
    pub fn to_query(&self) -> String {
        self.required
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

fn validate_term(key: &str, value: &str) -> Result<(), ResourceError> {
    let term = || format!("{key}={value}");

    if key.is_empty() {
        return Err(ResourceError::InvalidSelector {
            term: term(),
            reason: "empty key",
        });
    }
    if key.chars().chain(value.chars()).any(|c| matches!(c, ',' | '=' | '!') || c.is_whitespace()) {
        return Err(ResourceError::InvalidSelector {
            term: term(),
            reason: "reserved character",
        });
    }
    Ok(())
}

/// Field selector restricting a listing to a single object name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    name: Option<String>,
}

impl FieldSelector {
    /// Select everything.
    pub fn everything() -> Self {
        Self { name: None }
    }

    /// Select exactly the object called `name`.
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    pub fn target_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn matches(&self, resource: &Resource) -> bool {
        self.name
            .as_deref()
            .is_none_or(|name| resource.name() == name)
    }

    /// Query string form, or `None` when nothing is restricted.
    pub fn to_query(&self) -> Option<String> {
        self.name.as_ref().map(|name| format!("metadata.name={name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case(&[("app", "web")], &[("app", "web")], true)]
    #[case(&[("app", "web"), ("tier", "front")], &[("app", "web")], true)]
    #[case(&[("app", "web")], &[("app", "web"), ("tier", "front")], false)]
    #[case(&[("app", "api")], &[("app", "web")], false)]
    #[case(&[], &[], true)]
    #[case(&[("app", "web")], &[], true)]
    fn test_map_contains(
        #[case] candidate: &[(&str, &str)],
        #[case] required: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        assert_eq!(map_contains(&labels(candidate), &labels(required)), expected);
    }

    #[test]
    fn test_label_selector_query_is_sorted() {
        let selector = LabelSelector::from_pairs([("tier", "front"), ("app", "web")]).unwrap();
        assert_eq!(selector.to_query(), "app=web,tier=front");
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front"), ("x", "y")])));
    }

    #[rstest]
    #[case("", "web")]
    #[case("app,x", "web")]
    #[case("app", "a=b")]
    #[case("app", "has space")]
    fn test_label_selector_rejects_bad_terms(#[case] key: &str, #[case] value: &str) {
        let err = LabelSelector::from_pairs([(key, value)]).unwrap_err();
        assert!(matches!(err, ResourceError::InvalidSelector { .. }));
    }

    #[test]
    fn test_field_selector() {
        let web = Resource::new("v1", "Service", "web", "default");
        let api = Resource::new("v1", "Service", "api", "default");

        let selector = FieldSelector::name("web");
        assert_eq!(selector.to_query().as_deref(), Some("metadata.name=web"));
        assert!(selector.matches(&web));
        assert!(!selector.matches(&api));

        let all = FieldSelector::everything();
        assert_eq!(all.to_query(), None);
        assert!(all.matches(&api));
    }
}
