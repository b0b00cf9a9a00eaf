//! Liveness patch encoding.
//!
//! The heartbeat writes a single annotation with a blind JSON patch
//! (RFC 6902). The document never reads or depends on prior object state:
//! an `add` on an existing object member replaces its value, and no other
//! annotation is touched, so concurrent heartbeats from several agents and
//! unrelated writers never conflict.
//!
//! The `add` needs an existing `annotations` map. Objects created through
//! the lifecycle facade are seeded with the marker. An object without any
//! annotations gets the map written once via [`LivenessPatch::to_seed_bytes`],
//! guarded by a `test` on its resourceVersion so a concurrent writer's map
//! is never overwritten.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::object::Resource;

/// Annotation key shared between the heartbeat writer and the reaper.
pub const DEFAULT_HEARTBEAT_ANNOTATION: &str = "tether.io/last-heartbeat";

/// Wire format of the timestamp written into the annotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFormat {
    /// Seconds since the Unix epoch, e.g. `1717171717`.
    #[default]
    Unix,
    /// RFC 3339 with second precision, e.g. `2024-05-31T16:08:37Z`.
    Rfc3339,
}

impl TimestampFormat {
    pub fn format(&self, at: DateTime<Utc>) -> String {
        match self {
            TimestampFormat::Unix => at.timestamp().to_string(),
            TimestampFormat::Rfc3339 => at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }

    pub fn parse(&self, raw: &str) -> Option<DateTime<Utc>> {
        match self {
            TimestampFormat::Unix => raw
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            TimestampFormat::Rfc3339 => DateTime::parse_from_rfc3339(raw.trim())
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl std::str::FromStr for TimestampFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unix" | "epoch" => Ok(TimestampFormat::Unix),
            "rfc3339" => Ok(TimestampFormat::Rfc3339),
            other => Err(format!("unknown timestamp format: {other}")),
        }
    }
}

/// One JSON patch operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// The liveness marker written on every heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessPatch {
    annotation: String,
    timestamp: String,
}

impl LivenessPatch {
    pub fn new(annotation: &str, at: DateTime<Utc>, format: TimestampFormat) -> Self {
        Self {
            annotation: annotation.to_string(),
            timestamp: format.format(at),
        }
    }

    /// Patch stamped with the current time.
    pub fn now(annotation: &str, format: TimestampFormat) -> Self {
        Self::new(annotation, Utc::now(), format)
    }

    pub fn annotation(&self) -> &str {
        &self.annotation
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// JSON pointer of the annotation inside the object.
    pub fn path(&self) -> String {
        format!("/metadata/annotations/{}", escape_pointer_token(&self.annotation))
    }

    pub fn operations(&self) -> Vec<PatchOp> {
        vec![PatchOp {
            op: "add".to_string(),
            path: self.path(),
            value: Some(self.timestamp.clone()),
        }]
    }

    /// Serialize to the `application/json-patch+json` body.
    pub fn to_bytes(&self) -> Vec<u8> {
        // A Vec of plain string structs always serializes.
        serde_json::to_vec(&self.operations()).unwrap_or_default()
    }

    /// Patch body creating the `annotations` map holding only the marker.
    ///
    /// With `resource_version` the patch is rejected unless the object is
    /// still at that version.
    pub fn to_seed_bytes(&self, resource_version: Option<&str>) -> Vec<u8> {
        let mut ops = Vec::with_capacity(2);
        if let Some(version) = resource_version {
            ops.push(json!({"op": "test", "path": "/metadata/resourceVersion", "value": version}));
        }
        let mut annotations = serde_json::Map::new();
        annotations.insert(self.annotation.clone(), Value::String(self.timestamp.clone()));
        ops.push(json!({"op": "add", "path": "/metadata/annotations", "value": annotations}));
        serde_json::to_vec(&ops).unwrap_or_default()
    }

    /// Read the marker back from an object.
    pub fn parse_timestamp(
        resource: &Resource,
        annotation: &str,
        format: TimestampFormat,
    ) -> Option<DateTime<Utc>> {
        resource
            .annotation(annotation)
            .and_then(|raw| format.parse(raw))
    }
}

/// Build the liveness patch body for `annotation` stamped at `at`.
pub fn encode_liveness_patch(annotation: &str, at: DateTime<Utc>, format: TimestampFormat) -> Vec<u8> {
    LivenessPatch::new(annotation, at, format).to_bytes()
}

/// Escape one JSON pointer reference token (RFC 6901).
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
