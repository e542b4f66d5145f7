//! Helpers for objects addressed only by group/version/kind.
//!
//! External operator resources such as MPIJob are handled as
//! [`DynamicObject`]s; fields are read and written by dotted path
//! (`spec.mpiReplicaSpecs.Worker.replicas`) instead of through generated types.

use kube::api::DynamicObject;
use kube::core::ApiResource;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

// irregular plurals of kinds this crate touches
const KIND_PLURALS: &[(&str, &str)] = &[
    ("networkpolicy", "networkpolicies"),
    ("ingress", "ingresses"),
    ("deviceclass", "deviceclasses"),
    ("resourceclaimtemplate", "resourceclaimtemplates"),
    ("endpoints", "endpoints"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from apiVersion and kind without asking the API server
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

// cluster-scoped kinds used when discovery is unavailable
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "DeviceClass",
    "PersistentVolume",
    "StorageClass",
    "PriorityClass",
];

/// Best guess at the scope of a kind when discovery could not answer
pub fn is_cluster_scoped_kind(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Dotted-path access into nested documents
pub trait FieldPath {
    fn field(&self, path: &str) -> Option<&Value>;

    fn set_field(&mut self, path: &str, value: Value) -> Result<()>;

    fn field_str(&self, path: &str) -> Option<&str> {
        self.field(path).and_then(Value::as_str)
    }

    fn field_i64(&self, path: &str) -> Option<i64> {
        self.field(path).and_then(Value::as_i64)
    }

    fn field_array(&self, path: &str) -> Option<&Vec<Value>> {
        self.field(path).and_then(Value::as_array)
    }
}

impl FieldPath for Value {
    fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |current, segment| current.get(segment))
    }

    fn set_field(&mut self, path: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(Error::config("empty field path"));
        };

        let mut current = self;
        for segment in parents {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().ok_or_else(|| {
                Error::config(format!("field path {path}: {segment} is not an object"))
            })?;
            current = map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let map = current
            .as_object_mut()
            .ok_or_else(|| Error::config(format!("field path {path}: parent is not an object")))?;
        map.insert(last.to_string(), value);
        Ok(())
    }
}

impl FieldPath for DynamicObject {
    // metadata is typed on DynamicObject; everything else lives in `data`
    fn field(&self, path: &str) -> Option<&Value> {
        self.data.field(path)
    }

    fn set_field(&mut self, path: &str, value: Value) -> Result<()> {
        self.data.set_field(path, value)
    }
}
