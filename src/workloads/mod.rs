//! Builders for the objects a campaign launches.
//!
//! Every builder produces typed objects (or a schemaless document for
//! operator CRDs) and implements [`Workload`], which turns them into a
//! [`ManifestSet`] that is applied, rendered for `--dry-run`, and reaped in
//! reverse order like any other manifest.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::manifest::ManifestSet;
use crate::models::HOSTNAME_LABEL;

pub mod bert;
pub mod device_pod;
pub mod dra;
pub mod echo;
pub mod heartbeat_pod;
pub mod mpi_job;
pub mod nccl;
pub mod netpol;
pub mod neuron;
pub mod npm_install;
pub mod pi;
pub mod pingpong;
pub mod sleep_pod;
pub mod workload_job;

/// Something a feature deploys
pub trait Workload: Send + Sync {
    /// Name of the primary object
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// How long the primary object may take to finish
    fn expected_duration(&self) -> Duration;

    /// Documents in apply order
    fn manifests(&self) -> Result<ManifestSet>;
}

/// Serialize objects of one type into a manifest set; mixed kinds go through
/// [`serde_json::Value`] first
pub fn manifest_of<T: Serialize>(name: &str, objects: &[T]) -> Result<ManifestSet> {
    let mut rendered = String::new();
    for object in objects {
        if !rendered.is_empty() {
            rendered.push_str("---\n");
        }
        rendered.push_str(&serde_yaml::to_string(object)?);
    }
    ManifestSet::parse(name, rendered)
}

/// Random alphanumeric payload of `len` characters
pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `<prefix>-<unix seconds>`
pub fn timestamped(prefix: &str) -> String {
    format!("{}-{}", prefix, chrono::Utc::now().timestamp())
}

/// Requests equal to limits, which gives the pod Guaranteed QoS
pub fn guaranteed<K, V>(resources: impl IntoIterator<Item = (K, V)>) -> ResourceRequirements
where
    K: Into<String>,
    V: Into<String>,
{
    let list: BTreeMap<String, Quantity> = resources
        .into_iter()
        .map(|(k, v)| (k.into(), Quantity(v.into())))
        .collect();
    ResourceRequirements {
        requests: Some(list.clone()),
        limits: Some(list),
        ..Default::default()
    }
}

/// Required node affinity on the hostname label
pub fn hostname_affinity(node: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `{app: name}` label map
pub fn app_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string_length_and_charset() {
        let payload = random_string(100 * 1024);
        assert_eq!(payload.len(), 100 * 1024);
        assert!(payload.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(random_string(32), random_string(32));
    }

    #[test]
    fn test_timestamped_name() {
        let name = timestamped("termination-canary");
        let suffix = name.strip_prefix("termination-canary-").unwrap();
        assert!(suffix.parse::<i64>().unwrap() > 1_600_000_000);
    }

    #[test]
    fn test_guaranteed_requests_equal_limits() {
        let resources = guaranteed([("cpu", "250m"), ("memory", "64Mi")]);
        assert_eq!(resources.requests, resources.limits);
        assert_eq!(resources.limits.unwrap()["cpu"], Quantity("250m".to_string()));
    }

    #[test]
    fn test_hostname_affinity_pins_node() {
        let affinity = hostname_affinity("ip-10-0-0-1");
        let term = &affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms[0];
        let requirement = &term.match_expressions.as_ref().unwrap()[0];
        assert_eq!(requirement.key, HOSTNAME_LABEL);
        assert_eq!(requirement.values.as_deref(), Some(&["ip-10-0-0-1".to_string()][..]));
    }
}
