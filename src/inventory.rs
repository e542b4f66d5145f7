use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::ClusterClient;
use crate::conditions::Verdict;
use crate::error::{Error, Result};
use crate::models::*;
use crate::wait::{self, WaitOptions};

/// How long device plugins get to publish capacities
pub const CAPACITY_RETRY_TIMEOUT: Duration = Duration::from_secs(60);

/// Accelerator resources recorded for every counted node
pub const ACCELERATOR_RESOURCES: &[&str] = &[NVIDIA_GPU, NEURON_DEVICE, NEURON_CORE, EFA_INTERFACE];

/// Parse a Kubernetes quantity into a whole number.
///
/// Device capacities are plain integers; decimal and binary suffixes are
/// accepted for completeness, fractional values are rejected.
pub fn parse_quantity(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '-' || c == '+'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let value: i64 = number.parse().ok()?;
    let multiplier: i64 = match suffix {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

/// Capacity of one extended resource on a node, if advertised
pub fn capacity_of(node: &Node, resource: &str) -> Option<i64> {
    let quantity = node.status.as_ref()?.capacity.as_ref()?.get(resource)?;
    parse_quantity(&quantity.0)
}

pub fn instance_type_of(node: &Node) -> Option<&str> {
    node.metadata
        .labels
        .as_ref()?
        .get(INSTANCE_TYPE_LABEL)
        .map(String::as_str)
}

/// What a suite needs from the cluster
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventoryRequest {
    /// Instance type to count; None adopts the type of the first labelled node
    pub instance_type: Option<String>,
    /// Resources every counted node must advertise with non-zero capacity
    pub required: Vec<String>,
    /// Declared per-node capacities that must match exactly
    pub expected_per_node: BTreeMap<String, i64>,
    /// Fail unless every node of the cluster has the same instance type
    pub require_uniform: bool,
}

impl InventoryRequest {
    pub fn new(instance_type: Option<String>) -> Self {
        Self {
            instance_type: instance_type.filter(|t| !t.is_empty()),
            ..Default::default()
        }
    }

    pub fn require(mut self, resource: impl Into<String>) -> Self {
        let resource = resource.into();
        if !self.required.contains(&resource) {
            self.required.push(resource);
        }
        self
    }

    pub fn expect_per_node(mut self, resource: impl Into<String>, count: i64) -> Self {
        self.expected_per_node.insert(resource.into(), count);
        self
    }

    pub fn uniform(mut self) -> Self {
        self.require_uniform = true;
        self
    }
}

/// Capacities of one counted node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub name: String,
    pub capacity: BTreeMap<String, i64>,
}

/// Hardware the campaign runs against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub instance_type: String,
    pub node_count: usize,
    pub nodes: Vec<NodeCapacity>,
    pub totals: BTreeMap<String, i64>,
    pub per_node: BTreeMap<String, i64>,
}

impl HardwareSnapshot {
    /// Build a snapshot from a node listing.
    ///
    /// Missing nodes and missing or zero capacities are transient because
    /// device plugins publish capacity asynchronously. A mixed cluster when
    /// uniformity is required and a per-node mismatch are terminal.
    pub fn from_nodes(nodes: &[Node], request: &InventoryRequest) -> Result<Self> {
        if nodes.is_empty() {
            return Err(Error::transient("no nodes found in the cluster"));
        }

        if request.require_uniform {
            let mut types: Vec<&str> = nodes.iter().filter_map(instance_type_of).collect();
            types.sort_unstable();
            types.dedup();
            if types.len() > 1 {
                return Err(Error::terminal(format!(
                    "node types are not the same, all node types must be the same in the cluster: {}",
                    types.join(", ")
                )));
            }
        }

        let instance_type = match &request.instance_type {
            Some(instance_type) => instance_type.clone(),
            None => {
                let adopted = nodes
                    .iter()
                    .find_map(instance_type_of)
                    .ok_or_else(|| Error::transient("no node carries an instance-type label"))?;
                info!("No node type specified. Using the node type {adopted} in the node groups.");
                adopted.to_string()
            }
        };

        let matching: Vec<&Node> = nodes
            .iter()
            .filter(|n| instance_type_of(n) == Some(instance_type.as_str()))
            .collect();
        if matching.is_empty() {
            return Err(Error::transient(format!(
                "no nodes match the specified nodeType: {instance_type}"
            )));
        }

        let mut counted = Vec::with_capacity(matching.len());
        for node in &matching {
            let mut capacity = BTreeMap::new();
            for resource in ACCELERATOR_RESOURCES
                .iter()
                .copied()
                .chain(request.required.iter().map(String::as_str))
            {
                if let Some(value) = capacity_of(node, resource) {
                    capacity.insert(resource.to_string(), value);
                }
            }
            for resource in &request.required {
                match capacity.get(resource) {
                    Some(value) if *value > 0 => {}
                    Some(_) => {
                        return Err(Error::transient(format!(
                            "node {} reports zero {}",
                            node.name_any(),
                            resource
                        )));
                    }
                    None => {
                        return Err(Error::transient(format!(
                            "node {} does not advertise {}",
                            node.name_any(),
                            resource
                        )));
                    }
                }
            }
            counted.push(NodeCapacity {
                name: node.name_any(),
                capacity,
            });
        }

        let node_count = counted.len();
        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for node in &counted {
            for (resource, value) in &node.capacity {
                *totals.entry(resource.clone()).or_default() += value;
            }
        }

        // required resources must divide evenly across the counted nodes
        for resource in &request.required {
            let first = counted[0].capacity.get(resource);
            if let Some(odd) = counted.iter().find(|n| n.capacity.get(resource) != first) {
                return Err(Error::transient(format!(
                    "{resource} differs across {instance_type} nodes: {} has {}, {} has {}",
                    counted[0].name,
                    first.copied().unwrap_or(0),
                    odd.name,
                    odd.capacity.get(resource).copied().unwrap_or(0)
                )));
            }
        }

        let per_node: BTreeMap<String, i64> = totals
            .iter()
            .map(|(resource, total)| (resource.clone(), total / node_count as i64))
            .collect();

        for (resource, expected) in &request.expected_per_node {
            let observed = per_node.get(resource).copied().unwrap_or(0);
            if observed != *expected {
                return Err(Error::terminal(format!(
                    "expected {expected} {resource} per node on {instance_type}, observed {observed}"
                )));
            }
        }

        Ok(Self {
            instance_type,
            node_count,
            nodes: counted,
            totals,
            per_node,
        })
    }

    /// Per-node capacity of a resource, zero when not advertised
    pub fn per_node(&self, resource: &str) -> i64 {
        self.per_node.get(resource).copied().unwrap_or(0)
    }

    pub fn total(&self, resource: &str) -> i64 {
        self.totals.get(resource).copied().unwrap_or(0)
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Names of counted nodes with a non-zero capacity of `resource`
    pub fn nodes_with(&self, resource: &str) -> Vec<&NodeCapacity> {
        self.nodes
            .iter()
            .filter(|n| n.capacity.get(resource).copied().unwrap_or(0) > 0)
            .collect()
    }

    pub fn log_summary(&self) {
        info!("Node Type: {}", self.instance_type);
        info!("Node Count: {}", self.node_count);
        for (resource, per_node) in &self.per_node {
            info!("{} per node: {}", resource, per_node);
        }
    }
}

/// True when at least one node has `minimum` or more of `resource`
pub fn minimum_on_any_node(nodes: &[Node], resource: &str, minimum: i64) -> Verdict {
    let best = nodes
        .iter()
        .filter_map(|n| capacity_of(n, resource))
        .max()
        .unwrap_or(0);
    if best >= minimum {
        Verdict::Met
    } else {
        Verdict::not_yet(format!(
            "largest {resource} capacity on any node is {best}, need {minimum}"
        ))
    }
}

/// List nodes once and build a snapshot
pub async fn probe(client: &ClusterClient, request: &InventoryRequest) -> Result<HardwareSnapshot> {
    let nodes = client.list_nodes().await?;
    debug!("Probing {} nodes", nodes.len());
    let snapshot = HardwareSnapshot::from_nodes(&nodes, request)?;
    snapshot.log_summary();
    Ok(snapshot)
}

/// Probe until capacities appear or the wait gives up
pub async fn probe_with_retry(
    client: &ClusterClient,
    request: &InventoryRequest,
    options: &WaitOptions,
) -> Result<HardwareSnapshot> {
    let check = |nodes: &Vec<Node>| HardwareSnapshot::from_nodes(nodes, request).map(|_| Verdict::Met);
    let nodes = wait::for_object("hardware inventory", options, || client.list_nodes(), &check).await?;
    let snapshot = HardwareSnapshot::from_nodes(&nodes, request)?;
    snapshot.log_summary();
    Ok(snapshot)
}
