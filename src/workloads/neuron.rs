//! Neuron device checks: a single-node Job and an nccom collective MPIJob.

use std::time::Duration;

use super::mpi_job::MpiJob;
use super::workload_job::WorkloadJob;
use crate::inventory::HardwareSnapshot;
use crate::models::{EFA_INTERFACE, NEURON_CORE, NEURON_DEVICE};

pub const SINGLE_NODE_JOB_NAME: &str = "neuronx-single-node";
pub const MULTI_NODE_JOB_NAME: &str = "multi-node-nccom-test";

pub const SINGLE_NODE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const MULTI_NODE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Device counts the neuron workloads are sized from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeuronShape {
    pub node_count: i64,
    pub neuron_per_node: i64,
    pub neuron_core_per_node: i64,
    pub efa_per_node: i64,
}

impl NeuronShape {
    pub fn of(snapshot: &HardwareSnapshot) -> Self {
        Self {
            node_count: snapshot.node_count as i64,
            neuron_per_node: snapshot.per_node(NEURON_DEVICE),
            neuron_core_per_node: snapshot.per_node(NEURON_CORE),
            efa_per_node: snapshot.per_node(EFA_INTERFACE),
        }
    }

    pub fn total_cores(&self) -> i64 {
        self.node_count * self.neuron_core_per_node
    }
}

/// Job exercising every neuron device of one node
pub fn single_node(namespace: &str, image: &str, shape: NeuronShape) -> WorkloadJob {
    WorkloadJob::new(SINGLE_NODE_JOB_NAME, namespace, image)
        .resource(NEURON_DEVICE, shape.neuron_per_node.max(1))
        .command(["python3", "/opt/neuron-test/test_single_node.py"])
        .env("NEURON_PER_NODE", shape.neuron_per_node)
        .with_timeout(SINGLE_NODE_TIMEOUT)
}

fn nccom_command(shape: NeuronShape) -> Vec<String> {
    vec![
        "nccom-test".to_string(),
        "-r".to_string(),
        shape.total_cores().to_string(),
        "-N".to_string(),
        shape.node_count.to_string(),
        "allr".to_string(),
        "--minbytes".to_string(),
        "8".to_string(),
        "--maxbytes".to_string(),
        "1G".to_string(),
        "--stepfactor".to_string(),
        "2".to_string(),
        "--datatype".to_string(),
        "fp32".to_string(),
        "--check".to_string(),
    ]
}

/// All-reduce over every neuron core of every node
pub fn nccom_multi_node(namespace: &str, image: &str, shape: NeuronShape) -> MpiJob {
    MpiJob::new(MULTI_NODE_JOB_NAME, namespace, image)
        .label("suite", "neuron")
        .label("hardware", "neuron")
        .workers(shape.node_count, shape.neuron_core_per_node)
        .worker_resource(NEURON_DEVICE, shape.neuron_per_node)
        .worker_resource(EFA_INTERFACE, shape.efa_per_node)
        .launcher_command(nccom_command(shape))
        .env("FI_PROVIDER", if shape.efa_per_node > 0 { "efa" } else { "tcp" })
        .with_timeout(MULTI_NODE_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workloads::Workload;

    const TRN1: NeuronShape = NeuronShape {
        node_count: 2,
        neuron_per_node: 16,
        neuron_core_per_node: 32,
        efa_per_node: 8,
    };

    #[test]
    fn test_single_node_requests_all_devices() {
        let job = single_node("default", "neuron-test", TRN1);
        assert_eq!(job.name(), "neuronx-single-node");
        assert_eq!(job.resources.get(NEURON_DEVICE).map(String::as_str), Some("16"));
        assert_eq!(job.expected_duration(), SINGLE_NODE_TIMEOUT);
        assert_eq!(job.env.get("NEURON_PER_NODE").map(String::as_str), Some("16"));
    }

    #[test]
    fn test_nccom_spans_every_core() {
        let job = nccom_multi_node("default", "neuron-test", TRN1);
        assert_eq!(job.ranks(), 64);
        assert_eq!(job.worker_resources.get(EFA_INTERFACE), Some(&8));
        assert_eq!(&job.launcher_command[..5], ["nccom-test", "-r", "64", "-N", "2"]);
        assert_eq!(job.timeout, MULTI_NODE_TIMEOUT);
        assert!(job.env.contains(&("FI_PROVIDER".to_string(), "efa".to_string())));
    }

    #[test]
    fn test_without_efa_falls_back_to_tcp() {
        let shape = NeuronShape {
            efa_per_node: 0,
            ..TRN1
        };
        let job = nccom_multi_node("default", "neuron-test", shape);
        assert!(!job.worker_resources.contains_key(EFA_INTERFACE));
        assert!(job.env.contains(&("FI_PROVIDER".to_string(), "tcp".to_string())));
    }
}
