//! BERT training and inference on either accelerator family.
//!
//! Training runs as an MPIJob; the operator's launcher Job is what gets
//! watched and whose logs carry the per-rank measurements. Inference is a
//! single Job sized to one node.

use regex::Regex;
use std::time::Duration;

use super::mpi_job::MpiJob;
use super::workload_job::WorkloadJob;
use crate::inventory::HardwareSnapshot;
use crate::logs::{PROCESS_THROUGHPUT, RANK_EPOCH_TIME, RANK_THROUGHPUT, scan_samples};
use crate::models::{Accelerator, EFA_INTERFACE, InferenceMode, NEURON_CORE, NEURON_DEVICE, NVIDIA_GPU};
use crate::results::Sample;

/// How long the operator may take to create the launcher Job
pub const LAUNCHER_CREATED_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Training includes model compilation on first run
pub const TRAINING_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const INFERENCE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

pub const THROUGHPUT: &str = "Throughput";
pub const EPOCH_TIME: &str = "Epoch Time";

/// Display unit of a metric produced by [`training_samples`]
pub fn unit_of(metric: &str) -> &'static str {
    match metric {
        EPOCH_TIME => "seconds",
        _ => "samples/second",
    }
}

pub fn training_job_name(accelerator: Accelerator) -> &'static str {
    match accelerator {
        Accelerator::Neuron => "neuron-training",
        Accelerator::Gpu => "bert-training",
    }
}

pub fn inference_job_name(accelerator: Accelerator) -> &'static str {
    match accelerator {
        Accelerator::Neuron => "neuron-inference",
        Accelerator::Gpu => "bert-inference",
    }
}

/// Per-rank measurements the trainer of `accelerator` prints
pub fn training_samples(accelerator: Accelerator, logs: &str) -> Vec<Sample> {
    let patterns: &[(&str, &Regex)] = match accelerator {
        Accelerator::Neuron => &[(THROUGHPUT, &RANK_THROUGHPUT), (EPOCH_TIME, &RANK_EPOCH_TIME)],
        Accelerator::Gpu => &[(THROUGHPUT, &PROCESS_THROUGHPUT)],
    };
    patterns
        .iter()
        .flat_map(|(metric, regex)| scan_samples(logs, metric, regex))
        .collect()
}

/// Distributed BERT pretraining across every node of the snapshot
#[derive(Debug, Clone)]
pub struct BertTraining {
    pub accelerator: Accelerator,
    pub namespace: String,
    pub image: String,
    pub node_type: String,
    pub node_count: i64,
    /// Devices requested per worker
    pub devices_per_node: i64,
    /// MPI slots per worker: neuron cores or GPUs
    pub slots_per_node: i64,
    pub efa_per_node: i64,
}

impl BertTraining {
    pub fn new(
        accelerator: Accelerator,
        namespace: &str,
        image: &str,
        snapshot: &HardwareSnapshot,
    ) -> Self {
        let (devices_per_node, slots_per_node) = match accelerator {
            Accelerator::Neuron => (snapshot.per_node(NEURON_DEVICE), snapshot.per_node(NEURON_CORE)),
            Accelerator::Gpu => {
                let gpus = snapshot.per_node(NVIDIA_GPU);
                (gpus, gpus)
            }
        };
        Self {
            accelerator,
            namespace: namespace.to_string(),
            image: image.to_string(),
            node_type: snapshot.instance_type.clone(),
            node_count: snapshot.node_count as i64,
            devices_per_node,
            slots_per_node,
            efa_per_node: snapshot.per_node(EFA_INTERFACE),
        }
    }

    pub fn ranks(&self) -> i64 {
        self.node_count * self.slots_per_node
    }

    pub fn mpijob(&self) -> MpiJob {
        let mut job = MpiJob::new(training_job_name(self.accelerator), &self.namespace, &self.image)
            .label("hardware", self.accelerator.label())
            .workers(self.node_count, self.slots_per_node)
            .worker_resource(self.accelerator.device_resource(), self.devices_per_node)
            .worker_resource(EFA_INTERFACE, self.efa_per_node)
            .launcher_command([
                "mpirun".to_string(),
                "--allow-run-as-root".to_string(),
                "-np".to_string(),
                self.ranks().to_string(),
                "-bind-to".to_string(),
                "none".to_string(),
                "-map-by".to_string(),
                "slot".to_string(),
                "-x".to_string(),
                "NODE_TYPE".to_string(),
                "python".to_string(),
                "/app/train.py".to_string(),
            ])
            .env("NODE_TYPE", &self.node_type)
            .with_timeout(TRAINING_TIMEOUT);
        if self.accelerator == Accelerator::Neuron {
            job = job.env("NEURON_RT_NUM_CORES", self.slots_per_node.to_string());
        }
        job
    }
}

/// Single-node BERT inference in throughput or latency mode
#[derive(Debug, Clone)]
pub struct BertInference {
    pub accelerator: Accelerator,
    pub namespace: String,
    pub image: String,
    pub node_type: String,
    pub mode: InferenceMode,
    pub devices: i64,
    pub neuron_cores: i64,
}

impl BertInference {
    /// Neuron inference takes every device of a node
    pub fn neuron(namespace: &str, image: &str, mode: InferenceMode, snapshot: &HardwareSnapshot) -> Self {
        Self {
            accelerator: Accelerator::Neuron,
            namespace: namespace.to_string(),
            image: image.to_string(),
            node_type: snapshot.instance_type.clone(),
            mode,
            devices: snapshot.per_node(NEURON_DEVICE),
            neuron_cores: snapshot.per_node(NEURON_CORE),
        }
    }

    /// GPU inference takes `gpus` devices on one node
    pub fn gpu(namespace: &str, image: &str, mode: InferenceMode, node_type: &str, gpus: i64) -> Self {
        Self {
            accelerator: Accelerator::Gpu,
            namespace: namespace.to_string(),
            image: image.to_string(),
            node_type: node_type.to_string(),
            mode,
            devices: gpus,
            neuron_cores: 0,
        }
    }

    pub fn job(&self) -> WorkloadJob {
        let job = WorkloadJob::new(inference_job_name(self.accelerator), &self.namespace, &self.image)
            .resource(self.accelerator.device_resource(), self.devices)
            .env("INFERENCE_MODE", self.mode)
            .env("NODE_TYPE", &self.node_type)
            .with_timeout(INFERENCE_TIMEOUT);
        match self.accelerator {
            Accelerator::Neuron => job
                .env("NEURON_PER_NODE", self.devices)
                .env("NEURON_CORE_PER_NODE", self.neuron_cores),
            Accelerator::Gpu => job.env("GPU_PER_NODE", self.devices),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::aggregate;
    use crate::workloads::Workload;
    use std::collections::BTreeMap;

    fn snapshot(resources: &[(&str, i64)]) -> HardwareSnapshot {
        let per_node: BTreeMap<String, i64> =
            resources.iter().map(|(r, c)| (r.to_string(), *c)).collect();
        HardwareSnapshot {
            instance_type: "trn1.32xlarge".to_string(),
            node_count: 2,
            nodes: Vec::new(),
            totals: per_node.iter().map(|(k, v)| (k.clone(), v * 2)).collect(),
            per_node,
        }
    }

    #[test]
    fn test_neuron_training_sizes_from_cores() {
        let snapshot = snapshot(&[(NEURON_DEVICE, 16), (NEURON_CORE, 32), (EFA_INTERFACE, 8)]);
        let training = BertTraining::new(Accelerator::Neuron, "default", "bert-train", &snapshot);
        assert_eq!(training.ranks(), 64);

        let job = training.mpijob();
        assert_eq!(job.name, "neuron-training");
        assert_eq!(job.launcher_job_name(), "neuron-training-launcher");
        assert_eq!(job.slots_per_worker, 32);
        assert_eq!(job.worker_resources.get(NEURON_DEVICE), Some(&16));
        assert_eq!(job.worker_resources.get(EFA_INTERFACE), Some(&8));
        assert_eq!(job.labels.get("hardware").map(String::as_str), Some("neuron"));
        assert!(job.env.contains(&("NODE_TYPE".to_string(), "trn1.32xlarge".to_string())));
    }

    #[test]
    fn test_gpu_training_uses_one_slot_per_gpu() {
        let snapshot = snapshot(&[(NVIDIA_GPU, 8)]);
        let job = BertTraining::new(Accelerator::Gpu, "default", "bert-train", &snapshot).mpijob();
        assert_eq!(job.name, "bert-training");
        assert_eq!(job.ranks(), 16);
        assert!(!job.worker_resources.contains_key(EFA_INTERFACE));
    }

    #[test]
    fn test_training_samples_per_family() {
        let neuron_logs = "\
[Rank 0] local_samples=50.0, training_time=10.00s, local_throughput = 5.00 samples/s
[Rank 1] local_samples=50.0, training_time=10.00s, local_throughput = 7.00 samples/s
[Rank 0] local_avg_epoch_time = 12.50s
";
        let summaries = aggregate(&training_samples(Accelerator::Neuron, neuron_logs));
        assert_eq!(summaries[THROUGHPUT].average, 6.0);
        assert_eq!(summaries[EPOCH_TIME].count, 1);
        assert_eq!(unit_of(EPOCH_TIME), "seconds");

        let gpu_logs = "Process 0 - Throughput: 120.50 samples/second\nProcess 1 - Throughput: 119.50 samples/second\n";
        let samples = training_samples(Accelerator::Gpu, gpu_logs);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].rank, Some(1));
        assert!(training_samples(Accelerator::Gpu, neuron_logs).is_empty());
    }

    #[test]
    fn test_inference_environment() {
        let snapshot = snapshot(&[(NEURON_DEVICE, 1), (NEURON_CORE, 2)]);
        let job = BertInference::neuron("default", "bert-infer", InferenceMode::Latency, &snapshot).job();
        assert_eq!(job.name(), "neuron-inference");
        let env: Vec<(&str, &str)> = job.env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        assert_eq!(
            env,
            vec![
                ("INFERENCE_MODE", "latency"),
                ("NEURON_CORE_PER_NODE", "2"),
                ("NEURON_PER_NODE", "1"),
                ("NODE_TYPE", "trn1.32xlarge"),
            ]
        );

        let gpu = BertInference::gpu("default", "bert-infer", InferenceMode::Throughput, "g5.xlarge", 1).job();
        assert_eq!(gpu.name(), "bert-inference");
        assert_eq!(gpu.env.get("GPU_PER_NODE").map(String::as_str), Some("1"));
        assert_eq!(gpu.resources.get(NVIDIA_GPU).map(String::as_str), Some("1"));
        assert_eq!(gpu.expected_duration(), INFERENCE_TIMEOUT);
    }
}
