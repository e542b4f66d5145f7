//! nccl-tests across GPU nodes and the single-node pytorch smoke job.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tracing::info;

use super::Workload;
use super::mpi_job::MpiJob;
use crate::error::{Error, Result};
use crate::inventory::HardwareSnapshot;
use crate::manifest::ManifestSet;
use crate::models::{EFA_INTERFACE, NVIDIA_GPU};

/// Instance types whose EFA devices support RDMA read
pub const RDMA_READ_INSTANCE_TYPES: &[&str] = &[
    "p5.48xlarge",
    "p4d.24xlarge",
    "p4de.24xlarge",
    "p5e.48xlarge",
    "p5en.48xlarge",
];

pub const SINGLE_NODE_JOB_NAME: &str = "pytorch-training-single-node";
pub const MULTI_NODE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// NCCL picking the libfabric transport with GPUDirect RDMA
pub static GDRDMA_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[send\] via NET/.*Libfabric/.*/GDRDMA")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

pub fn supports_rdma_read(instance_type: &str) -> bool {
    RDMA_READ_INSTANCE_TYPES.contains(&instance_type)
}

/// Largest message size and NCCL buffer size for an instance type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcclSizing {
    pub max_bytes: &'static str,
    pub buff_size: &'static str,
}

impl NcclSizing {
    pub fn for_instance(instance_type: &str) -> Self {
        if supports_rdma_read(instance_type) {
            info!("Instance supports RDMA");
            Self {
                max_bytes: "16G",
                buff_size: "8388608",
            }
        } else {
            Self {
                max_bytes: "2G",
                buff_size: "4194304",
            }
        }
    }
}

/// `multi-node-<test>` with underscores turned into dashes
pub fn job_name(test: &str) -> String {
    format!("multi-node-{test}").replace('_', "-")
}

/// Fail when an RDMA-read instance did not use GPUDirect RDMA
pub fn check_gdrdma(logs: &str, instance_type: &str) -> Result<()> {
    let clean = strip_ansi_escapes::strip_str(logs);
    if GDRDMA_PATTERN.is_match(&clean) {
        Ok(())
    } else {
        Err(Error::assertion(format!(
            "GPU Direct RDMA is not utilized for inter-node communication in NCCL tests on instances that support GDRDMA: {instance_type}"
        )))
    }
}

/// One nccl-tests binary across every GPU node
#[derive(Debug, Clone)]
pub struct NcclMultiNode {
    pub test: String,
    pub namespace: String,
    pub image: String,
    pub instance_type: String,
    pub node_count: i64,
    pub gpu_per_node: i64,
    pub efa_per_node: i64,
}

impl NcclMultiNode {
    pub fn new(test: &str, namespace: &str, image: &str, snapshot: &HardwareSnapshot) -> Self {
        Self {
            test: test.to_string(),
            namespace: namespace.to_string(),
            image: image.to_string(),
            instance_type: snapshot.instance_type.clone(),
            node_count: snapshot.node_count as i64,
            gpu_per_node: snapshot.per_node(NVIDIA_GPU),
            efa_per_node: snapshot.per_node(EFA_INTERFACE),
        }
    }

    pub fn name(&self) -> String {
        job_name(&self.test)
    }

    pub fn mpirun_command(&self) -> Vec<String> {
        let sizing = NcclSizing::for_instance(&self.instance_type);
        let ranks = self.node_count * self.gpu_per_node;
        let mut command: Vec<String> = [
            "/opt/amazon/openmpi/bin/mpirun",
            "--allow-run-as-root",
            "--tag-output",
            "-np",
        ]
        .map(String::from)
        .to_vec();
        command.push(ranks.to_string());
        command.extend(
            [
                "-bind-to",
                "none",
                "-map-by",
                "slot",
                "-x",
                "PATH",
                "-x",
                "LD_LIBRARY_PATH",
                "-x",
                "NCCL_DEBUG=INFO",
            ]
            .map(String::from),
        );
        command.push("-x".to_string());
        command.push(format!("NCCL_BUFFSIZE={}", sizing.buff_size));
        if self.efa_per_node > 0 {
            command.extend(["-x", "FI_PROVIDER=efa"].map(String::from));
            if supports_rdma_read(&self.instance_type) {
                command.extend(["-x", "FI_EFA_USE_DEVICE_RDMA=1"].map(String::from));
            }
        }
        command.extend(
            ["--mca", "pml", "^cm", "--mca", "btl", "tcp,self", "--mca", "btl_tcp_if_exclude", "lo,docker0"]
                .map(String::from),
        );
        command.push(format!("/opt/nccl-tests/build/{}", self.test));
        command.extend(["-b", "8", "-e"].map(String::from));
        command.push(sizing.max_bytes.to_string());
        command.extend(["-f", "2", "-g", "1", "-c", "1", "-n", "100"].map(String::from));
        command
    }

    pub fn mpijob(&self) -> MpiJob {
        MpiJob::new(self.name(), &self.namespace, &self.image)
            .label("suite", "nvidia")
            .label("hardware", "gpu")
            .workers(self.node_count, self.gpu_per_node)
            .worker_resource(NVIDIA_GPU, self.gpu_per_node)
            .worker_resource(EFA_INTERFACE, self.efa_per_node)
            .launcher_command(self.mpirun_command())
            .with_timeout(MULTI_NODE_TIMEOUT)
    }
}

impl Workload for NcclMultiNode {
    fn name(&self) -> &str {
        &self.test
    }

    fn description(&self) -> &str {
        "nccl-tests collective across every GPU node"
    }

    fn expected_duration(&self) -> Duration {
        MULTI_NODE_TIMEOUT
    }

    fn manifests(&self) -> Result<ManifestSet> {
        self.mpijob().manifests()
    }
}

/// One-worker MPIJob checking that pytorch sees the node's GPUs
pub fn pytorch_single_node(namespace: &str, image: &str, gpu_per_node: i64) -> MpiJob {
    MpiJob::new(SINGLE_NODE_JOB_NAME, namespace, image)
        .label("suite", "nvidia")
        .label("hardware", "gpu")
        .workers(1, gpu_per_node.max(1))
        .worker_resource(NVIDIA_GPU, gpu_per_node.max(1))
        .launcher_command([
            "mpirun",
            "--allow-run-as-root",
            "-np",
            "1",
            "python",
            "-c",
            "import torch; assert torch.cuda.is_available(); print(torch.cuda.device_count())",
        ])
        .with_timeout(MULTI_NODE_TIMEOUT)
}
