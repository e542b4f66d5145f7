use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupMode {
    Cleanup,
    NoCleanup,
}

impl CleanupMode {
    pub fn should_cleanup(&self) -> bool {
        matches!(self, Self::Cleanup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    DryRun,
    Execute,
}

impl ExecutionMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EfaMode {
    Enabled,
    Disabled,
}

impl EfaMode {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<bool> for EfaMode {
    fn from(value: bool) -> Self {
        if value { Self::Enabled } else { Self::Disabled }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePluginMode {
    Install,
    AssumeInstalled,
}

impl DevicePluginMode {
    pub fn should_install(&self) -> bool {
        matches!(self, Self::Install)
    }
}

impl From<bool> for DevicePluginMode {
    fn from(value: bool) -> Self {
        if value {
            Self::Install
        } else {
            Self::AssumeInstalled
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
    Throughput,
    Latency,
}

/// Accelerator family a workload runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Gpu,
    Neuron,
}

impl Accelerator {
    /// Extended resource that counts whole devices
    pub fn device_resource(&self) -> &'static str {
        match self {
            Accelerator::Gpu => NVIDIA_GPU,
            Accelerator::Neuron => NEURON_DEVICE,
        }
    }

    /// Value of the `hardware` feature label
    pub fn label(&self) -> &'static str {
        match self {
            Accelerator::Gpu => "gpu",
            Accelerator::Neuron => "neuron",
        }
    }
}

/// Named group of features with shared prerequisites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Suite {
    Jobs,
    Disruptive,
    Efa,
    Dra,
    Neuron,
    Nvidia,
    Workload,
    Netpol,
    Quick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Table,
    Json,
    Yaml,
}

// well-known node labels and extended resources
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
pub const NVIDIA_GPU: &str = "nvidia.com/gpu";
pub const NEURON_DEVICE: &str = "aws.amazon.com/neuron";
pub const NEURON_CORE: &str = "aws.amazon.com/neuroncore";
pub const EFA_INTERFACE: &str = "vpc.amazonaws.com/efa";

impl std::fmt::Display for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suite::Jobs => write!(f, "jobs"),
            Suite::Disruptive => write!(f, "disruptive"),
            Suite::Efa => write!(f, "efa"),
            Suite::Dra => write!(f, "dra"),
            Suite::Neuron => write!(f, "neuron"),
            Suite::Nvidia => write!(f, "nvidia"),
            Suite::Workload => write!(f, "workload"),
            Suite::Netpol => write!(f, "netpol"),
            Suite::Quick => write!(f, "quick"),
        }
    }
}

impl std::fmt::Display for InferenceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceMode::Throughput => write!(f, "throughput"),
            InferenceMode::Latency => write!(f, "latency"),
        }
    }
}
