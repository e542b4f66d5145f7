//! Command-line surface and the resolved campaign configuration.
//!
//! Every flag is kebab-case with a camelCase alias (`--node-type`/`--nodeType`).
//! [`CampaignArgs`] is what clap fills in; [`CampaignConfig`] is the immutable
//! value the runtime and the suites read.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::*;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_ECHO_IMAGE: &str = "public.ecr.aws/docker/library/busybox:latest";
pub const DEFAULT_PI_IMAGE: &str = "public.ecr.aws/docker/library/perl:latest";
pub const DEFAULT_SLEEP_IMAGE: &str = "public.ecr.aws/amazonlinux/amazonlinux:2023";
pub const DEFAULT_NETPOL_SERVER_IMAGE: &str = "public.ecr.aws/nginx/nginx:stable";
pub const DEFAULT_NPM_TEST_IMAGE: &str = "public.ecr.aws/docker/library/ubuntu:noble";
pub const DEFAULT_DRA_DRIVER_IMAGE: &str =
    "registry.k8s.io/dra-example-driver/dra-example-driver:v0.1.0";
pub const DEFAULT_REBOOT_COMMAND: &str = "aws ec2 reboot-instances --instance-ids {instance_id}";
pub const DEFAULT_TERMINATE_COMMAND: &str =
    "aws ec2 terminate-instances --instance-ids {instance_id}";
pub const DEFAULT_NCCL_TESTS: &[&str] = &["all_reduce_perf", "all_gather_perf", "alltoall_perf"];

/// `k=v,k=v` pairs.
///
/// The `k:v` form many flag libraries default to is rejected so that a
/// mistyped map never silently turns into a single key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValues(pub BTreeMap<String, String>);

impl FromStr for KeyValues {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut map = BTreeMap::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(Error::config(format!(
                    "invalid map entry '{entry}': expected comma-separated key=value pairs (k=v,k=v)"
                )));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::config(format!("invalid map entry '{entry}': empty key")));
            }
            map.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self(map))
    }
}

impl std::fmt::Display for KeyValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}", pairs.join(","))
    }
}

/// Feature selection flags
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Only run features carrying all of these labels (k=v,k=v)
    #[arg(long)]
    pub labels: Option<KeyValues>,

    /// Skip features carrying any of these labels (k=v,k=v)
    #[arg(long, alias = "skipLabels")]
    pub skip_labels: Option<KeyValues>,

    /// Only run features whose name matches this regex
    #[arg(long)]
    pub feature: Option<String>,

    /// Skip features whose name matches this regex
    #[arg(long, alias = "skipFeature")]
    pub skip_feature: Option<String>,

    /// CEL expression over `name` and `labels`, e.g. `labels.hardware == "gpu"`
    #[arg(long)]
    pub filter: Option<String>,
}

/// Flags shared by `run`, `list` and `render`
#[derive(Args, Debug, Clone)]
pub struct CampaignArgs {
    /// Path to a kubeconfig file (default: inferred)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace for workloads
    #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Suites to run (repeatable; default: jobs)
    #[arg(long = "suite", value_enum)]
    pub suites: Vec<Suite>,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Instance type to test; empty adopts the type of the first node
    #[arg(long, alias = "nodeType")]
    pub node_type: Option<String>,

    /// Require EFA capacity and install the EFA device plugin
    #[arg(long, alias = "efaEnabled")]
    pub efa_enabled: bool,

    /// Install device plugin DaemonSets as prerequisites
    #[arg(long, alias = "installDevicePlugin", default_value_t = true, action = clap::ArgAction::Set)]
    pub install_device_plugin: bool,

    /// Minimum GPU count required on at least one node (inference)
    #[arg(long, alias = "gpuRequested", default_value_t = 1)]
    pub gpu_requested: i64,

    #[arg(long, alias = "inferenceMode", value_enum, default_value_t = InferenceMode::Throughput)]
    pub inference_mode: InferenceMode,

    /// Observability dimensions (k=v,k=v); enables CloudWatch agent and DCGM exporter
    #[arg(long, alias = "metricDimensions")]
    pub metric_dimensions: Option<KeyValues>,

    #[arg(long, alias = "nvidiaTestImage")]
    pub nvidia_test_image: Option<String>,

    #[arg(long, alias = "neuronTestImage")]
    pub neuron_test_image: Option<String>,

    #[arg(long, alias = "pytorchImage")]
    pub pytorch_image: Option<String>,

    #[arg(long, alias = "bertTrainingImage")]
    pub bert_training_image: Option<String>,

    #[arg(long, alias = "bertInferenceImage")]
    pub bert_inference_image: Option<String>,

    #[arg(long, alias = "pingPongImage")]
    pub ping_pong_image: Option<String>,

    #[arg(long, alias = "workloadImage")]
    pub workload_image: Option<String>,

    #[arg(long, alias = "echoImage", default_value = DEFAULT_ECHO_IMAGE)]
    pub echo_image: String,

    #[arg(long, alias = "piImage", default_value = DEFAULT_PI_IMAGE)]
    pub pi_image: String,

    #[arg(long, alias = "sleepImage", default_value = DEFAULT_SLEEP_IMAGE)]
    pub sleep_image: String,

    #[arg(long, alias = "draDriverImage", default_value = DEFAULT_DRA_DRIVER_IMAGE)]
    pub dra_driver_image: String,

    /// nginx image serving the netpol tenants; must ship curl
    #[arg(long, alias = "netpolServerImage", default_value = DEFAULT_NETPOL_SERVER_IMAGE)]
    pub netpol_server_image: String,

    /// Image with apt-get that the quick suite installs npm into
    #[arg(long, alias = "npmTestImage", default_value = DEFAULT_NPM_TEST_IMAGE)]
    pub npm_test_image: String,

    /// fi_pingpong message size in bytes
    #[arg(long, alias = "pingPongSize", default_value_t = 4096)]
    pub ping_pong_size: u64,

    /// fi_pingpong iterations
    #[arg(long, alias = "pingPongIters", default_value_t = 10000)]
    pub ping_pong_iters: u64,

    /// Upper bound on each fi_pingpong process
    #[arg(long, alias = "pingPongDeadlineSeconds", default_value_t = 120)]
    pub ping_pong_deadline_seconds: u64,

    #[arg(long, alias = "pingPongVerbose")]
    pub ping_pong_verbose: bool,

    #[arg(long, alias = "echoCompletes", default_value_t = 10)]
    pub echo_completes: i32,

    #[arg(long, alias = "echoParallels", default_value_t = 10)]
    pub echo_parallels: i32,

    /// Bytes echoed by every echo pod
    #[arg(long, alias = "echoSize", default_value_t = 100 * 1024)]
    pub echo_size: usize,

    #[arg(long, alias = "echoSchedule", default_value = "*/10 * * * *")]
    pub echo_schedule: String,

    #[arg(long, alias = "echoSuccessfulHistory", default_value_t = 3)]
    pub echo_successful_history: i32,

    #[arg(long, alias = "echoFailedHistory", default_value_t = 1)]
    pub echo_failed_history: i32,

    #[arg(long, alias = "piCompletes", default_value_t = 30)]
    pub pi_completes: i32,

    #[arg(long, alias = "piParallels", default_value_t = 10)]
    pub pi_parallels: i32,

    /// NCCL tests run by the nvidia suite (repeatable)
    #[arg(long = "nccl-test", alias = "ncclTest")]
    pub nccl_tests: Vec<String>,

    #[arg(long, alias = "workloadName", default_value = "workload")]
    pub workload_name: String,

    /// Overrides the workload image's entrypoint (split on whitespace)
    #[arg(long, alias = "workloadCommand")]
    pub workload_command: Option<String>,

    /// Resources as JSON, e.g. '{"nvidia.com/gpu": "1"}'; zero quantities are dropped
    #[arg(long, alias = "workloadResources")]
    pub workload_resources: Option<String>,

    #[arg(long, alias = "workloadTimeoutSeconds", default_value_t = 1800)]
    pub workload_timeout_seconds: u64,

    /// Command that reboots an instance; `{instance_id}` is substituted
    #[arg(long, alias = "rebootCommand", default_value = DEFAULT_REBOOT_COMMAND)]
    pub reboot_command: String,

    /// Command that terminates an instance; `{instance_id}` is substituted
    #[arg(long, alias = "terminateCommand", default_value = DEFAULT_TERMINATE_COMMAND)]
    pub terminate_command: String,

    /// Directory whose <bundle>/ subdirectories override embedded manifests
    #[arg(long, alias = "templateDir")]
    pub template_dir: Option<PathBuf>,

    /// Keep cluster resources after each feature
    #[arg(long, alias = "noCleanup")]
    pub no_cleanup: bool,
}

impl Default for CampaignArgs {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            suites: Vec::new(),
            selection: SelectionArgs::default(),
            node_type: None,
            efa_enabled: false,
            install_device_plugin: true,
            gpu_requested: 1,
            inference_mode: InferenceMode::Throughput,
            metric_dimensions: None,
            nvidia_test_image: None,
            neuron_test_image: None,
            pytorch_image: None,
            bert_training_image: None,
            bert_inference_image: None,
            ping_pong_image: None,
            workload_image: None,
            echo_image: DEFAULT_ECHO_IMAGE.to_string(),
            pi_image: DEFAULT_PI_IMAGE.to_string(),
            sleep_image: DEFAULT_SLEEP_IMAGE.to_string(),
            dra_driver_image: DEFAULT_DRA_DRIVER_IMAGE.to_string(),
            netpol_server_image: DEFAULT_NETPOL_SERVER_IMAGE.to_string(),
            npm_test_image: DEFAULT_NPM_TEST_IMAGE.to_string(),
            ping_pong_size: 4096,
            ping_pong_iters: 10000,
            ping_pong_deadline_seconds: 120,
            ping_pong_verbose: false,
            echo_completes: 10,
            echo_parallels: 10,
            echo_size: 100 * 1024,
            echo_schedule: "*/10 * * * *".to_string(),
            echo_successful_history: 3,
            echo_failed_history: 1,
            pi_completes: 30,
            pi_parallels: 10,
            nccl_tests: Vec::new(),
            workload_name: "workload".to_string(),
            workload_command: None,
            workload_resources: None,
            workload_timeout_seconds: 1800,
            reboot_command: DEFAULT_REBOOT_COMMAND.to_string(),
            terminate_command: DEFAULT_TERMINATE_COMMAND.to_string(),
            template_dir: None,
            no_cleanup: false,
        }
    }
}

/// Container images per workload family
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Images {
    pub nvidia_test: Option<String>,
    pub neuron_test: Option<String>,
    pub pytorch: Option<String>,
    pub bert_training: Option<String>,
    pub bert_inference: Option<String>,
    pub ping_pong: Option<String>,
    pub workload: Option<String>,
    pub echo: String,
    pub pi: String,
    pub sleep: String,
    pub dra_driver: String,
    pub netpol_server: String,
    pub npm_test: String,
}

/// Resolve an optional image, naming the flag that sets it when absent
pub fn require_image(image: &Option<String>, flag: &str) -> Result<String> {
    image
        .clone()
        .filter(|i| !i.is_empty())
        .ok_or_else(|| Error::config(format!("{flag} must be set to run this test")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPongConfig {
    pub size: u64,
    pub iters: u64,
    pub deadline_seconds: u64,
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    pub completes: i32,
    pub parallels: i32,
    pub size: usize,
    pub schedule: String,
    pub successful_history: i32,
    pub failed_history: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiConfig {
    pub completes: i32,
    pub parallels: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    pub command: Vec<String>,
    pub resources: BTreeMap<String, String>,
    pub timeout: Duration,
}

/// Feature selection as resolved from flags
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionConfig {
    pub labels: BTreeMap<String, String>,
    pub skip_labels: BTreeMap<String, String>,
    pub feature: Option<String>,
    pub skip_feature: Option<String>,
    pub filter: Option<String>,
}

/// Everything the campaign runtime and the suites read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub namespace: String,
    pub suites: Vec<Suite>,
    pub selection: SelectionConfig,
    pub node_type: Option<String>,
    pub efa: EfaMode,
    pub device_plugin: DevicePluginMode,
    pub gpu_requested: i64,
    pub inference_mode: InferenceMode,
    pub metric_dimensions: BTreeMap<String, String>,
    pub images: Images,
    pub ping_pong: PingPongConfig,
    pub echo: EchoConfig,
    pub pi: PiConfig,
    pub nccl_tests: Vec<String>,
    pub workload: WorkloadConfig,
    pub reboot_command: String,
    pub terminate_command: String,
    pub template_dir: Option<PathBuf>,
    pub cleanup: CleanupMode,
    pub execution: ExecutionMode,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        // defaults of the flag surface are the single source of truth
        CampaignArgs::default()
            .into_config(ExecutionMode::Execute)
            .unwrap_or_else(|_| unreachable!("default arguments always resolve"))
    }
}

impl CampaignArgs {
    /// Validate flags and resolve them into a [`CampaignConfig`]
    pub fn into_config(self, execution: ExecutionMode) -> Result<CampaignConfig> {
        if self.namespace.trim().is_empty() {
            return Err(Error::config("--namespace must not be empty"));
        }
        if self.gpu_requested < 0 {
            return Err(Error::config("--gpu-requested must not be negative"));
        }
        if self.echo_completes < 1 || self.echo_parallels < 1 {
            return Err(Error::config(
                "--echo-completes and --echo-parallels must be at least 1",
            ));
        }
        if self.pi_completes < 1 || self.pi_parallels < 1 {
            return Err(Error::config(
                "--pi-completes and --pi-parallels must be at least 1",
            ));
        }
        if self.ping_pong_deadline_seconds == 0 {
            return Err(Error::config("--ping-pong-deadline-seconds must be positive"));
        }
        for (flag, command) in [
            ("--reboot-command", &self.reboot_command),
            ("--terminate-command", &self.terminate_command),
        ] {
            if !command.contains("{instance_id}") {
                return Err(Error::config(format!(
                    "{flag} must contain the {{instance_id}} placeholder"
                )));
            }
        }

        let suites = if self.suites.is_empty() {
            vec![Suite::Jobs]
        } else {
            let mut suites = Vec::new();
            for suite in self.suites {
                if !suites.contains(&suite) {
                    suites.push(suite);
                }
            }
            suites
        };

        let nccl_tests = if self.nccl_tests.is_empty() {
            DEFAULT_NCCL_TESTS.iter().map(|t| t.to_string()).collect()
        } else {
            self.nccl_tests
        };

        let resources = match self.workload_resources.as_deref() {
            Some(json) if !json.trim().is_empty() => parse_resources(json)?,
            _ => BTreeMap::new(),
        };

        Ok(CampaignConfig {
            namespace: self.namespace,
            suites,
            selection: SelectionConfig {
                labels: self.selection.labels.unwrap_or_default().0,
                skip_labels: self.selection.skip_labels.unwrap_or_default().0,
                feature: self.selection.feature,
                skip_feature: self.selection.skip_feature,
                filter: self.selection.filter,
            },
            node_type: self.node_type.filter(|t| !t.is_empty()),
            efa: self.efa_enabled.into(),
            device_plugin: self.install_device_plugin.into(),
            gpu_requested: self.gpu_requested,
            inference_mode: self.inference_mode,
            metric_dimensions: self.metric_dimensions.unwrap_or_default().0,
            images: Images {
                nvidia_test: self.nvidia_test_image,
                neuron_test: self.neuron_test_image,
                pytorch: self.pytorch_image,
                bert_training: self.bert_training_image,
                bert_inference: self.bert_inference_image,
                ping_pong: self.ping_pong_image,
                workload: self.workload_image,
                echo: self.echo_image,
                pi: self.pi_image,
                sleep: self.sleep_image,
                dra_driver: self.dra_driver_image,
                netpol_server: self.netpol_server_image,
                npm_test: self.npm_test_image,
            },
            ping_pong: PingPongConfig {
                size: self.ping_pong_size,
                iters: self.ping_pong_iters,
                deadline_seconds: self.ping_pong_deadline_seconds,
                verbose: self.ping_pong_verbose,
            },
            echo: EchoConfig {
                completes: self.echo_completes,
                parallels: self.echo_parallels,
                size: self.echo_size,
                schedule: self.echo_schedule,
                successful_history: self.echo_successful_history,
                failed_history: self.echo_failed_history,
            },
            pi: PiConfig {
                completes: self.pi_completes,
                parallels: self.pi_parallels,
            },
            nccl_tests,
            workload: WorkloadConfig {
                name: self.workload_name,
                command: self
                    .workload_command
                    .map(|c| c.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
                resources,
                timeout: Duration::from_secs(self.workload_timeout_seconds),
            },
            reboot_command: self.reboot_command,
            terminate_command: self.terminate_command,
            template_dir: self.template_dir,
            cleanup: if self.no_cleanup {
                CleanupMode::NoCleanup
            } else {
                CleanupMode::Cleanup
            },
            execution,
        })
    }
}

/// Parse `{"resource": "quantity"}`, dropping zero quantities
pub fn parse_resources(json: &str) -> Result<BTreeMap<String, String>> {
    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| Error::config(format!("invalid --workload-resources: {e}")))?;
    let mut resources = BTreeMap::new();
    for (name, value) in raw {
        let quantity = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(Error::config(format!(
                    "invalid quantity for {name}: {other}"
                )));
            }
        };
        if quantity_is_zero(&quantity) {
            tracing::debug!("Dropping zero quantity for {}", name);
            continue;
        }
        resources.insert(name, quantity);
    }
    Ok(resources)
}

fn quantity_is_zero(quantity: &str) -> bool {
    let digits: String = quantity
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse::<f64>().map(|v| v == 0.0).unwrap_or(true)
}

impl CampaignConfig {
    /// Instance type preselected on the command line
    pub fn node_type(&self) -> Option<&str> {
        self.node_type.as_deref()
    }

    pub fn observability_enabled(&self) -> bool {
        !self.metric_dimensions.is_empty()
    }
}
