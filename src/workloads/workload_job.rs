use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Workload, app_labels, guaranteed, manifest_of};
use crate::config::WorkloadConfig;
use crate::error::Result;
use crate::manifest::ManifestSet;
use crate::models::{Accelerator, NEURON_DEVICE, NVIDIA_GPU};

pub const BACKOFF_LIMIT: i32 = 4;

/// Accelerator a resource request asks for; GPU wins when both appear
pub fn accelerator_of(resources: &BTreeMap<String, String>) -> Option<Accelerator> {
    if resources.contains_key(NVIDIA_GPU) {
        Some(Accelerator::Gpu)
    } else if resources.contains_key(NEURON_DEVICE) {
        Some(Accelerator::Neuron)
    } else {
        None
    }
}

/// Single-container Job with Guaranteed resources and a hard deadline
#[derive(Debug, Clone)]
pub struct WorkloadJob {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub resources: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub pull_policy: String,
}

impl WorkloadJob {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            command: Vec::new(),
            resources: BTreeMap::new(),
            env: BTreeMap::new(),
            timeout: Duration::from_secs(30 * 60),
            pull_policy: "Always".to_string(),
        }
    }

    /// The user-defined job of the `workload` suite
    pub fn from_config(namespace: &str, image: &str, config: &WorkloadConfig) -> Self {
        Self {
            command: config.command.clone(),
            resources: config.resources.clone(),
            timeout: config.timeout,
            ..Self::new(&config.name, namespace, image)
        }
    }

    pub fn command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Request `count` of `resource`; zero counts are left out
    pub fn resource(mut self, resource: impl Into<String>, count: i64) -> Self {
        if count > 0 {
            self.resources.insert(resource.into(), count.to_string());
        }
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.env.insert(name.into(), value.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pull_policy(mut self, policy: impl Into<String>) -> Self {
        self.pull_policy = policy.into();
        self
    }

    pub fn accelerator(&self) -> Option<Accelerator> {
        accelerator_of(&self.resources)
    }

    pub fn build(&self) -> Job {
        let labels = app_labels(&self.name);
        let env: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();
        Job {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(BACKOFF_LIMIT),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        active_deadline_seconds: Some(self.timeout.as_secs() as i64),
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            image_pull_policy: Some(self.pull_policy.clone()),
                            command: (!self.command.is_empty()).then(|| self.command.clone()),
                            env: (!env.is_empty()).then_some(env),
                            resources: (!self.resources.is_empty())
                                .then(|| guaranteed(self.resources.clone())),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for WorkloadJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Job running a single container to completion"
    }

    fn expected_duration(&self) -> Duration {
        self.timeout
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(&self.name, &[self.build()])
    }
}
