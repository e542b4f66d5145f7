//! MPIJobs of the kubeflow MPI operator, built as schemaless documents.

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Workload, guaranteed, manifest_of};
use crate::client::ObjectHandle;
use crate::conditions::{StatusCondition, custom_resource_status_has};
use crate::error::Result;
use crate::logs::{MPI_JOB_NAME_LABEL, MPI_JOB_ROLE_LABEL};
use crate::manifest::ManifestSet;

pub const API_VERSION: &str = "kubeflow.org/v2beta1";
pub const KIND: &str = "MPIJob";

const SHM_VOLUME: &str = "dshm";

/// Done once the operator reports `Succeeded=True`; `Failed=True` is terminal
pub fn mpijob_succeeded() -> StatusCondition {
    custom_resource_status_has("Succeeded", "True").failing_on("Failed")
}

/// Launcher plus `worker_replicas` workers, each offering `slots_per_worker` slots
#[derive(Debug, Clone)]
pub struct MpiJob {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub launcher_command: Vec<String>,
    pub worker_command: Vec<String>,
    pub worker_replicas: i64,
    pub slots_per_worker: i64,
    /// Per-worker device limits; requests are set equal
    pub worker_resources: BTreeMap<String, i64>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl MpiJob {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            labels: BTreeMap::new(),
            launcher_command: Vec::new(),
            worker_command: Vec::new(),
            worker_replicas: 1,
            slots_per_worker: 1,
            worker_resources: BTreeMap::new(),
            env: Vec::new(),
            timeout: Duration::from_secs(20 * 60),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn launcher_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.launcher_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn worker_command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.worker_command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn workers(mut self, replicas: i64, slots_per_worker: i64) -> Self {
        self.worker_replicas = replicas;
        self.slots_per_worker = slots_per_worker;
        self
    }

    /// Per-worker limit of `resource`; zero counts are left out
    pub fn worker_resource(mut self, resource: impl Into<String>, count: i64) -> Self {
        if count > 0 {
            self.worker_resources.insert(resource.into(), count);
        }
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total MPI ranks across all workers
    pub fn ranks(&self) -> i64 {
        self.worker_replicas * self.slots_per_worker
    }

    pub fn handle(&self) -> ObjectHandle {
        ObjectHandle::new(API_VERSION, KIND, Some(&self.namespace), &self.name)
    }

    /// Name of the batch Job the operator creates for the launcher
    pub fn launcher_job_name(&self) -> String {
        format!("{}-launcher", self.name)
    }

    pub fn launcher_selector(&self) -> String {
        format!("{MPI_JOB_NAME_LABEL}={},{MPI_JOB_ROLE_LABEL}=launcher", self.name)
    }

    fn env_vars(&self) -> Option<Vec<EnvVar>> {
        (!self.env.is_empty()).then(|| {
            self.env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect()
        })
    }

    fn launcher_template(&self) -> PodTemplateSpec {
        PodTemplateSpec {
            spec: Some(PodSpec {
                restart_policy: Some("OnFailure".to_string()),
                containers: vec![Container {
                    name: format!("{}-launcher", self.name),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: (!self.launcher_command.is_empty())
                        .then(|| self.launcher_command.clone()),
                    env: self.env_vars(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn worker_template(&self) -> PodTemplateSpec {
        let resources = (!self.worker_resources.is_empty()).then(|| {
            guaranteed(
                self.worker_resources
                    .iter()
                    .map(|(resource, count)| (resource.clone(), count.to_string())),
            )
        });
        PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: format!("{}-worker", self.name),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    command: (!self.worker_command.is_empty()).then(|| self.worker_command.clone()),
                    env: self.env_vars(),
                    resources,
                    volume_mounts: Some(vec![VolumeMount {
                        name: SHM_VOLUME.to_string(),
                        mount_path: "/dev/shm".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: SHM_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource {
                        medium: Some("Memory".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn build(&self) -> Result<Value> {
        let mut metadata = json!({
            "name": self.name,
            "namespace": self.namespace,
        });
        if !self.labels.is_empty() {
            metadata["labels"] = serde_json::to_value(&self.labels)?;
        }
        Ok(json!({
            "apiVersion": API_VERSION,
            "kind": KIND,
            "metadata": metadata,
            "spec": {
                "slotsPerWorker": self.slots_per_worker,
                "runPolicy": {
                    "cleanPodPolicy": "Running",
                },
                "mpiImplementation": "OpenMPI",
                "mpiReplicaSpecs": {
                    "Launcher": {
                        "replicas": 1,
                        "template": serde_json::to_value(self.launcher_template())?,
                    },
                    "Worker": {
                        "replicas": self.worker_replicas,
                        "template": serde_json::to_value(self.worker_template())?,
                    },
                },
            },
        }))
    }
}

impl Workload for MpiJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "MPIJob run by the kubeflow MPI operator"
    }

    fn expected_duration(&self) -> Duration {
        self.timeout
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(&self.name, &[self.build()?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{Predicate, Verdict};
    use crate::schemaless::FieldPath;

    fn job() -> MpiJob {
        MpiJob::new("multi-node-all-reduce-perf", "default", "nccl-tests:latest")
            .label("suite", "nvidia")
            .workers(2, 8)
            .worker_resource("nvidia.com/gpu", 8)
            .worker_resource("vpc.amazonaws.com/efa", 0)
            .launcher_command(["mpirun", "all_reduce_perf"])
            .env("NCCL_DEBUG", "INFO")
    }

    #[test]
    fn test_document_shape() {
        let body = job().build().unwrap();
        assert_eq!(body.field_str("apiVersion"), Some(API_VERSION));
        assert_eq!(body.field_i64("spec.slotsPerWorker"), Some(8));
        assert_eq!(body.field_i64("spec.mpiReplicaSpecs.Worker.replicas"), Some(2));
        assert_eq!(body.field_str("spec.runPolicy.cleanPodPolicy"), Some("Running"));
        assert_eq!(body.field_str("metadata.labels.suite"), Some("nvidia"));

        let worker = &body
            .field_array("spec.mpiReplicaSpecs.Worker.template.spec.containers")
            .unwrap()[0];
        let limits = worker.field("resources.limits").unwrap();
        assert_eq!(limits.get("nvidia.com/gpu").and_then(Value::as_str), Some("8"));
        assert!(limits.get("vpc.amazonaws.com/efa").is_none());
        assert_eq!(worker.field("resources.requests"), Some(limits));

        let volumes = body
            .field_array("spec.mpiReplicaSpecs.Worker.template.spec.volumes")
            .unwrap();
        assert_eq!(volumes[0].field_str("emptyDir.medium"), Some("Memory"));

        let launcher = &body
            .field_array("spec.mpiReplicaSpecs.Launcher.template.spec.containers")
            .unwrap()[0];
        assert_eq!(launcher.field_str("name"), Some("multi-node-all-reduce-perf-launcher"));
        assert!(launcher.field("resources").is_none());
    }

    #[test]
    fn test_names_and_selectors() {
        let job = job();
        assert_eq!(job.ranks(), 16);
        assert_eq!(job.handle().to_string(), "MPIJob default/multi-node-all-reduce-perf");
        assert_eq!(job.launcher_job_name(), "multi-node-all-reduce-perf-launcher");
        assert_eq!(
            job.launcher_selector(),
            "training.kubeflow.org/job-name=multi-node-all-reduce-perf,training.kubeflow.org/job-role=launcher"
        );
    }

    #[test]
    fn test_success_condition() {
        let mut body = job().build().unwrap();
        let predicate = mpijob_succeeded();
        assert!(matches!(predicate.check(&body).unwrap(), Verdict::NotYet(_)));

        body["status"] = json!({"conditions": [
            {"type": "Created", "status": "True"},
            {"type": "Succeeded", "status": "True"},
        ]});
        assert_eq!(predicate.check(&body).unwrap(), Verdict::Met);

        body["status"] = json!({"conditions": [
            {"type": "Failed", "status": "True", "message": "launcher failed"},
        ]});
        let err = predicate.check(&body).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ClusterTerminal);
    }
}
