use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Workload, guaranteed, hostname_affinity, manifest_of};
use crate::error::Result;
use crate::manifest::ManifestSet;

/// Pod requesting whole devices through extended resources
/// (`nvidia.com/gpu=1`, `aws.amazon.com/neuroncore=2`, ...)
#[derive(Debug, Clone)]
pub struct DeviceRequestPod {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub container: String,
    pub devices: BTreeMap<String, i64>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub node: Option<String>,
    pub restart_policy: String,
}

impl DeviceRequestPod {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            container: name.clone(),
            name,
            namespace: namespace.into(),
            image: image.into(),
            devices: BTreeMap::new(),
            command: Vec::new(),
            args: Vec::new(),
            labels: BTreeMap::new(),
            node: None,
            restart_policy: "Never".to_string(),
        }
    }

    /// Request `count` of `resource`; zero counts are left out
    pub fn device(mut self, resource: impl Into<String>, count: i64) -> Self {
        if count > 0 {
            self.devices.insert(resource.into(), count);
        }
        self
    }

    pub fn container(mut self, name: impl Into<String>) -> Self {
        self.container = name.into();
        self
    }

    pub fn command<S: Into<String>>(mut self, command: impl IntoIterator<Item = S>) -> Self {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Require scheduling onto `node` through hostname affinity
    pub fn pinned_to(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn restart_policy(mut self, policy: impl Into<String>) -> Self {
        self.restart_policy = policy.into();
        self
    }

    pub fn build(&self) -> Pod {
        let resources = (!self.devices.is_empty()).then(|| {
            guaranteed(
                self.devices
                    .iter()
                    .map(|(resource, count)| (resource.clone(), count.to_string())),
            )
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                affinity: self.node.as_deref().map(hostname_affinity),
                restart_policy: Some(self.restart_policy.clone()),
                containers: vec![Container {
                    name: self.container.clone(),
                    image: Some(self.image.clone()),
                    command: (!self.command.is_empty()).then(|| self.command.clone()),
                    args: (!self.args.is_empty()).then(|| self.args.clone()),
                    resources,
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for DeviceRequestPod {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Pod requesting accelerator devices"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(&self.name, &[self.build()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    #[test]
    fn test_devices_become_requests_and_limits() {
        let pod = DeviceRequestPod::new("gpu-smoke", "default", "cuda")
            .device("nvidia.com/gpu", 1)
            .device("vpc.amazonaws.com/efa", 0)
            .command(["nvidia-smi"])
            .build();
        let container = &pod.spec.as_ref().unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits["nvidia.com/gpu"], Quantity("1".to_string()));
        assert_eq!(resources.requests, resources.limits);
        assert_eq!(container.command.as_deref(), Some(&["nvidia-smi".to_string()][..]));
        assert!(container.args.is_none());
    }

    #[test]
    fn test_no_devices_means_no_resources() {
        let pod = DeviceRequestPod::new("plain", "default", "busybox").build();
        let spec = pod.spec.unwrap();
        assert!(spec.containers[0].resources.is_none());
        assert!(spec.affinity.is_none());
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
    }
}
