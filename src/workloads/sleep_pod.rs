use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Workload, app_labels, guaranteed, manifest_of, timestamped};
use crate::error::Result;
use crate::manifest::ManifestSet;
use crate::models::HOSTNAME_LABEL;

pub const CANARY_PREFIX: &str = "termination-canary";
pub const BOOT_PREFIX: &str = "boot-detection";
pub const CONTAINER_NAME: &str = "sleep";

/// Pod that sleeps forever with Guaranteed QoS.
///
/// `node_name` bypasses the scheduler, `hostname` pins through the
/// `kubernetes.io/hostname` node selector instead.
#[derive(Debug, Clone)]
pub struct SleepPod {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub node_name: Option<String>,
    pub hostname: Option<String>,
    pub termination_grace_period: Option<i64>,
}

impl SleepPod {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: image.into(),
            node_name: None,
            hostname: None,
            termination_grace_period: None,
        }
    }

    /// `termination-canary-<unix>`, left to the scheduler
    pub fn termination_canary(namespace: &str, image: &str) -> Self {
        Self::new(timestamped(CANARY_PREFIX), namespace, image)
    }

    /// `boot-detection-<unix>`, bound directly to `node`
    pub fn boot_detection(namespace: &str, image: &str, node: &str) -> Self {
        Self::new(timestamped(BOOT_PREFIX), namespace, image).on_node(node)
    }

    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }

    pub fn on_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_grace_period(mut self, seconds: i64) -> Self {
        self.termination_grace_period = Some(seconds);
        self
    }

    pub fn build(&self) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(&self.name)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: self.node_name.clone(),
                node_selector: self
                    .hostname
                    .as_ref()
                    .map(|h| BTreeMap::from([(HOSTNAME_LABEL.to_string(), h.clone())])),
                restart_policy: Some("Never".to_string()),
                termination_grace_period_seconds: self.termination_grace_period,
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    resources: Some(guaranteed([("cpu", "250m"), ("memory", "64Mi")])),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for SleepPod {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Pod sleeping forever with Guaranteed QoS"
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
    use insta::assert_snapshot;

    #[test]
    fn test_sleep_pod_is_guaranteed_and_pinned() {
        let pod = SleepPod::new("canary", "default", "amazonlinux:2023")
            .on_hostname("ip-10-0-0-1")
            .with_grace_period(30);
        assert_snapshot!(pod.manifests().unwrap().rendered, @r"
        apiVersion: v1
        kind: Pod
        metadata:
          labels:
            app: canary
          name: canary
          namespace: default
        spec:
          containers:
          - command:
            - sleep
            - infinity
            image: amazonlinux:2023
            name: sleep
            resources:
              limits:
                cpu: 250m
                memory: 64Mi
              requests:
                cpu: 250m
                memory: 64Mi
          nodeSelector:
            kubernetes.io/hostname: ip-10-0-0-1
          restartPolicy: Never
          terminationGracePeriodSeconds: 30
        ");
    }

    #[test]
    fn test_boot_detection_binds_node() {
        let pod = SleepPod::boot_detection("default", "amazonlinux:2023", "ip-10-0-0-2");
        assert!(pod.name.starts_with("boot-detection-"));
        let spec = pod.build().spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("ip-10-0-0-2"));
        assert!(spec.node_selector.is_none());
    }
}
