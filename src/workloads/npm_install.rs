use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

use super::{Workload, app_labels, guaranteed, manifest_of};
use crate::error::Result;
use crate::manifest::ManifestSet;

pub const POD_NAME: &str = "npm-install-test";
pub const CONTAINER_NAME: &str = "npm";
pub const CPU_LIMIT: &str = "500m";
pub const MEMORY_LIMIT: &str = "1Gi";

// karma pulls in enough packages to stress io_uring under a CPU quota
const INSTALL_SCRIPT: &str = "mkdir -p /work && cd /work \
    && apt-get update \
    && DEBIAN_FRONTEND=noninteractive apt-get install -y npm nodejs \
    && npm install karma@~6.4.0 --loglevel verbose";

/// CPU-limited pod that idles until the install is exec'd into it
#[derive(Debug, Clone)]
pub struct NpmInstallPod {
    pub namespace: String,
    pub image: String,
}

impl NpmInstallPod {
    pub fn new(namespace: &str, image: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            image: image.to_string(),
        }
    }

    pub fn build(&self) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(POD_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(POD_NAME)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["sleep".to_string(), "infinity".to_string()]),
                    resources: Some(guaranteed([("cpu", CPU_LIMIT), ("memory", MEMORY_LIMIT)])),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn install_command() -> Vec<String> {
        vec!["bash".to_string(), "-c".to_string(), INSTALL_SCRIPT.to_string()]
    }
}

impl Workload for NpmInstallPod {
    fn name(&self) -> &str {
        POD_NAME
    }

    fn description(&self) -> &str {
        "npm install under a half-CPU limit"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_secs(15 * 60)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(POD_NAME, &[self.build()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_npm_pod_is_cpu_limited() {
        let pod = NpmInstallPod::new("default", "ubuntu:noble");
        assert_snapshot!(pod.manifests().unwrap().rendered, @r"
        apiVersion: v1
        kind: Pod
        metadata:
          labels:
            app: npm-install-test
          name: npm-install-test
          namespace: default
        spec:
          containers:
          - command:
            - sleep
            - infinity
            image: ubuntu:noble
            name: npm
            resources:
              limits:
                cpu: 500m
                memory: 1Gi
              requests:
                cpu: 500m
                memory: 1Gi
          restartPolicy: Never
        ");
    }

    #[test]
    fn test_install_command_runs_in_bash() {
        let command = NpmInstallPod::install_command();
        assert_eq!(&command[..2], &["bash", "-c"]);
        assert!(command[2].contains("npm install karma@~6.4.0"));
    }
}
