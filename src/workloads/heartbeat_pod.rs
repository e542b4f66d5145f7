use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

use super::{Workload, app_labels, guaranteed, manifest_of, timestamped};
use crate::error::Result;
use crate::manifest::ManifestSet;

pub const PREFIX: &str = "graceful-shutdown-test";
pub const CONTAINER_NAME: &str = "heartbeat";
/// Long enough for the kubelet's shutdown grace period to be the limit
pub const GRACE_PERIOD_SECONDS: i64 = 150;

pub const STARTED_MARKER: &str = "POD-STARTED";
pub const HEARTBEAT_MARKER: &str = "NORMAL-HEARTBEAT";
pub const SIGTERM_MARKER: &str = "SIGTERM-RECEIVED";
pub const AFTER_SIGTERM_MARKER: &str = "HEARTBEAT-AFTER-SIGTERM";

// `sleep & wait` keeps the shell interruptible so the trap fires at once
const SCRIPT: &str = r#"echo "POD-STARTED $(date +%s)"
trap 'echo "SIGTERM-RECEIVED $(date +%s)"; while true; do echo "HEARTBEAT-AFTER-SIGTERM $(date +%s)"; sleep 1; done' TERM
while true; do
  echo "NORMAL-HEARTBEAT $(date +%s)"
  sleep 10 &
  wait $!
done
"#;

/// Pod that keeps logging once a second after SIGTERM, until it is killed
#[derive(Debug, Clone)]
pub struct HeartbeatPod {
    pub name: String,
    pub namespace: String,
    pub image: String,
}

impl HeartbeatPod {
    /// `graceful-shutdown-test-<unix>`
    pub fn new(namespace: &str, image: &str) -> Self {
        Self {
            name: timestamped(PREFIX),
            namespace: namespace.to_string(),
            image: image.to_string(),
        }
    }

    pub fn build(&self) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(PREFIX)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                restart_policy: Some("Never".to_string()),
                termination_grace_period_seconds: Some(GRACE_PERIOD_SECONDS),
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["/bin/bash".to_string(), "-c".to_string()]),
                    args: Some(vec![SCRIPT.to_string()]),
                    resources: Some(guaranteed([("cpu", "100m"), ("memory", "64Mi")])),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Lines carrying `marker`
pub fn count_marker(logs: &str, marker: &str) -> usize {
    logs.lines().filter(|line| line.contains(marker)).count()
}

impl Workload for HeartbeatPod {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Pod logging heartbeats through its termination grace period"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_secs(2 * 60)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(&self.name, &[self.build()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_pod_outlives_shutdown() {
        let pod = HeartbeatPod::new("default", "amazonlinux:2023");
        assert!(pod.name.starts_with("graceful-shutdown-test-"));
        let spec = pod.build().spec.unwrap();
        assert_eq!(spec.termination_grace_period_seconds, Some(150));
        let container = &spec.containers[0];
        let script = &container.args.as_ref().unwrap()[0];
        for marker in [STARTED_MARKER, HEARTBEAT_MARKER, SIGTERM_MARKER, AFTER_SIGTERM_MARKER] {
            assert!(script.contains(marker), "script never logs {marker}");
        }
        assert!(script.contains("TERM"));
    }

    #[test]
    fn test_count_marker() {
        let logs = "\
POD-STARTED 1700000000
NORMAL-HEARTBEAT 1700000000
SIGTERM-RECEIVED 1700000007
HEARTBEAT-AFTER-SIGTERM 1700000007
HEARTBEAT-AFTER-SIGTERM 1700000008
";
        assert_eq!(count_marker(logs, AFTER_SIGTERM_MARKER), 2);
        assert_eq!(count_marker(logs, SIGTERM_MARKER), 1);
        assert_eq!(count_marker(logs, "NPM"), 0);
    }
}
