use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;
use tracing::info;

use super::{Workload, manifest_of, random_string};
use crate::config::EchoConfig;
use crate::error::Result;
use crate::manifest::ManifestSet;

pub const CRONJOB_NAME: &str = "cronjob-echo";
pub const JOB_NAME: &str = "job-echo";

const VOLUME_NAME: &str = "config";
const MOUNT_PATH: &str = "/config";
const MAX_DURATION: Duration = Duration::from_secs(3 * 60 * 60);
const PER_COMPLETION: Duration = Duration::from_secs(5 * 60);
const CRON_SLACK: Duration = Duration::from_secs(10 * 60);

/// Shell command appending `payload` to a file on the shared volume
fn echo_command(payload: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-ec".to_string(),
        format!("echo -n '{payload}' >> {MOUNT_PATH}/output.txt"),
    ]
}

fn echo_template(container: &str, image: &str, size: usize) -> PodTemplateSpec {
    PodTemplateSpec {
        spec: Some(PodSpec {
            // Always is rejected for pods owned by a Job
            restart_policy: Some("OnFailure".to_string()),
            containers: vec![Container {
                name: container.to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some("Always".to_string()),
                command: Some(echo_command(&random_string(size))),
                volume_mounts: Some(vec![VolumeMount {
                    name: VOLUME_NAME.to_string(),
                    mount_path: MOUNT_PATH.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: VOLUME_NAME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn echo_job_spec(container: &str, image: &str, config: &EchoConfig) -> JobSpec {
    JobSpec {
        completions: Some(config.completes),
        parallelism: Some(config.parallels),
        template: echo_template(container, image, config.size),
        ..Default::default()
    }
}

/// How long the echo pods may take: 5 minutes per completion on top of a
/// 5 minute base, capped at 3 hours
pub fn echo_deadline(completions: i32, cron: bool) -> Duration {
    let mut deadline = PER_COMPLETION + PER_COMPLETION * completions.max(0) as u32;
    if cron {
        deadline += CRON_SLACK;
    }
    deadline.min(MAX_DURATION)
}

/// CronJob whose jobs each write a random payload of `size` bytes
#[derive(Debug, Clone)]
pub struct EchoCronJob {
    pub namespace: String,
    pub image: String,
    pub config: EchoConfig,
}

impl EchoCronJob {
    pub fn new(namespace: impl Into<String>, image: impl Into<String>, config: EchoConfig) -> Self {
        Self {
            namespace: namespace.into(),
            image: image.into(),
            config,
        }
    }

    pub fn build(&self) -> CronJob {
        CronJob {
            metadata: ObjectMeta {
                name: Some(CRONJOB_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(CronJobSpec {
                schedule: self.config.schedule.clone(),
                successful_jobs_history_limit: Some(self.config.successful_history),
                failed_jobs_history_limit: Some(self.config.failed_history),
                concurrency_policy: Some("Replace".to_string()),
                job_template: JobTemplateSpec {
                    metadata: Some(ObjectMeta {
                        name: Some(CRONJOB_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    }),
                    spec: Some(echo_job_spec(CRONJOB_NAME, &self.image, &self.config)),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for EchoCronJob {
    fn name(&self) -> &str {
        CRONJOB_NAME
    }

    fn description(&self) -> &str {
        "CronJob writing a random payload into an emptyDir on every run"
    }

    fn expected_duration(&self) -> Duration {
        echo_deadline(self.config.completes, true)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        let cronjob = self.build();
        let set = manifest_of(CRONJOB_NAME, &[cronjob])?;
        info!("Built CronJob {} ({} bytes serialized)", CRONJOB_NAME, set.rendered.len());
        Ok(set)
    }
}

/// One-shot Job with the same payload as [`EchoCronJob`]
#[derive(Debug, Clone)]
pub struct EchoJob {
    pub namespace: String,
    pub image: String,
    pub config: EchoConfig,
}

impl EchoJob {
    pub fn new(namespace: impl Into<String>, image: impl Into<String>, config: EchoConfig) -> Self {
        Self {
            namespace: namespace.into(),
            image: image.into(),
            config,
        }
    }

    pub fn build(&self) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(JOB_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(echo_job_spec(JOB_NAME, &self.image, &self.config)),
            ..Default::default()
        }
    }
}

impl Workload for EchoJob {
    fn name(&self) -> &str {
        JOB_NAME
    }

    fn description(&self) -> &str {
        "Job writing a random payload into an emptyDir"
    }

    fn expected_duration(&self) -> Duration {
        echo_deadline(self.config.completes, false)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        let job = self.build();
        let set = manifest_of(JOB_NAME, &[job])?;
        info!("Built Job {} ({} bytes serialized)", JOB_NAME, set.rendered.len());
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_yaml_snapshot;

    fn config() -> EchoConfig {
        EchoConfig {
            completes: 1000,
            parallels: 100,
            size: 10,
            schedule: "*/10 * * * *".to_string(),
            successful_history: 3,
            failed_history: 1,
        }
    }

    #[test]
    fn test_cronjob_shape() {
        let cronjob = EchoCronJob::new("default", "busybox", config()).build();
        assert_yaml_snapshot!(cronjob, {
            ".spec.jobTemplate.spec.template.spec.containers[0].command[2]" => "[payload]"
        }, @r#"
        apiVersion: batch/v1
        kind: CronJob
        metadata:
          name: cronjob-echo
          namespace: default
        spec:
          concurrencyPolicy: Replace
          failedJobsHistoryLimit: 1
          jobTemplate:
            metadata:
              name: cronjob-echo
              namespace: default
            spec:
              completions: 1000
              parallelism: 100
              template:
                spec:
                  containers:
                    - command:
                        - /bin/sh
                        - "-ec"
                        - "[payload]"
                      image: busybox
                      imagePullPolicy: Always
                      name: cronjob-echo
                      volumeMounts:
                        - mountPath: /config
                          name: config
                  restartPolicy: OnFailure
                  volumes:
                    - emptyDir: {}
                      name: config
          schedule: "*/10 * * * *"
          successfulJobsHistoryLimit: 3
        "#);
    }

    #[test]
    fn test_payload_has_configured_size() {
        let job = EchoJob::new("default", "busybox", config()).build();
        let command = job.spec.unwrap().template.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        let script = &command[2];
        let payload = script
            .strip_prefix("echo -n '")
            .and_then(|s| s.strip_suffix("' >> /config/output.txt"))
            .unwrap();
        assert_eq!(payload.len(), 10);
    }

    #[test]
    fn test_manifests_name_the_object() {
        let set = EchoJob::new("tests", "busybox", config()).manifests().unwrap();
        let handles: Vec<String> = set.handles().iter().map(|h| h.to_string()).collect();
        assert_eq!(handles, vec!["Job tests/job-echo"]);
    }

    #[test]
    fn test_deadline_scales_and_caps() {
        assert_eq!(echo_deadline(1, false), Duration::from_secs(10 * 60));
        assert_eq!(echo_deadline(1, true), Duration::from_secs(20 * 60));
        assert_eq!(echo_deadline(1000, true), Duration::from_secs(3 * 60 * 60));
    }
}
