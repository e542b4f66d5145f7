use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

use super::echo::echo_deadline;
use super::{Workload, manifest_of};
use crate::config::PiConfig;
use crate::error::Result;
use crate::manifest::ManifestSet;

pub const JOB_NAME: &str = "job-pi";

/// Computes pi to 2000 digits with Perl's bignum
#[derive(Debug, Clone)]
pub struct PiJob {
    pub namespace: String,
    pub image: String,
    pub completions: i32,
    pub parallelism: i32,
}

impl PiJob {
    pub fn new(namespace: impl Into<String>, image: impl Into<String>, config: &PiConfig) -> Self {
        Self {
            namespace: namespace.into(),
            image: image.into(),
            completions: config.completes,
            parallelism: config.parallels,
        }
    }

    pub fn build(&self) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(JOB_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                completions: Some(self.completions),
                parallelism: Some(self.parallelism),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("OnFailure".to_string()),
                        containers: vec![Container {
                            name: JOB_NAME.to_string(),
                            image: Some(self.image.clone()),
                            image_pull_policy: Some("Always".to_string()),
                            command: Some(
                                ["perl", "-Mbignum=bpi", "-wle", "print bpi(2000)"]
                                    .map(String::from)
                                    .to_vec(),
                            ),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for PiJob {
    fn name(&self) -> &str {
        JOB_NAME
    }

    fn description(&self) -> &str {
        "Job computing pi with perl bignum"
    }

    /// `5min + 5min * completions`, capped at 3 hours
    fn expected_duration(&self) -> Duration {
        echo_deadline(self.completions, false)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(JOB_NAME, &[self.build()])
    }
}
