//! A user-supplied container run to completion as a single Job.

use super::steps::{deploy_step, job_logs_step, wait_job_succeeded};
use crate::campaign::{Feature, Step};
use crate::config::{CampaignConfig, require_image};
use crate::context::Context;
use crate::error::Result;
use crate::manifest::ManifestSet;
use crate::workloads::Workload;
use crate::workloads::workload_job::{WorkloadJob, accelerator_of};

pub const SUITE: &str = "workload";
pub const IMAGE_FLAG: &str = "--workload-image";

fn job(ctx: &Context) -> Result<WorkloadJob> {
    let config = ctx.config();
    let image = require_image(&config.images.workload, IMAGE_FLAG)?;
    Ok(WorkloadJob::from_config(ctx.namespace(), &image, &config.workload))
}

/// One feature named after the workload; labelled with the accelerator its
/// resources ask for
pub fn features(config: &CampaignConfig) -> Vec<Feature> {
    let name = config.workload.name.clone();
    let timeout = config.workload.timeout;
    let mut feature = Feature::new(&name).label("suite", SUITE);
    if let Some(accelerator) = accelerator_of(&config.workload.resources) {
        feature = feature.label("hardware", accelerator.label());
    }
    let assess_name = name.clone();
    vec![
        feature
            .setup(deploy_step("create job", job))
            .assess(Step::new("job succeeds", move |ctx| async move {
                wait_job_succeeded(&ctx, &assess_name, timeout).await?;
                Ok(ctx)
            }))
            .teardown(job_logs_step(name)),
    ]
}

pub fn manifests(config: &CampaignConfig) -> Result<Vec<ManifestSet>> {
    let image = require_image(&config.images.workload, IMAGE_FLAG)?;
    Ok(vec![
        WorkloadJob::from_config(&config.namespace, &image, &config.workload).manifests()?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config(resources: &[(&str, &str)]) -> CampaignConfig {
        let mut config = CampaignConfig::default();
        config.images.workload = Some("my-model:v2".to_string());
        config.workload.name = "llama-smoke".to_string();
        config.workload.command = vec!["python".to_string(), "smoke.py".to_string()];
        config.workload.timeout = Duration::from_secs(600);
        config.workload.resources = resources
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        config
    }

    #[test]
    fn test_hardware_label_follows_resources() {
        let gpu = features(&config(&[("nvidia.com/gpu", "1"), ("aws.amazon.com/neuron", "1")]));
        assert_eq!(gpu[0].name(), "llama-smoke");
        assert_eq!(gpu[0].labels()["hardware"], "gpu");

        let neuron = features(&config(&[("aws.amazon.com/neuron", "2")]));
        assert_eq!(neuron[0].labels()["hardware"], "neuron");

        let plain = features(&config(&[]));
        assert!(!plain[0].labels().contains_key("hardware"));
        assert_eq!(plain[0].labels()["suite"], "workload");
    }

    #[test]
    fn test_render_carries_command_and_deadline() {
        let sets = manifests(&config(&[("nvidia.com/gpu", "1")])).unwrap();
        let job = &sets[0].documents()[0].body;
        assert_eq!(job["metadata"]["name"], "llama-smoke");
        let pod = &job["spec"]["template"]["spec"];
        assert_eq!(pod["activeDeadlineSeconds"], 600);
        let container = &pod["containers"][0];
        assert_eq!(container["command"][1], "smoke.py");
        assert_eq!(container["resources"]["limits"]["nvidia.com/gpu"], "1");
    }

    #[test]
    fn test_render_needs_image() {
        let err = manifests(&CampaignConfig::default()).unwrap_err();
        assert!(err.to_string().contains(IMAGE_FLAG));
    }
}
