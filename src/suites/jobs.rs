//! Batch API smoke tests: an echo CronJob, an echo Job and a pi Job.

use k8s_openapi::api::batch::v1::CronJob;
use tracing::info;

use super::steps::{deploy_step, job_logs_step, wait_for, wait_job_succeeded};
use crate::campaign::{Feature, Step};
use crate::conditions::resource_match;
use crate::config::CampaignConfig;
use crate::error::Result;
use crate::manifest::ManifestSet;
use crate::workloads::Workload;
use crate::workloads::echo::{self, EchoCronJob, EchoJob, echo_deadline};
use crate::workloads::pi::{self, PiJob};

pub const SUITE: &str = "jobs";

fn echo_cronjob(config: &CampaignConfig) -> EchoCronJob {
    EchoCronJob::new(&config.namespace, &config.images.echo, config.echo.clone())
}

fn echo_job(config: &CampaignConfig) -> EchoJob {
    EchoJob::new(&config.namespace, &config.images.echo, config.echo.clone())
}

fn pi_job(config: &CampaignConfig) -> PiJob {
    PiJob::new(&config.namespace, &config.images.pi, &config.pi)
}

pub fn features() -> Vec<Feature> {
    vec![cronjob_echo(), job_echo(), job_pi()]
}

pub fn manifests(config: &CampaignConfig) -> Result<Vec<ManifestSet>> {
    Ok(vec![
        echo_cronjob(config).manifests()?,
        echo_job(config).manifests()?,
        pi_job(config).manifests()?,
    ])
}

fn cronjob_echo() -> Feature {
    Feature::new(echo::CRONJOB_NAME)
        .label("suite", SUITE)
        .setup(deploy_step("create cronjob", |ctx| {
            Ok(echo_cronjob(ctx.config()))
        }))
        .assess(Step::new("cronjob exists", |ctx| async move {
            let deadline = echo_deadline(ctx.config().echo.completes, true);
            let exists = resource_match("cronjob exists", |_: &CronJob| true);
            let cronjob = wait_for::<CronJob, _>(&ctx, echo::CRONJOB_NAME, deadline, &exists).await?;
            let size = serde_json::to_vec(&cronjob)?.len();
            info!("CronJob {} is {} bytes", echo::CRONJOB_NAME, size);
            Ok(ctx)
        }))
}

fn job_echo() -> Feature {
    Feature::new(echo::JOB_NAME)
        .label("suite", SUITE)
        .setup(deploy_step("create job", |ctx| Ok(echo_job(ctx.config()))))
        .assess(Step::new("job succeeds", |ctx| async move {
            let deadline = echo_deadline(ctx.config().echo.completes, false);
            wait_job_succeeded(&ctx, echo::JOB_NAME, deadline).await?;
            Ok(ctx)
        }))
}

fn job_pi() -> Feature {
    Feature::new(pi::JOB_NAME)
        .label("suite", SUITE)
        .setup(deploy_step("create job", |ctx| Ok(pi_job(ctx.config()))))
        .assess(Step::new("job succeeds", |ctx| async move {
            let deadline = pi_job(ctx.config()).expected_duration();
            wait_job_succeeded(&ctx, pi::JOB_NAME, deadline).await?;
            Ok(ctx)
        }))
        .teardown(job_logs_step(pi::JOB_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_names_and_labels() {
        let features = features();
        let names: Vec<&str> = features.iter().map(Feature::name).collect();
        assert_eq!(names, vec!["cronjob-echo", "job-echo", "job-pi"]);
        assert!(features.iter().all(|f| f.labels()["suite"] == "jobs"));
    }

    #[test]
    fn test_manifests_follow_config() {
        let mut config = CampaignConfig::default();
        config.namespace = "batch-e2e".to_string();
        let sets = manifests(&config).unwrap();
        let handles: Vec<String> = sets
            .iter()
            .flat_map(|s| s.handles())
            .map(|h| h.to_string())
            .collect();
        assert_eq!(
            handles,
            vec![
                "CronJob batch-e2e/cronjob-echo",
                "Job batch-e2e/job-echo",
                "Job batch-e2e/job-pi",
            ]
        );
    }
}
