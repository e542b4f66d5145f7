//! Short node sanity checks that need no accelerator.

use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::info;

use super::steps::{deploy_step, wait_for};
use crate::campaign::{Feature, Step};
use crate::client::ExecOutput;
use crate::conditions::{PodPhase, pod_phase_is};
use crate::config::CampaignConfig;
use crate::error::{Error, Result};
use crate::manifest::ManifestSet;
use crate::workloads::Workload;
use crate::workloads::npm_install::{self, NpmInstallPod};

pub const SUITE: &str = "quick";
pub const NPM_FEATURE: &str = "npm-install-cpu-limits";
pub const POD_RUNNING_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// A hung install is as much a failure as a failed one
pub const INSTALL_DEADLINE: Duration = Duration::from_secs(20 * 60);
const OUTPUT_TAIL_LINES: usize = 20;

fn npm_pod(config: &CampaignConfig) -> NpmInstallPod {
    NpmInstallPod::new(&config.namespace, &config.images.npm_test)
}

pub fn features() -> Vec<Feature> {
    vec![npm_install_cpu_limits()]
}

pub fn manifests(config: &CampaignConfig) -> Result<Vec<ManifestSet>> {
    Ok(vec![npm_pod(config).manifests()?])
}

fn npm_install_cpu_limits() -> Feature {
    Feature::new(NPM_FEATURE)
        .label("suite", SUITE)
        .setup(deploy_step("create pod", |ctx| Ok(npm_pod(ctx.config()))))
        .assess(
            Step::new("pod running", |ctx| async move {
                wait_for::<Pod, _>(
                    &ctx,
                    npm_install::POD_NAME,
                    POD_RUNNING_TIMEOUT,
                    &pod_phase_is(PodPhase::Running),
                )
                .await?;
                Ok(ctx)
            })
            .abort_on_failure(),
        )
        .assess(
            Step::new("npm install completes", |ctx| async move {
                info!("Installing npm packages in {}", npm_install::POD_NAME);
                let output = ctx
                    .client()?
                    .exec(
                        ctx.namespace(),
                        npm_install::POD_NAME,
                        npm_install::CONTAINER_NAME,
                        NpmInstallPod::install_command(),
                    )
                    .await?;
                check_install(&output)?;
                Ok(ctx)
            })
            .with_deadline(INSTALL_DEADLINE),
        )
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Fail with the end of the install output unless it exited 0
pub fn check_install(output: &ExecOutput) -> Result<()> {
    if output.succeeded() {
        info!("npm install finished under the CPU limit");
        return Ok(());
    }
    Err(Error::assertion(format!(
        "npm install exited with {:?}:\n{}\n{}",
        output.exit_code,
        tail(&output.stdout, OUTPUT_TAIL_LINES),
        tail(&output.stderr, OUTPUT_TAIL_LINES)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::Phase;

    #[test]
    fn test_feature_outline() {
        let feature = features().remove(0);
        assert_eq!(feature.name(), "npm-install-cpu-limits");
        assert_eq!(
            feature.outline(),
            vec![
                (Phase::Setup, "create pod"),
                (Phase::Assess, "pod running"),
                (Phase::Assess, "npm install completes"),
            ]
        );
    }

    #[test]
    fn test_check_install() {
        let ok = ExecOutput {
            stdout: "added 120 packages".to_string(),
            exit_code: Some(0),
            ..Default::default()
        };
        assert!(check_install(&ok).is_ok());

        let stdout: Vec<String> = (0..30).map(|i| format!("npm verb line {i}")).collect();
        let failed = ExecOutput {
            stdout: stdout.join("\n"),
            stderr: "npm error code ECONNRESET".to_string(),
            exit_code: Some(1),
        };
        let message = check_install(&failed).unwrap_err().to_string();
        assert!(message.starts_with("assertion failed: npm install exited with Some(1)"));
        assert!(message.contains("npm verb line 29"));
        assert!(!message.contains("npm verb line 9\n"));
        assert!(message.ends_with("npm error code ECONNRESET"));
    }
}
