//! Dynamic resource allocation with the example driver.

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use tracing::info;

use super::prerequisites::READY_TIMEOUT;
use super::steps::{deploy, deploy_step, wait_deleted, wait_for};
use crate::campaign::{Feature, Step};
use crate::conditions::{PodPhase, Predicate, daemonset_ready, logs_contain, pod_phase_is};
use crate::config::CampaignConfig;
use crate::context::Context;
use crate::error::Result;
use crate::manifest::{BundleSource, ManifestSet};
use crate::wait;
use crate::workloads::Workload;
use crate::workloads::dra::{
    self, CONTAINER_NAME, DELETED_TIMEOUT, DraClaimPod, DraDriver, POD_NAME, RUNNING_TIMEOUT,
    expected_env_line,
};

pub const SUITE: &str = "dra";

fn driver(namespace: &str, image: &str, bundles: BundleSource) -> DraDriver {
    DraDriver {
        namespace: namespace.to_string(),
        image: image.to_string(),
        bundles,
    }
}

pub fn features() -> Vec<Feature> {
    vec![dra_example_driver()]
}

pub fn manifests(config: &CampaignConfig, bundles: &BundleSource) -> Result<Vec<ManifestSet>> {
    Ok(vec![
        driver(&config.namespace, &config.images.dra_driver, bundles.clone()).manifests()?,
        DraClaimPod::new(&config.namespace, &config.images.sleep).manifests()?,
    ])
}

fn dra_example_driver() -> Feature {
    Feature::new(dra::BUNDLE)
        .label("suite", SUITE)
        .setup(Step::new("install driver", |ctx| async move {
            let driver = driver(ctx.namespace(), &ctx.config().images.dra_driver, ctx.bundles());
            deploy(&ctx, &driver).await?;
            info!("Waiting for the DRA kubelet plugin to be ready");
            wait_for::<DaemonSet, _>(&ctx, dra::DAEMONSET_NAME, READY_TIMEOUT, &daemonset_ready())
                .await?;
            Ok(ctx)
        }))
        .setup(deploy_step("create claiming pod", |ctx| {
            Ok(DraClaimPod::new(ctx.namespace(), &ctx.config().images.sleep))
        }))
        .assess(
            Step::new("pod running", |ctx| async move {
                wait_for::<Pod, _>(&ctx, POD_NAME, RUNNING_TIMEOUT, &pod_phase_is(PodPhase::Running))
                    .await?;
                Ok(ctx)
            })
            .abort_on_failure(),
        )
        .assess(Step::new("device visible in environment", |ctx| async move {
            wait_for_env_line(&ctx).await?;
            Ok(ctx)
        }))
        .assess(Step::new("pod deleted", |ctx| async move {
            let client = ctx.client()?;
            client.delete_if_exists(&client.pods(ctx.namespace()), POD_NAME).await?;
            wait_deleted::<Pod>(&ctx, POD_NAME, DELETED_TIMEOUT).await?;
            Ok(ctx)
        }))
}

/// The container prints its environment once on start
async fn wait_for_env_line(ctx: &Context) -> Result<()> {
    let client = ctx.client()?;
    let namespace = ctx.namespace();
    let predicate = logs_contain(expected_env_line());
    wait::until(
        &format!("{} in logs of {}", expected_env_line(), POD_NAME),
        &ctx.wait_options(RUNNING_TIMEOUT),
        || async {
            let logs = client.logs(namespace, POD_NAME, Some(CONTAINER_NAME)).await?;
            predicate.check(logs.as_str())
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::Phase;

    #[test]
    fn test_outline() {
        let feature = dra_example_driver();
        assert_eq!(feature.name(), "dra-example-driver");
        assert_eq!(
            feature.outline(),
            vec![
                (Phase::Setup, "install driver"),
                (Phase::Setup, "create claiming pod"),
                (Phase::Assess, "pod running"),
                (Phase::Assess, "device visible in environment"),
                (Phase::Assess, "pod deleted"),
            ]
        );
    }

    #[test]
    fn test_render_places_driver_in_namespace() {
        let mut config = CampaignConfig::default();
        config.namespace = "dra-e2e".to_string();
        let sets = manifests(&config, &BundleSource::new(None)).unwrap();
        let handles: Vec<String> = sets.iter().flat_map(|s| s.handles()).map(|h| h.to_string()).collect();
        assert!(handles.contains(&"DaemonSet dra-e2e/dra-example-driver-kubeletplugin".to_string()));
        assert!(handles.contains(&"ResourceClaimTemplate dra-e2e/single-gpu".to_string()));
        assert_eq!(handles.last().map(String::as_str), Some("Pod dra-e2e/pod0"));
    }
}
