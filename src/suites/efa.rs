//! EFA connectivity: `fi_pingpong` between two EFA-capable nodes.

use k8s_openapi::api::core::v1::Pod;
use tracing::warn;

use super::prerequisites::{self, BundleInstall};
use super::steps::{deploy, wait_for};
use crate::campaign::{Feature, Prerequisite, Step};
use crate::conditions::{PodPhase, pod_phase_is};
use crate::config::{CampaignConfig, require_image};
use crate::error::{Error, Result};
use crate::inventory::HardwareSnapshot;
use crate::logs;
use crate::manifest::ManifestSet;
use crate::models::EFA_INTERFACE;
use crate::workloads::Workload;
use crate::workloads::pingpong::{
    CLIENT_POD_NAME, PingPongNode, PingPongPair, SERVER_POD_NAME, SERVER_TIMEOUT, choose_nodes,
};

pub const SUITE: &str = "efa";
pub const FEATURE_NAME: &str = "pingpong";
pub const IMAGE_FLAG: &str = "--ping-pong-image";
/// Matches both the server and the client pod
const POD_SELECTOR: &str = "test-suite=pingpong";

pub fn bundles(config: &CampaignConfig) -> Vec<BundleInstall> {
    if config.device_plugin.should_install() {
        vec![prerequisites::efa_device_plugin()]
    } else {
        Vec::new()
    }
}

pub fn prerequisites(config: &CampaignConfig) -> Vec<Prerequisite> {
    bundles(config)
        .into_iter()
        .map(BundleInstall::prerequisite)
        .collect()
}

pub fn features() -> Vec<Feature> {
    vec![pingpong()]
}

/// Render the pair against the first two EFA nodes of `snapshot`
pub fn manifests(config: &CampaignConfig, snapshot: &HardwareSnapshot) -> Result<Vec<ManifestSet>> {
    let image = require_image(&config.images.ping_pong, IMAGE_FLAG)?;
    let nodes: Vec<PingPongNode> = snapshot
        .nodes_with(EFA_INTERFACE)
        .into_iter()
        .take(2)
        .map(|n| PingPongNode {
            name: n.name.clone(),
            instance_type: snapshot.instance_type.clone(),
            efa: n.capacity.get(EFA_INTERFACE).copied().unwrap_or(0),
        })
        .collect();
    let [server, client] = <[PingPongNode; 2]>::try_from(nodes)
        .map_err(|nodes| Error::config(format!("need 2 EFA nodes to render, got {}", nodes.len())))?;
    let pair = PingPongPair::new(&config.namespace, image, (server, client), config.ping_pong.clone());
    Ok(vec![pair.manifests()?])
}

fn pingpong() -> Feature {
    Feature::new(FEATURE_NAME)
        .label("suite", SUITE)
        .label("hardware", "efa")
        .setup(Step::new("deploy pingpong pair", |ctx| async move {
            let image = require_image(&ctx.config().images.ping_pong, IMAGE_FLAG)?;
            let nodes = ctx.client()?.list_nodes().await?;
            let pair = PingPongPair::new(
                ctx.namespace(),
                image,
                choose_nodes(&nodes)?,
                ctx.config().ping_pong.clone(),
            );
            deploy(&ctx, &pair).await?;
            Ok(ctx)
        }))
        .assess(Step::new("server succeeds", |ctx| async move {
            let following = ctx.cancel_token().child_token();
            let followers = logs::spawn_followers(
                ctx.client()?,
                ctx.namespace(),
                vec![SERVER_POD_NAME.to_string(), CLIENT_POD_NAME.to_string()],
                following.clone(),
            );
            let outcome = wait_for::<Pod, _>(
                &ctx,
                SERVER_POD_NAME,
                SERVER_TIMEOUT,
                &pod_phase_is(PodPhase::Succeeded),
            )
            .await;
            following.cancel();
            if let Err(e) = followers.await {
                warn!("Log followers of {} stopped abnormally: {}", SERVER_POD_NAME, e);
            }
            outcome?;
            Ok(ctx)
        }))
        .teardown(Step::new("collect logs", |ctx| async move {
            let logs = logs::collect_pod_logs(ctx.client()?, ctx.namespace(), POD_SELECTOR).await;
            logs::emit(&logs);
            Ok(ctx)
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::NodeCapacity;
    use std::collections::BTreeMap;

    fn snapshot(efa_nodes: usize) -> HardwareSnapshot {
        let per_node = BTreeMap::from([(EFA_INTERFACE.to_string(), 4)]);
        HardwareSnapshot {
            instance_type: "p4d.24xlarge".to_string(),
            node_count: efa_nodes,
            nodes: (0..efa_nodes)
                .map(|i| NodeCapacity {
                    name: format!("ip-10-0-0-{i}"),
                    capacity: per_node.clone(),
                })
                .collect(),
            totals: BTreeMap::from([(EFA_INTERFACE.to_string(), 4 * efa_nodes as i64)]),
            per_node,
        }
    }

    #[test]
    fn test_render_needs_image() {
        let err = manifests(&CampaignConfig::default(), &snapshot(2)).unwrap_err();
        assert!(err.to_string().contains(IMAGE_FLAG));
    }

    #[test]
    fn test_render_pins_first_two_nodes() {
        let mut config = CampaignConfig::default();
        config.images.ping_pong = Some("efa-tests:latest".to_string());
        let sets = manifests(&config, &snapshot(3)).unwrap();
        assert_eq!(sets[0].handles().len(), 3);
        assert!(sets[0].rendered.contains("ip-10-0-0-0"));
        assert!(sets[0].rendered.contains("ip-10-0-0-1"));
        assert!(!sets[0].rendered.contains("ip-10-0-0-2"));

        assert!(manifests(&config, &snapshot(1)).is_err());
    }

    #[test]
    fn test_log_selector_matches_both_pods() {
        let mut config = CampaignConfig::default();
        config.images.ping_pong = Some("efa-tests:latest".to_string());
        let set = &manifests(&config, &snapshot(2)).unwrap()[0];
        let pods: Vec<&str> = set
            .documents()
            .iter()
            .filter(|d| d.handle.kind == "Pod")
            .map(|d| d.body["metadata"]["labels"]["test-suite"].as_str().unwrap())
            .collect();
        assert_eq!(pods, vec!["pingpong", "pingpong"]);
        assert_eq!(POD_SELECTOR, "test-suite=pingpong");
        assert_eq!(pingpong().labels()["hardware"], "efa");
    }
}
