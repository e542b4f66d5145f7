//! `fi_pingpong` between two EFA-capable nodes.
//!
//! The server and client pods share a headless service so the client can
//! address the server as `pingpong-server.pingpong-service`.

use k8s_openapi::api::core::v1::{Node, Pod, Service, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

use super::Workload;
use super::device_pod::DeviceRequestPod;
use crate::config::PingPongConfig;
use crate::error::{Error, Result};
use crate::inventory::{capacity_of, instance_type_of};
use crate::manifest::ManifestSet;
use crate::models::EFA_INTERFACE;

pub const SERVICE_NAME: &str = "pingpong-service";
pub const SERVER_POD_NAME: &str = "pingpong-server";
pub const CLIENT_POD_NAME: &str = "pingpong-client";
pub const CONTAINER_NAME: &str = "pingpong";
pub const PINGPONG_COMMAND: &str = "fi_pingpong";

/// How long the server may take to report Succeeded
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// A node picked for one side of the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingPongNode {
    pub name: String,
    pub instance_type: String,
    pub efa: i64,
}

impl PingPongNode {
    fn of(node: &Node) -> Option<Self> {
        let efa = capacity_of(node, EFA_INTERFACE).filter(|c| *c > 0)?;
        Some(Self {
            name: node.name_any(),
            instance_type: instance_type_of(node).unwrap_or("unknown").to_string(),
            efa,
        })
    }
}

/// First two nodes advertising EFA interfaces, as (server, client)
pub fn choose_nodes(nodes: &[Node]) -> Result<(PingPongNode, PingPongNode)> {
    let mut candidates: Vec<PingPongNode> = nodes.iter().filter_map(PingPongNode::of).collect();
    if candidates.len() < 2 {
        return Err(Error::assertion(format!(
            "need at least 2 nodes with EFA capacity, got {}",
            candidates.len()
        )));
    }
    let client = candidates.swap_remove(1);
    let server = candidates.swap_remove(0);
    info!("Using node {} (type: {}), as server", server.name, server.instance_type);
    info!("Using node {} (type: {}), as client", client.name, client.instance_type);
    Ok((server, client))
}

fn pingpong_labels(server: bool) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("test-suite".to_string(), "pingpong".to_string()),
        ("pingpong-server".to_string(), server.to_string()),
    ])
}

/// Headless service plus server and client pods
#[derive(Debug, Clone)]
pub struct PingPongPair {
    pub namespace: String,
    pub image: String,
    pub server: PingPongNode,
    pub client: PingPongNode,
    pub config: PingPongConfig,
}

impl PingPongPair {
    pub fn new(
        namespace: impl Into<String>,
        image: impl Into<String>,
        (server, client): (PingPongNode, PingPongNode),
        config: PingPongConfig,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            image: image.into(),
            server,
            client,
            config,
        }
    }

    pub fn args(&self, server: bool) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            self.config.size.to_string(),
            "-I".to_string(),
            self.config.iters.to_string(),
            "-p".to_string(),
            "efa".to_string(),
        ];
        if self.config.verbose {
            args.push("-v".to_string());
        }
        if !server {
            args.push(format!("{SERVER_POD_NAME}.{SERVICE_NAME}"));
        }
        args
    }

    pub fn service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(SERVICE_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(pingpong_labels(true)),
                cluster_ip: Some("None".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn pod(&self, server: bool) -> Pod {
        let (name, node) = if server {
            (SERVER_POD_NAME, &self.server)
        } else {
            (CLIENT_POD_NAME, &self.client)
        };
        let mut builder = DeviceRequestPod::new(name, &self.namespace, &self.image)
            .container(CONTAINER_NAME)
            .device(EFA_INTERFACE, node.efa)
            .command([
                "timeout".to_string(),
                format!("{}s", self.config.deadline_seconds),
                PINGPONG_COMMAND.to_string(),
            ])
            .args(self.args(server))
            .pinned_to(&node.name)
            .restart_policy("OnFailure");
        for (key, value) in pingpong_labels(server) {
            builder = builder.label(key, value);
        }

        let mut pod = builder.build();
        if let Some(spec) = pod.spec.as_mut() {
            spec.hostname = Some(name.to_string());
            spec.subdomain = Some(SERVICE_NAME.to_string());
        }
        pod
    }
}

impl Workload for PingPongPair {
    fn name(&self) -> &str {
        SERVER_POD_NAME
    }

    fn description(&self) -> &str {
        "fi_pingpong over EFA between two nodes"
    }

    fn expected_duration(&self) -> Duration {
        SERVER_TIMEOUT
    }

    fn manifests(&self) -> Result<ManifestSet> {
        let documents = vec![
            serde_json::to_value(self.service())?,
            serde_json::to_value(self.pod(true))?,
            serde_json::to_value(self.pod(false))?,
        ];
        super::manifest_of(CONTAINER_NAME, &documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn node(name: &str, efa: Option<&str>) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    crate::models::INSTANCE_TYPE_LABEL.to_string(),
                    "p5.48xlarge".to_string(),
                )])),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: efa.map(|e| BTreeMap::from([(EFA_INTERFACE.to_string(), Quantity(e.to_string()))])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config() -> PingPongConfig {
        PingPongConfig {
            size: 4096,
            iters: 10000,
            deadline_seconds: 120,
            verbose: true,
        }
    }

    #[test]
    fn test_choose_nodes_skips_nodes_without_efa() {
        let nodes = vec![node("a", Some("32")), node("b", None), node("c", Some("0")), node("d", Some("32"))];
        let (server, client) = choose_nodes(&nodes).unwrap();
        assert_eq!(server.name, "a");
        assert_eq!(client.name, "d");
        assert_eq!(client.efa, 32);
    }

    #[test]
    fn test_choose_nodes_needs_two() {
        let err = choose_nodes(&[node("a", Some("32")), node("b", None)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "assertion failed: need at least 2 nodes with EFA capacity, got 1"
        );
    }

    #[test]
    fn test_client_addresses_server_through_service() {
        let nodes = choose_nodes(&[node("a", Some("4")), node("b", Some("4"))]).unwrap();
        let pair = PingPongPair::new("efa-tests", "efa-image", nodes, config());
        assert_eq!(
            pair.args(false),
            vec!["-S", "4096", "-I", "10000", "-p", "efa", "-v", "pingpong-server.pingpong-service"]
        );
        assert_eq!(pair.args(true).last().map(String::as_str), Some("-v"));
    }

    #[test]
    fn test_rendered_pair() {
        let nodes = choose_nodes(&[node("a", Some("4")), node("b", Some("4"))]).unwrap();
        let pair = PingPongPair::new("efa-tests", "efa-image", nodes, config());
        let set = pair.manifests().unwrap();
        let handles: Vec<String> = set.handles().iter().map(|h| h.to_string()).collect();
        assert_eq!(
            handles,
            vec![
                "Service efa-tests/pingpong-service",
                "Pod efa-tests/pingpong-server",
                "Pod efa-tests/pingpong-client",
            ]
        );

        let server = serde_yaml::to_string(&pair.pod(true)).unwrap();
        assert_snapshot!(server, @r#"
        apiVersion: v1
        kind: Pod
        metadata:
          labels:
            pingpong-server: 'true'
            test-suite: pingpong
          name: pingpong-server
          namespace: efa-tests
        spec:
          affinity:
            nodeAffinity:
              requiredDuringSchedulingIgnoredDuringExecution:
                nodeSelectorTerms:
                - matchExpressions:
                  - key: kubernetes.io/hostname
                    operator: In
                    values:
                    - a
          containers:
          - args:
            - -S
            - '4096'
            - -I
            - '10000'
            - -p
            - efa
            - -v
            command:
            - timeout
            - 120s
            - fi_pingpong
            image: efa-image
            name: pingpong
            resources:
              limits:
                vpc.amazonaws.com/efa: '4'
              requests:
                vpc.amazonaws.com/efa: '4'
          hostname: pingpong-server
          restartPolicy: OnFailure
          subdomain: pingpong-service
        "#);
    }
}
