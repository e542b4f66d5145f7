//! Three tenants, each an nginx server in its own namespace, and the policy
//! that isolates tenant a from tenant c.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, Namespace, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{Workload, app_labels, manifest_of};
use crate::error::Result;
use crate::manifest::ManifestSet;

pub const TENANTS: [&str; 3] = ["a", "b", "c"];
pub const NAMESPACE_PREFIX: &str = "netpol";
/// Namespace label the policy selects peers by
pub const NAMESPACE_LABEL: &str = "ns";
pub const HTTP_PORT: i32 = 80;
pub const DNS_PORT: i32 = 53;
pub const POLICY_NAME: &str = "block-c-to-a";

/// nginx Deployment and Service in the tenant's own namespace
#[derive(Debug, Clone)]
pub struct TenantServer {
    pub tenant: String,
    pub namespace: String,
    pub name: String,
    pub image: String,
}

impl TenantServer {
    /// `<tenant>-server` in `netpol-<tenant>`
    pub fn new(tenant: &str, image: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            namespace: tenant_namespace(tenant),
            name: format!("{tenant}-server"),
            image: image.to_string(),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}.{}:{}", self.name, self.namespace, HTTP_PORT)
    }

    /// `app=<name>`
    pub fn selector(&self) -> String {
        format!("app={}", self.name)
    }

    pub fn namespace_object(&self) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    NAMESPACE_LABEL.to_string(),
                    self.namespace.clone(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn deployment(&self) -> Deployment {
        let labels = app_labels(&self.name);
        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: self.name.clone(),
                            image: Some(self.image.clone()),
                            ports: Some(vec![ContainerPort {
                                container_port: HTTP_PORT,
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(app_labels(&self.name)),
                ports: Some(vec![ServicePort {
                    port: HTTP_PORT,
                    target_port: Some(IntOrString::Int(HTTP_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for TenantServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "nginx server in its own namespace"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        let documents = vec![
            serde_json::to_value(self.namespace_object())?,
            serde_json::to_value(self.deployment())?,
            serde_json::to_value(self.service())?,
        ];
        manifest_of(&format!("{NAMESPACE_PREFIX}-{}", self.name), &documents)
    }
}

pub fn tenant_namespace(tenant: &str) -> String {
    format!("{NAMESPACE_PREFIX}-{tenant}")
}

pub fn servers(image: &str) -> Vec<TenantServer> {
    TENANTS.iter().map(|t| TenantServer::new(t, image)).collect()
}

fn port(protocol: &str, port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some(protocol.to_string()),
        port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn peer(server: &TenantServer) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                NAMESPACE_LABEL.to_string(),
                server.namespace.clone(),
            )])),
            ..Default::default()
        }),
        pod_selector: Some(LabelSelector {
            match_labels: Some(app_labels(&server.name)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Server a talks only to server b, in both directions, plus DNS
#[derive(Debug, Clone)]
pub struct BlockCToA {
    a: TenantServer,
    b: TenantServer,
}

impl BlockCToA {
    pub fn new(image: &str) -> Self {
        Self {
            a: TenantServer::new("a", image),
            b: TenantServer::new("b", image),
        }
    }

    pub fn build(&self) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(POLICY_NAME.to_string()),
                namespace: Some(self.a.namespace.clone()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: Some(LabelSelector {
                    match_labels: Some(app_labels(&self.a.name)),
                    ..Default::default()
                }),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![peer(&self.b)]),
                    ports: Some(vec![port("TCP", HTTP_PORT)]),
                }]),
                egress: Some(vec![
                    NetworkPolicyEgressRule {
                        to: Some(vec![peer(&self.b)]),
                        ports: Some(vec![port("TCP", HTTP_PORT)]),
                    },
                    NetworkPolicyEgressRule {
                        to: None,
                        ports: Some(vec![port("UDP", DNS_PORT), port("TCP", DNS_PORT)]),
                    },
                ]),
            }),
        }
    }
}

impl Workload for BlockCToA {
    fn name(&self) -> &str {
        POLICY_NAME
    }

    fn description(&self) -> &str {
        "NetworkPolicy admitting only server b into server a"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(POLICY_NAME, &[self.build()])
    }
}

/// HEAD request with a two second budget
pub fn curl_command(target: &TenantServer) -> Vec<String> {
    let url = target.url();
    ["curl", "-s", "-m", "2", "-I", url.as_str()]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Whether `curl -I` output starts with a 200 status line
pub fn http_ok(stdout: &str) -> bool {
    stdout
        .lines()
        .next()
        .and_then(|status| status.split_whitespace().nth(1))
        == Some("200")
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn test_tenant_server_documents() {
        let server = TenantServer::new("b", "nginx:stable");
        assert_eq!(server.url(), "http://b-server.netpol-b:80");
        let set = server.manifests().unwrap();
        let kinds: Vec<String> = set.handles().into_iter().map(|h| h.to_string()).collect();
        assert_eq!(
            kinds,
            vec![
                "Namespace netpol-b",
                "Deployment netpol-b/b-server",
                "Service netpol-b/b-server"
            ]
        );
        let namespace = server.namespace_object();
        assert_eq!(namespace.metadata.labels.unwrap()["ns"], "netpol-b");
    }

    #[test]
    fn test_block_c_to_a_policy() {
        assert_snapshot!(BlockCToA::new("nginx:stable").manifests().unwrap().rendered, @r"
        apiVersion: networking.k8s.io/v1
        kind: NetworkPolicy
        metadata:
          name: block-c-to-a
          namespace: netpol-a
        spec:
          egress:
          - ports:
            - port: 80
              protocol: TCP
            to:
            - namespaceSelector:
                matchLabels:
                  ns: netpol-b
              podSelector:
                matchLabels:
                  app: b-server
          - ports:
            - port: 53
              protocol: UDP
            - port: 53
              protocol: TCP
          ingress:
          - from:
            - namespaceSelector:
                matchLabels:
                  ns: netpol-b
              podSelector:
                matchLabels:
                  app: b-server
            ports:
            - port: 80
              protocol: TCP
          podSelector:
            matchLabels:
              app: a-server
          policyTypes:
          - Ingress
          - Egress
        ");
    }

    #[test]
    fn test_http_ok() {
        assert!(http_ok("HTTP/1.1 200 OK\r\nServer: nginx/1.27.2\r\n"));
        assert!(!http_ok("HTTP/1.1 403 Forbidden\r\n"));
        assert!(!http_ok(""));
        assert!(!http_ok("curl: (28) Connection timed out after 2001 milliseconds"));
    }

    #[test]
    fn test_curl_command_targets_service_dns() {
        let target = TenantServer::new("a", "nginx:stable");
        assert_eq!(
            curl_command(&target),
            vec!["curl", "-s", "-m", "2", "-I", "http://a-server.netpol-a:80"]
        );
    }
}
