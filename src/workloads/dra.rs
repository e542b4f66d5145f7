//! Dynamic resource allocation with the upstream example driver.
//!
//! The driver, its RBAC, the device class and the claim template come from
//! the `dra-example-driver` bundle. The pod claiming a device is built here.

use k8s_openapi::api::core::v1::{
    Container, Pod, PodResourceClaim, PodSpec, ResourceClaim, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::time::Duration;

use super::{Workload, manifest_of};
use crate::error::Result;
use crate::manifest::{BundleSource, ManifestSet, Vars};

pub const BUNDLE: &str = "dra-example-driver";
pub const DRIVER_NAME: &str = "gpu.example.com";
pub const DAEMONSET_NAME: &str = "dra-example-driver-kubeletplugin";
pub const CLAIM_TEMPLATE: &str = "single-gpu";
pub const REQUEST_NAME: &str = "gpu";
pub const POD_NAME: &str = "pod0";
pub const CONTAINER_NAME: &str = "ctr0";

pub const RUNNING_TIMEOUT: Duration = Duration::from_secs(60);
pub const DELETED_TIMEOUT: Duration = Duration::from_secs(60);

/// Line the driver injects into the environment of a claiming container
pub fn expected_env_line() -> String {
    format!("DRA_RESOURCE_DRIVER_NAME=\"{DRIVER_NAME}\"")
}

/// Kubelet plugin, RBAC, device class and claim template
#[derive(Debug, Clone)]
pub struct DraDriver {
    pub namespace: String,
    pub image: String,
    pub bundles: BundleSource,
}

impl DraDriver {
    pub fn vars(&self) -> Vars {
        Vars::new()
            .set("namespace", &self.namespace)
            .set("image", &self.image)
            .set("driver_name", DRIVER_NAME)
            .set("claim_template", CLAIM_TEMPLATE)
            .set("request_name", REQUEST_NAME)
    }
}

impl Workload for DraDriver {
    fn name(&self) -> &str {
        BUNDLE
    }

    fn description(&self) -> &str {
        "DRA example kubelet plugin with a device class and claim template"
    }

    fn expected_duration(&self) -> Duration {
        Duration::from_secs(5 * 60)
    }

    fn manifests(&self) -> Result<ManifestSet> {
        self.bundles.render_bundle(BUNDLE, &self.vars())
    }
}

/// Pod that claims one device and prints its environment
#[derive(Debug, Clone)]
pub struct DraClaimPod {
    pub namespace: String,
    pub image: String,
}

impl DraClaimPod {
    pub fn new(namespace: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            image: image.into(),
        }
    }

    pub fn build(&self) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(POD_NAME.to_string()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    image: Some(self.image.clone()),
                    command: Some(vec!["bash".to_string(), "-c".to_string()]),
                    args: Some(vec![
                        "export; trap 'exit 0' TERM; sleep infinity & wait".to_string(),
                    ]),
                    resources: Some(ResourceRequirements {
                        claims: Some(vec![ResourceClaim {
                            name: REQUEST_NAME.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                resource_claims: Some(vec![PodResourceClaim {
                    name: REQUEST_NAME.to_string(),
                    resource_claim_template_name: Some(CLAIM_TEMPLATE.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl Workload for DraClaimPod {
    fn name(&self) -> &str {
        POD_NAME
    }

    fn description(&self) -> &str {
        "Pod claiming one example GPU"
    }

    fn expected_duration(&self) -> Duration {
        RUNNING_TIMEOUT
    }

    fn manifests(&self) -> Result<ManifestSet> {
        manifest_of(POD_NAME, &[self.build()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemaless::FieldPath;

    fn driver() -> DraDriver {
        DraDriver {
            namespace: "dra".to_string(),
            image: "registry.k8s.io/dra-example-driver/dra-example-driver:v0.1.0".to_string(),
            bundles: BundleSource::default(),
        }
    }

    #[test]
    fn test_driver_bundle_documents() {
        let set = driver().manifests().unwrap();
        let handles: Vec<String> = set.handles().iter().map(|h| h.to_string()).collect();
        assert_eq!(
            handles,
            vec![
                "ServiceAccount dra/dra-service-account",
                "ClusterRole dra-example-driver-role",
                "ClusterRoleBinding dra-example-driver-role-binding",
                "DaemonSet dra/dra-example-driver-kubeletplugin",
                "DeviceClass gpu.example.com",
                "ResourceClaimTemplate dra/single-gpu",
            ]
        );

        let class = &set.documents()[4].body;
        assert_eq!(
            class.field_array("spec.selectors").unwrap()[0].field_str("cel.expression"),
            Some("device.driver == 'gpu.example.com'")
        );
        let plugin = &set.documents()[3].body;
        let env = plugin.field_array("spec.template.spec.containers").unwrap()[0]
            .field_array("env")
            .unwrap();
        assert!(env.iter().any(|e| e.field_str("name") == Some("NUM_DEVICES")
            && e.field_str("value") == Some("8")));
    }

    #[test]
    fn test_claim_pod_references_template() {
        let pod = DraClaimPod::new("dra", "amazonlinux").build();
        let spec = pod.spec.unwrap();
        let claim = &spec.resource_claims.unwrap()[0];
        assert_eq!(claim.resource_claim_template_name.as_deref(), Some(CLAIM_TEMPLATE));
        let container = &spec.containers[0];
        assert_eq!(
            container.resources.as_ref().unwrap().claims.as_ref().unwrap()[0].name,
            claim.name
        );
    }

    #[test]
    fn test_expected_env_line() {
        assert_eq!(expected_env_line(), r#"DRA_RESOURCE_DRIVER_NAME="gpu.example.com""#);
    }
}
