//! Campaign-wide setup shared by the accelerator suites.
//!
//! Each prerequisite installs one bundle (device plugin, operator or
//! observability agent), waits for it to become ready and removes it again
//! in its finish step. The inventory prerequisite probes the nodes once and
//! publishes the snapshot for every later feature.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use super::steps::wait_for_in;
use crate::campaign::{Prerequisite, Step};
use crate::conditions::{daemonset_ready, deployment_available};
use crate::context::{Context, Key};
use crate::error::Result;
use crate::inventory::{self, CAPACITY_RETRY_TIMEOUT, HardwareSnapshot, InventoryRequest};
use crate::manifest::{self, BundleSource, ManifestSet, Vars};
use crate::workloads::manifest_of;

/// How long an installed bundle may take to become ready
pub const READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const MPI_OPERATOR: &str = "mpi-operator";
pub const NVIDIA_DEVICE_PLUGIN: &str = "nvidia-device-plugin";
pub const NEURON_DEVICE_PLUGIN: &str = "neuron-device-plugin";
pub const EFA_DEVICE_PLUGIN: &str = "efa-device-plugin";
pub const DCGM_EXPORTER: &str = "dcgm-exporter";
pub const CLOUDWATCH_AGENT: &str = "cloudwatch-agent";

/// Object whose readiness gates an installed bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    DaemonSet {
        namespace: &'static str,
        name: &'static str,
    },
    Deployment {
        namespace: &'static str,
        name: &'static str,
    },
}

impl Readiness {
    async fn wait(&self, ctx: &Context) -> Result<()> {
        match self {
            Readiness::DaemonSet { namespace, name } => {
                info!("Waiting for daemonset {}/{} to be ready", namespace, name);
                wait_for_in::<DaemonSet, _>(ctx, namespace, name, READY_TIMEOUT, &daemonset_ready())
                    .await?;
            }
            Readiness::Deployment { namespace, name } => {
                info!("Waiting for deployment {}/{} to be available", namespace, name);
                wait_for_in::<Deployment, _>(
                    ctx,
                    namespace,
                    name,
                    READY_TIMEOUT,
                    &deployment_available(),
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// A manifest bundle installed once per campaign
#[derive(Debug, Clone)]
pub struct BundleInstall {
    pub bundle: &'static str,
    pub vars: Vars,
    pub ready: Vec<Readiness>,
    /// Failures are logged and the campaign goes on
    pub optional: bool,
}

impl BundleInstall {
    pub fn new(bundle: &'static str) -> Self {
        Self {
            bundle,
            vars: Vars::new(),
            ready: Vec::new(),
            optional: false,
        }
    }

    pub fn var(mut self, key: &str, value: impl serde::Serialize) -> Self {
        self.vars = self.vars.set(key, value);
        self
    }

    pub fn ready(mut self, readiness: Readiness) -> Self {
        self.ready.push(readiness);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn render(&self, source: &BundleSource) -> Result<ManifestSet> {
        source.render_bundle(self.bundle, &self.vars)
    }

    async fn install(&self, ctx: &Context) -> Result<()> {
        let set = self.render(&ctx.bundles())?;
        let client = ctx.client()?;
        info!("Applying {} ({} document(s))", self.bundle, set.documents().len());
        manifest::apply(client, &set).await?;
        for readiness in &self.ready {
            readiness.wait(ctx).await?;
        }
        info!("{} is ready", self.bundle);
        Ok(())
    }

    async fn uninstall(&self, ctx: &Context) -> Result<()> {
        if !ctx.config().cleanup.should_cleanup() {
            info!("Keeping {} (--no-cleanup)", self.bundle);
            return Ok(());
        }
        let set = self.render(&ctx.bundles())?;
        let deleted = manifest::delete(ctx.client()?, &set).await?;
        info!("Removed {} ({} object(s))", self.bundle, deleted);
        Ok(())
    }

    pub fn prerequisite(self) -> Prerequisite {
        let setup = self.clone();
        let finish = self;
        Prerequisite::new(setup.bundle)
            .setup(Step::new("install", move |ctx| async move {
                match setup.install(&ctx).await {
                    Ok(()) => Ok(ctx),
                    Err(e) if setup.optional && !e.is_cancelled() => {
                        warn!("Optional {} was not installed: {}", setup.bundle, e);
                        Ok(ctx)
                    }
                    Err(e) => Err(e),
                }
            }))
            .finish(Step::new("uninstall", move |ctx| async move {
                match finish.uninstall(&ctx).await {
                    Ok(()) => Ok(ctx),
                    Err(e) if finish.optional => {
                        warn!("Optional {} was not removed: {}", finish.bundle, e);
                        Ok(ctx)
                    }
                    Err(e) => Err(e),
                }
            }))
    }
}

pub fn mpi_operator() -> BundleInstall {
    BundleInstall::new(MPI_OPERATOR).ready(Readiness::Deployment {
        namespace: "mpi-operator",
        name: "mpi-operator",
    })
}

pub fn nvidia_device_plugin() -> BundleInstall {
    BundleInstall::new(NVIDIA_DEVICE_PLUGIN).ready(Readiness::DaemonSet {
        namespace: "kube-system",
        name: "nvidia-device-plugin-daemonset",
    })
}

pub fn neuron_device_plugin() -> BundleInstall {
    BundleInstall::new(NEURON_DEVICE_PLUGIN).ready(Readiness::DaemonSet {
        namespace: "kube-system",
        name: "neuron-device-plugin-daemonset",
    })
}

pub fn efa_device_plugin() -> BundleInstall {
    BundleInstall::new(EFA_DEVICE_PLUGIN).ready(Readiness::DaemonSet {
        namespace: "kube-system",
        name: "aws-efa-k8s-device-plugin-daemonset",
    })
}

pub fn dcgm_exporter() -> BundleInstall {
    BundleInstall::new(DCGM_EXPORTER)
        .ready(Readiness::DaemonSet {
            namespace: "kube-system",
            name: "dcgm-exporter",
        })
        .optional()
}

/// CloudWatch agent tagging every metric with `dimensions`
pub fn cloudwatch_agent(dimensions: &BTreeMap<String, String>) -> BundleInstall {
    BundleInstall::new(CLOUDWATCH_AGENT)
        .var("dimensions", dimensions)
        .ready(Readiness::DaemonSet {
            namespace: "amazon-cloudwatch",
            name: "cwagent",
        })
        .optional()
}

pub fn namespace_manifest(name: &str) -> Result<ManifestSet> {
    manifest_of(
        &format!("namespace-{name}"),
        &[Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }],
    )
}

/// Create the campaign namespace and delete it at the end
pub fn namespace(name: &str) -> Result<Prerequisite> {
    let set = namespace_manifest(name)?;
    let finish = set.clone();
    Ok(Prerequisite::new(set.name.clone())
        .setup(Step::new("create", move |ctx| async move {
            manifest::apply(ctx.client()?, &set).await?;
            Ok(ctx)
        }))
        .finish(Step::new("delete", move |ctx| async move {
            if ctx.config().cleanup.should_cleanup() {
                manifest::delete(ctx.client()?, &finish).await?;
            }
            Ok(ctx)
        })))
}

/// Probe the nodes until `request` is satisfied and publish the snapshot under `key`
pub fn inventory(
    name: &'static str,
    key: Key<HardwareSnapshot>,
    request: InventoryRequest,
) -> Prerequisite {
    Prerequisite::new(name).setup(Step::new("probe", move |ctx| async move {
        let options = ctx.wait_options(CAPACITY_RETRY_TIMEOUT);
        let snapshot = inventory::probe_with_retry(ctx.client()?, &request, &options).await?;
        Ok(ctx.with_value(key, snapshot))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observability_bundles_are_optional() {
        assert!(dcgm_exporter().optional);
        let dimensions = BTreeMap::from([("ClusterName".to_string(), "ci".to_string())]);
        let agent = cloudwatch_agent(&dimensions);
        assert!(agent.optional);
        assert_eq!(
            agent.vars.get("dimensions"),
            Some(&serde_json::json!({"ClusterName": "ci"}))
        );
        assert!(!mpi_operator().optional);
    }

    #[test]
    fn test_embedded_bundles_render() {
        let source = BundleSource::new(None);
        let dimensions = BTreeMap::from([("ClusterName".to_string(), "ci".to_string())]);
        for install in [
            mpi_operator(),
            nvidia_device_plugin(),
            neuron_device_plugin(),
            efa_device_plugin(),
            dcgm_exporter(),
            cloudwatch_agent(&dimensions),
        ] {
            let set = install.render(&source).unwrap();
            assert!(!set.is_empty(), "{} rendered nothing", install.bundle);
        }
    }

    #[test]
    fn test_readiness_targets_rendered_objects() {
        let source = BundleSource::new(None);
        for install in [mpi_operator(), nvidia_device_plugin(), neuron_device_plugin(), efa_device_plugin()] {
            let handles = install.render(&source).unwrap().handles();
            for readiness in &install.ready {
                let (kind, namespace, name) = match readiness {
                    Readiness::DaemonSet { namespace, name } => ("DaemonSet", namespace, name),
                    Readiness::Deployment { namespace, name } => ("Deployment", namespace, name),
                };
                assert!(
                    handles.iter().any(|h| h.kind == kind
                        && h.name == *name
                        && h.namespace.as_deref() == Some(*namespace)),
                    "{} does not render {kind} {namespace}/{name}",
                    install.bundle
                );
            }
        }
    }

    #[test]
    fn test_cloudwatch_config_carries_dimensions() {
        let dimensions = BTreeMap::from([
            ("ClusterName".to_string(), "ci".to_string()),
            ("Team".to_string(), "ml".to_string()),
        ]);
        let set = cloudwatch_agent(&dimensions)
            .render(&BundleSource::new(None))
            .unwrap();
        assert!(set.rendered.contains("ClusterName"));
        assert!(set.rendered.contains("Team"));
    }

    #[test]
    fn test_namespace_prerequisite_name() {
        let prerequisite = namespace("argus-e2e").unwrap();
        assert_eq!(prerequisite.name(), "namespace-argus-e2e");
    }
}
