//! Concrete campaigns.
//!
//! Each suite contributes campaign prerequisites and features; [`campaign`]
//! assembles the suites a configuration asks for into one [`Campaign`], and
//! [`render`] produces the manifests the same campaign would apply without
//! touching a cluster.

use std::collections::BTreeMap;
use tracing::debug;

use crate::campaign::Campaign;
use crate::config::{CampaignConfig, DEFAULT_NAMESPACE};
use crate::context::Key;
use crate::error::Result;
use crate::inventory::{HardwareSnapshot, NodeCapacity};
use crate::manifest::{BundleSource, ManifestSet};
use crate::models::{EFA_INTERFACE, NEURON_CORE, NEURON_DEVICE, NVIDIA_GPU, Suite};

pub mod disruptive;
pub mod dra;
pub mod efa;
pub mod jobs;
pub mod netpol;
pub mod neuron;
pub mod nvidia;
pub mod prerequisites;
pub mod quick;
pub mod steps;
pub mod workload;

/// Snapshot published by the neuron inventory prerequisite
pub const NEURON_HARDWARE: Key<HardwareSnapshot> = Key::new("neuron.hardware");
/// Snapshot published by the GPU inventory prerequisite
pub const GPU_HARDWARE: Key<HardwareSnapshot> = Key::new("gpu.hardware");

const NOMINAL_GPU_INSTANCE: &str = "p5.48xlarge";
const NOMINAL_NEURON_INSTANCE: &str = "trn1.32xlarge";
const NOMINAL_NODES: usize = 2;

/// `argus-` followed by eight characters of a random uuid
pub fn campaign_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("argus-{}", &id[..8])
}

/// Every feature and prerequisite of the configured suites, unselected
pub fn campaign(config: &CampaignConfig) -> Result<Campaign> {
    let mut campaign = Campaign::new(campaign_name());
    if config.namespace != DEFAULT_NAMESPACE {
        campaign = campaign.prerequisite(prerequisites::namespace(&config.namespace)?);
    }
    for suite in &config.suites {
        let (prerequisites, features) = match suite {
            Suite::Jobs => (Vec::new(), jobs::features()),
            Suite::Disruptive => (Vec::new(), disruptive::features(config)),
            Suite::Efa => (efa::prerequisites(config), efa::features()),
            Suite::Dra => (Vec::new(), dra::features()),
            Suite::Neuron => (neuron::prerequisites(config), neuron::features(config)),
            Suite::Nvidia => (nvidia::prerequisites(config), nvidia::features(config)),
            Suite::Workload => (Vec::new(), workload::features(config)),
            Suite::Netpol => (netpol::prerequisites(), netpol::features()),
            Suite::Quick => (Vec::new(), quick::features()),
        };
        debug!(
            "Suite {:?}: {} prerequisite(s), {} feature(s)",
            suite,
            prerequisites.len(),
            features.len()
        );
        // shared bundles (mpi-operator, efa plugin) are kept once by name
        for prerequisite in prerequisites {
            campaign = campaign.prerequisite(prerequisite);
        }
        for feature in features {
            campaign = campaign.feature(feature);
        }
    }
    Ok(campaign)
}

/// Manifests of the configured suites in apply order, prerequisites first.
///
/// Features sized from the cluster inventory are rendered against a nominal
/// two-node snapshot.
pub fn render(config: &CampaignConfig) -> Result<Vec<ManifestSet>> {
    let source = BundleSource::new(config.template_dir.clone());
    let mut sets: Vec<ManifestSet> = Vec::new();
    if config.namespace != DEFAULT_NAMESPACE {
        sets.push(prerequisites::namespace_manifest(&config.namespace)?);
    }
    for suite in &config.suites {
        let bundles = match suite {
            Suite::Efa => efa::bundles(config),
            Suite::Neuron => neuron::bundles(config),
            Suite::Nvidia => nvidia::bundles(config),
            Suite::Jobs
            | Suite::Disruptive
            | Suite::Dra
            | Suite::Workload
            | Suite::Netpol
            | Suite::Quick => Vec::new(),
        };
        for bundle in bundles {
            let set = bundle.render(&source)?;
            if sets.iter().all(|s| s.name != set.name) {
                sets.push(set);
            }
        }
        let features = match suite {
            Suite::Jobs => jobs::manifests(config)?,
            Suite::Disruptive => disruptive::manifests(config)?,
            Suite::Efa => efa::manifests(config, &nominal_gpu_snapshot(config, true))?,
            Suite::Dra => dra::manifests(config, &source)?,
            Suite::Neuron => neuron::manifests(config, &nominal_neuron_snapshot(config))?,
            Suite::Nvidia => {
                nvidia::manifests(config, &nominal_gpu_snapshot(config, config.efa.is_enabled()))?
            }
            Suite::Workload => workload::manifests(config)?,
            Suite::Netpol => netpol::manifests(config)?,
            Suite::Quick => quick::manifests(config)?,
        };
        sets.extend(features);
    }
    Ok(sets)
}

/// p5.48xlarge shape; `--node-type` replaces the instance type
pub fn nominal_gpu_snapshot(config: &CampaignConfig, efa: bool) -> HardwareSnapshot {
    let mut per_node = vec![(NVIDIA_GPU, 8)];
    if efa {
        per_node.push((EFA_INTERFACE, 32));
    }
    nominal_snapshot(config, NOMINAL_GPU_INSTANCE, &per_node)
}

/// trn1.32xlarge shape; `--node-type` replaces the instance type
pub fn nominal_neuron_snapshot(config: &CampaignConfig) -> HardwareSnapshot {
    let mut per_node = vec![(NEURON_DEVICE, 16), (NEURON_CORE, 32)];
    if config.efa.is_enabled() {
        per_node.push((EFA_INTERFACE, 8));
    }
    nominal_snapshot(config, NOMINAL_NEURON_INSTANCE, &per_node)
}

fn nominal_snapshot(
    config: &CampaignConfig,
    instance_type: &str,
    per_node: &[(&str, i64)],
) -> HardwareSnapshot {
    let per_node: BTreeMap<String, i64> = per_node
        .iter()
        .map(|(resource, count)| (resource.to_string(), *count))
        .collect();
    HardwareSnapshot {
        instance_type: config
            .node_type
            .clone()
            .unwrap_or_else(|| instance_type.to_string()),
        node_count: NOMINAL_NODES,
        nodes: (0..NOMINAL_NODES)
            .map(|i| NodeCapacity {
                name: format!("nominal-node-{i}"),
                capacity: per_node.clone(),
            })
            .collect(),
        totals: per_node
            .iter()
            .map(|(resource, count)| (resource.clone(), count * NOMINAL_NODES as i64))
            .collect(),
        per_node,
    }
}
