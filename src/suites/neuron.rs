//! Trainium and Inferentia: device capacity, single and multi node device
//! checks, BERT training and BERT inference.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::prerequisites::{self, BundleInstall};
use super::steps::{
    deploy, deploy_step, job_logs_step, launcher_logs, report_training, wait_for,
    wait_job_succeeded, wait_mpijob_succeeded,
};
use super::NEURON_HARDWARE;
use crate::campaign::{Feature, Prerequisite, Step};
use crate::conditions::{Predicate, all_nodes_have_nonzero_capacity, resource_match};
use crate::config::{CampaignConfig, require_image};
use crate::context::{Context, Key};
use crate::error::Result;
use crate::inventory::{HardwareSnapshot, InventoryRequest, instance_type_of};
use crate::logs;
use crate::manifest::ManifestSet;
use crate::models::{Accelerator, EFA_INTERFACE, NEURON_CORE, NEURON_DEVICE};
use crate::results::summarize;
use crate::wait;
use crate::workloads::Workload;
use crate::workloads::bert::{
    self, BertInference, BertTraining, LAUNCHER_CREATED_TIMEOUT, unit_of,
};
use crate::workloads::neuron::{self as neuron_jobs, NeuronShape};

pub const SUITE: &str = "neuron";
pub const HARDWARE: &str = "neuron";

/// Device plugins publish capacity shortly after their pods start
pub const CAPACITY_TIMEOUT: Duration = Duration::from_secs(60);

const TEST_IMAGE_FLAG: &str = "--neuron-test-image";
const TRAINING_IMAGE_FLAG: &str = "--bert-training-image";
const INFERENCE_IMAGE_FLAG: &str = "--bert-inference-image";

const INFERENCE_STARTED: Key<Instant> = Key::new("neuron.inference_started");

/// Bundles installed before any neuron feature, in install order
pub fn bundles(config: &CampaignConfig) -> Vec<BundleInstall> {
    let mut bundles = vec![prerequisites::mpi_operator()];
    if config.device_plugin.should_install() {
        bundles.push(prerequisites::neuron_device_plugin());
        if config.efa.is_enabled() {
            bundles.push(prerequisites::efa_device_plugin());
        }
    }
    bundles
}

pub fn prerequisites(config: &CampaignConfig) -> Vec<Prerequisite> {
    let mut prerequisites: Vec<Prerequisite> = bundles(config)
        .into_iter()
        .map(BundleInstall::prerequisite)
        .collect();
    prerequisites.push(prerequisites::inventory(
        "neuron-inventory",
        NEURON_HARDWARE,
        inventory_request(config),
    ));
    prerequisites
}

pub fn inventory_request(config: &CampaignConfig) -> InventoryRequest {
    let request = InventoryRequest::new(config.node_type.clone())
        .require(NEURON_DEVICE)
        .require(NEURON_CORE)
        .uniform();
    if config.efa.is_enabled() {
        request.require(EFA_INTERFACE)
    } else {
        request
    }
}

/// BERT features join only when their image is configured
pub fn features(config: &CampaignConfig) -> Vec<Feature> {
    let mut features = vec![capacity(), single_node(), multi_node()];
    if config.images.bert_training.is_some() {
        features.push(bert_training());
    }
    if config.images.bert_inference.is_some() {
        features.push(bert_inference());
    }
    features
}

pub fn manifests(config: &CampaignConfig, snapshot: &HardwareSnapshot) -> Result<Vec<ManifestSet>> {
    let shape = NeuronShape::of(snapshot);
    let test_image = require_image(&config.images.neuron_test, TEST_IMAGE_FLAG)?;
    let mut sets = vec![
        neuron_jobs::single_node(&config.namespace, &test_image, shape).manifests()?,
        neuron_jobs::nccom_multi_node(&config.namespace, &test_image, shape).manifests()?,
    ];
    if let Some(image) = &config.images.bert_training {
        let training = BertTraining::new(Accelerator::Neuron, &config.namespace, image, snapshot);
        sets.push(training.mpijob().manifests()?);
    }
    if let Some(image) = &config.images.bert_inference {
        sets.push(
            BertInference::neuron(&config.namespace, image, config.inference_mode, snapshot)
                .job()
                .manifests()?,
        );
    }
    Ok(sets)
}

fn feature(name: &str) -> Feature {
    Feature::new(name).label("suite", SUITE).label("hardware", HARDWARE)
}

fn shape(ctx: &Context) -> Result<NeuronShape> {
    Ok(NeuronShape::of(&*ctx.require(NEURON_HARDWARE)?))
}

/// Every node of the probed instance type advertises neuron cores
fn capacity() -> Feature {
    feature("neuron-capacity").assess(Step::new("all nodes have neuron cores", |ctx| async move {
        let snapshot = ctx.require(NEURON_HARDWARE)?;
        let client = ctx.client()?;
        let instance_type = snapshot.instance_type.clone();
        let fetch = || {
            let client = client.clone();
            let instance_type = instance_type.clone();
            async move {
                let nodes = client.list_nodes().await?;
                Ok::<_, crate::error::Error>(
                    nodes
                        .into_iter()
                        .filter(|n| instance_type_of(n) == Some(instance_type.as_str()))
                        .collect::<Vec<Node>>(),
                )
            }
        };
        let has_cores = all_nodes_have_nonzero_capacity(NEURON_CORE);
        let check = |nodes: &Vec<Node>| has_cores.check(nodes.as_slice());
        let nodes = wait::for_object(
            &format!("{NEURON_CORE} on every {instance_type} node"),
            &ctx.wait_options(CAPACITY_TIMEOUT),
            fetch,
            &check,
        )
        .await?;
        info!("{} {} node(s) advertise {}", nodes.len(), instance_type, NEURON_CORE);
        Ok(ctx)
    }))
}

fn single_node() -> Feature {
    feature("neuron-single-node")
        .setup(deploy_step("create job", |ctx| {
            let image = require_image(&ctx.config().images.neuron_test, TEST_IMAGE_FLAG)?;
            Ok(neuron_jobs::single_node(ctx.namespace(), &image, shape(ctx)?))
        }))
        .assess(Step::new("job succeeds", |ctx| async move {
            wait_job_succeeded(&ctx, neuron_jobs::SINGLE_NODE_JOB_NAME, neuron_jobs::SINGLE_NODE_TIMEOUT)
                .await?;
            Ok(ctx)
        }))
        .teardown(job_logs_step(neuron_jobs::SINGLE_NODE_JOB_NAME))
}

fn multi_node() -> Feature {
    feature("neuron-multi-node")
        .setup(deploy_step("create mpijob", |ctx| {
            let image = require_image(&ctx.config().images.neuron_test, TEST_IMAGE_FLAG)?;
            Ok(neuron_jobs::nccom_multi_node(ctx.namespace(), &image, shape(ctx)?))
        }))
        .assess(Step::new("mpijob succeeds", |ctx| async move {
            let image = require_image(&ctx.config().images.neuron_test, TEST_IMAGE_FLAG)?;
            let job = neuron_jobs::nccom_multi_node(ctx.namespace(), &image, shape(&ctx)?);
            let outcome = wait_mpijob_succeeded(&ctx, &job).await;
            launcher_logs(&ctx, &job).await?;
            outcome?;
            Ok(ctx)
        }))
}

fn training(ctx: &Context) -> Result<BertTraining> {
    let image = require_image(&ctx.config().images.bert_training, TRAINING_IMAGE_FLAG)?;
    let snapshot = ctx.require(NEURON_HARDWARE)?;
    Ok(BertTraining::new(Accelerator::Neuron, ctx.namespace(), &image, &snapshot))
}

fn bert_training() -> Feature {
    feature("neuron-bert-training")
        .setup(Step::new("create mpijob", |ctx| async move {
            let training = training(&ctx)?;
            info!(
                "Training across {} node(s), {} rank(s)",
                training.node_count,
                training.ranks()
            );
            deploy(&ctx, &training.mpijob()).await?;
            Ok(ctx)
        }))
        .assess(
            Step::new("launcher job created", |ctx| async move {
                let launcher = training(&ctx)?.mpijob().launcher_job_name();
                let exists = resource_match("launcher job exists", |_: &Job| true);
                wait_for::<Job, _>(&ctx, &launcher, LAUNCHER_CREATED_TIMEOUT, &exists).await?;
                Ok(ctx)
            })
            .abort_on_failure(),
        )
        .assess(Step::new("training completes", |ctx| async move {
            let job = training(&ctx)?.mpijob();
            let launcher = job.launcher_job_name();
            wait_job_succeeded(&ctx, &launcher, job.timeout).await?;

            let output = logs::collect_job_logs(ctx.client()?, ctx.namespace(), &launcher).await;
            logs::emit(&output);
            report_training(Accelerator::Neuron, &output);
            Ok(ctx)
        }))
}

fn inference(ctx: &Context) -> Result<BertInference> {
    let image = require_image(&ctx.config().images.bert_inference, INFERENCE_IMAGE_FLAG)?;
    let snapshot = ctx.require(NEURON_HARDWARE)?;
    Ok(BertInference::neuron(
        ctx.namespace(),
        &image,
        ctx.config().inference_mode,
        &snapshot,
    ))
}

fn bert_inference() -> Feature {
    feature("neuron-bert-inference")
        .setup(Step::new("create job", |ctx| async move {
            let inference = inference(&ctx)?;
            info!("Running inference in {} mode", inference.mode);
            deploy(&ctx, &inference.job()).await?;
            Ok(ctx.with_value(INFERENCE_STARTED, Instant::now()))
        }))
        .assess(Step::new("job succeeds", |ctx| async move {
            let name = bert::inference_job_name(Accelerator::Neuron);
            wait_job_succeeded(&ctx, name, bert::INFERENCE_TIMEOUT).await?;
            if let Some(started) = ctx.value(INFERENCE_STARTED) {
                info!("Inference finished after {:?}", started.elapsed());
            }
            let output = logs::collect_job_logs(ctx.client()?, ctx.namespace(), name).await;
            let throughput =
                logs::scan_for_metric(&output, &logs::RANK_THROUGHPUT, logs::VALUE_GROUP);
            summarize(bert::THROUGHPUT, unit_of(bert::THROUGHPUT), &throughput);
            Ok(ctx)
        }))
        .teardown(job_logs_step(bert::inference_job_name(Accelerator::Neuron)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot() -> HardwareSnapshot {
        let per_node = BTreeMap::from([
            (NEURON_DEVICE.to_string(), 16),
            (NEURON_CORE.to_string(), 32),
            (EFA_INTERFACE.to_string(), 8),
        ]);
        HardwareSnapshot {
            instance_type: "trn1.32xlarge".to_string(),
            node_count: 2,
            nodes: Vec::new(),
            totals: per_node.iter().map(|(k, v)| (k.clone(), v * 2)).collect(),
            per_node,
        }
    }

    #[test]
    fn test_features_are_labeled() {
        let mut config = CampaignConfig::default();
        assert_eq!(features(&config).len(), 3);
        config.images.bert_training = Some("bert-train:latest".to_string());
        config.images.bert_inference = Some("bert-infer:latest".to_string());
        let features = features(&config);
        let names: Vec<&str> = features.iter().map(Feature::name).collect();
        assert_eq!(
            names,
            vec![
                "neuron-capacity",
                "neuron-single-node",
                "neuron-multi-node",
                "neuron-bert-training",
                "neuron-bert-inference",
            ]
        );
        for feature in &features {
            assert_eq!(feature.labels()["suite"], "neuron");
            assert_eq!(feature.labels()["hardware"], "neuron");
        }
    }

    #[test]
    fn test_prerequisites_follow_flags() {
        let mut config = CampaignConfig::default();
        let names = |config: &CampaignConfig| -> Vec<String> {
            prerequisites(config).iter().map(|p| p.name().to_string()).collect()
        };
        assert_eq!(names(&config), vec!["mpi-operator", "neuron-device-plugin", "neuron-inventory"]);

        config.efa = true.into();
        assert_eq!(
            names(&config),
            vec!["mpi-operator", "neuron-device-plugin", "efa-device-plugin", "neuron-inventory"]
        );

        config.device_plugin = false.into();
        assert_eq!(names(&config), vec!["mpi-operator", "neuron-inventory"]);
    }

    #[test]
    fn test_render_skips_unset_bert_images() {
        let mut config = CampaignConfig::default();
        config.images.neuron_test = Some("neuron-test:latest".to_string());
        let sets = manifests(&config, &snapshot()).unwrap();
        let names: Vec<&str> = sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["neuronx-single-node", "multi-node-nccom-test"]);

        config.images.bert_training = Some("bert-train:latest".to_string());
        config.images.bert_inference = Some("bert-infer:latest".to_string());
        let sets = manifests(&config, &snapshot()).unwrap();
        assert_eq!(sets.len(), 4);
        assert!(sets[3].rendered.contains("INFERENCE_MODE"));
    }
}
