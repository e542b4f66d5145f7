//! NVIDIA GPUs: the pytorch smoke MPIJob, nccl-tests collectives across
//! nodes, BERT training and BERT inference.

use tracing::info;

use super::GPU_HARDWARE;
use super::prerequisites::{self, BundleInstall};
use super::steps::{
    deploy, deploy_step, job_logs_step, launcher_logs, report_training, wait_job_succeeded,
    wait_mpijob_succeeded,
};
use crate::campaign::{Feature, Prerequisite, Step};
use crate::conditions::Verdict;
use crate::config::{CampaignConfig, require_image};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::inventory::{HardwareSnapshot, InventoryRequest, minimum_on_any_node};
use crate::logs;
use crate::manifest::ManifestSet;
use crate::models::{Accelerator, EFA_INTERFACE, NVIDIA_GPU};
use crate::workloads::Workload;
use crate::workloads::bert::{self, BertInference, BertTraining};
use crate::workloads::mpi_job::MpiJob;
use crate::workloads::nccl::{self, NcclMultiNode, check_gdrdma, supports_rdma_read};

pub const SUITE: &str = "nvidia";
pub const HARDWARE: &str = "gpu";

const NCCL_IMAGE_FLAG: &str = "--nvidia-test-image";
const PYTORCH_IMAGE_FLAG: &str = "--pytorch-image";
const TRAINING_IMAGE_FLAG: &str = "--bert-training-image";
const INFERENCE_IMAGE_FLAG: &str = "--bert-inference-image";

/// Bundles installed before any nvidia feature, in install order
pub fn bundles(config: &CampaignConfig) -> Vec<BundleInstall> {
    let mut bundles = vec![prerequisites::mpi_operator()];
    if config.device_plugin.should_install() {
        bundles.push(prerequisites::nvidia_device_plugin());
        if config.efa.is_enabled() {
            bundles.push(prerequisites::efa_device_plugin());
        }
    }
    if config.observability_enabled() {
        bundles.push(prerequisites::dcgm_exporter());
        bundles.push(prerequisites::cloudwatch_agent(&config.metric_dimensions));
    }
    bundles
}

pub fn prerequisites(config: &CampaignConfig) -> Vec<Prerequisite> {
    let mut prerequisites: Vec<Prerequisite> = bundles(config)
        .into_iter()
        .map(BundleInstall::prerequisite)
        .collect();
    prerequisites.push(prerequisites::inventory(
        "gpu-inventory",
        GPU_HARDWARE,
        inventory_request(config),
    ));
    prerequisites
}

pub fn inventory_request(config: &CampaignConfig) -> InventoryRequest {
    let request = InventoryRequest::new(config.node_type.clone())
        .require(NVIDIA_GPU)
        .uniform();
    if config.efa.is_enabled() {
        request.require(EFA_INTERFACE)
    } else {
        request
    }
}

/// nccl features run always, BERT features only when their image is configured
pub fn features(config: &CampaignConfig) -> Vec<Feature> {
    let mut features = vec![single_node()];
    features.extend(config.nccl_tests.iter().map(|test| multi_node(test)));
    if config.images.bert_training.is_some() {
        features.push(bert_training());
    }
    if config.images.bert_inference.is_some() {
        features.push(bert_inference());
    }
    features
}

pub fn manifests(config: &CampaignConfig, snapshot: &HardwareSnapshot) -> Result<Vec<ManifestSet>> {
    let ns = &config.namespace;
    let pytorch = require_image(&config.images.pytorch, PYTORCH_IMAGE_FLAG)?;
    let nccl_image = require_image(&config.images.nvidia_test, NCCL_IMAGE_FLAG)?;
    let mut sets = vec![nccl::pytorch_single_node(ns, &pytorch, snapshot.per_node(NVIDIA_GPU)).manifests()?];
    for test in &config.nccl_tests {
        sets.push(NcclMultiNode::new(test, ns, &nccl_image, snapshot).manifests()?);
    }
    if let Some(image) = &config.images.bert_training {
        sets.push(BertTraining::new(Accelerator::Gpu, ns, image, snapshot).mpijob().manifests()?);
    }
    if let Some(image) = &config.images.bert_inference {
        let inference = inference_for(config, image, &snapshot.instance_type);
        sets.push(inference.job().manifests()?);
    }
    Ok(sets)
}

fn feature(name: impl Into<String>) -> Feature {
    Feature::new(name).label("suite", SUITE).label("hardware", HARDWARE)
}

fn single_node_job(ctx: &Context) -> Result<MpiJob> {
    let image = require_image(&ctx.config().images.pytorch, PYTORCH_IMAGE_FLAG)?;
    let snapshot = ctx.require(GPU_HARDWARE)?;
    Ok(nccl::pytorch_single_node(ctx.namespace(), &image, snapshot.per_node(NVIDIA_GPU)))
}

fn single_node() -> Feature {
    feature("nccl-single-node")
        .setup(deploy_step("create mpijob", single_node_job))
        .assess(Step::new("mpijob succeeds", |ctx| async move {
            wait_mpijob_succeeded(&ctx, &single_node_job(&ctx)?).await?;
            Ok(ctx)
        }))
        .teardown(Step::new("collect logs", |ctx| async move {
            launcher_logs(&ctx, &single_node_job(&ctx)?).await?;
            Ok(ctx)
        }))
}

fn nccl_job(ctx: &Context, test: &str) -> Result<NcclMultiNode> {
    let image = require_image(&ctx.config().images.nvidia_test, NCCL_IMAGE_FLAG)?;
    let snapshot = ctx.require(GPU_HARDWARE)?;
    Ok(NcclMultiNode::new(test, ctx.namespace(), &image, &snapshot))
}

fn multi_node(test: &str) -> Feature {
    let setup_test = test.to_string();
    let assess_test = test.to_string();
    feature(format!("nccl-multi-node-{test}"))
        .label("test", test)
        .setup(deploy_step("create mpijob", move |ctx| nccl_job(ctx, &setup_test)))
        .assess(Step::new("mpijob succeeds", move |ctx| async move {
            let nccl = nccl_job(&ctx, &assess_test)?;
            let job = nccl.mpijob();
            let outcome = wait_mpijob_succeeded(&ctx, &job).await;
            let output = launcher_logs(&ctx, &job).await?;
            outcome?;
            if nccl.efa_per_node > 0 && supports_rdma_read(&nccl.instance_type) {
                check_gdrdma(&output, &nccl.instance_type)?;
                info!("GPUDirect RDMA used on {}", nccl.instance_type);
            }
            Ok(ctx)
        }))
}

fn training(ctx: &Context) -> Result<BertTraining> {
    let image = require_image(&ctx.config().images.bert_training, TRAINING_IMAGE_FLAG)?;
    let snapshot = ctx.require(GPU_HARDWARE)?;
    Ok(BertTraining::new(Accelerator::Gpu, ctx.namespace(), &image, &snapshot))
}

fn bert_training() -> Feature {
    feature("nvidia-bert-training")
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
        .assess(Step::new("training completes", |ctx| async move {
            let job = training(&ctx)?.mpijob();
            let outcome = wait_mpijob_succeeded(&ctx, &job).await;
            let output = launcher_logs(&ctx, &job).await?;
            outcome?;
            report_training(Accelerator::Gpu, &output);
            Ok(ctx)
        }))
}

fn inference_for(config: &CampaignConfig, image: &str, node_type: &str) -> BertInference {
    BertInference::gpu(
        &config.namespace,
        image,
        config.inference_mode,
        node_type,
        config.gpu_requested.max(1),
    )
}

fn bert_inference() -> Feature {
    feature("nvidia-bert-inference")
        .setup(Step::new("enough gpus on one node", |ctx| async move {
            let wanted = ctx.config().gpu_requested.max(1);
            let nodes = ctx.client()?.list_nodes().await?;
            if let Verdict::NotYet(observation) = minimum_on_any_node(&nodes, NVIDIA_GPU, wanted) {
                return Err(Error::assertion(format!(
                    "no node has >= {wanted} GPU(s): {observation}"
                )));
            }
            Ok(ctx)
        }))
        .setup(deploy_step("create job", |ctx| {
            let image = require_image(&ctx.config().images.bert_inference, INFERENCE_IMAGE_FLAG)?;
            let snapshot = ctx.require(GPU_HARDWARE)?;
            Ok(inference_for(ctx.config(), &image, &snapshot.instance_type).job())
        }))
        .assess(Step::new("job succeeds", |ctx| async move {
            let name = bert::inference_job_name(Accelerator::Gpu);
            wait_job_succeeded(&ctx, name, bert::INFERENCE_TIMEOUT).await?;
            let output = logs::collect_job_logs(ctx.client()?, ctx.namespace(), name).await;
            let throughput =
                logs::scan_for_metric(&output, &logs::PROCESS_THROUGHPUT, logs::VALUE_GROUP);
            crate::results::summarize(bert::THROUGHPUT, bert::unit_of(bert::THROUGHPUT), &throughput);
            Ok(ctx)
        }))
        .teardown(job_logs_step(bert::inference_job_name(Accelerator::Gpu)))
}
