use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use argus::campaign::{EXIT_FAILURE, Outcome, Phase};
use argus::config::CampaignConfig;
use argus::context::Context;
use argus::models::Suite;
use argus::selection::Selector;
use argus::suites;

fn every_image(mut config: CampaignConfig) -> CampaignConfig {
    config.images.nvidia_test = Some("nccl-tests:latest".to_string());
    config.images.neuron_test = Some("neuron-tests:latest".to_string());
    config.images.pytorch = Some("pytorch:latest".to_string());
    config.images.bert_training = Some("bert-train:latest".to_string());
    config.images.bert_inference = Some("bert-infer:latest".to_string());
    config.images.ping_pong = Some("efa-tests:latest".to_string());
    config.images.workload = Some("smoke:latest".to_string());
    config
}

#[test]
fn test_render_every_suite() -> Result<()> {
    let mut config = every_image(CampaignConfig::default());
    config.namespace = "e2e".to_string();
    config.efa = true.into();
    config.suites = vec![
        Suite::Jobs,
        Suite::Disruptive,
        Suite::Efa,
        Suite::Dra,
        Suite::Neuron,
        Suite::Nvidia,
        Suite::Workload,
        Suite::Netpol,
        Suite::Quick,
    ];
    let sets = suites::render(&config)?;
    let names: Vec<&str> = sets.iter().map(|s| s.name.as_str()).collect();

    assert_eq!(names[0], "namespace-e2e");
    // the efa plugin is shared by three suites and rendered once
    assert_eq!(names.iter().filter(|n| **n == "efa-device-plugin").count(), 1);
    assert_eq!(names.iter().filter(|n| **n == "mpi-operator").count(), 1);
    for expected in [
        "cronjob-echo",
        "pingpong",
        "dra-example-driver",
        "neuron-training",
        "neuron-inference",
        "multi-node-all-reduce-perf",
        "bert-training",
        "bert-inference",
        "workload",
        "netpol-b-server",
        "block-c-to-a",
        "npm-install-test",
    ] {
        assert!(names.contains(&expected), "{expected} missing from {names:?}");
    }

    let position = |name: &str| names.iter().position(|n| *n == name).unwrap();
    assert!(position("neuron-device-plugin") < position("neuron-training"));
    assert!(position("nvidia-device-plugin") < position("multi-node-all-reduce-perf"));

    // workloads land in the campaign namespace
    let nccl = &sets[position("multi-node-all-reduce-perf")];
    for document in nccl.documents() {
        assert_eq!(document.handle.namespace.as_deref(), Some("e2e"));
    }
    Ok(())
}

#[test]
fn test_selection_by_labels() -> Result<()> {
    let mut config = every_image(CampaignConfig::default());
    config.suites = vec![Suite::Neuron, Suite::Nvidia];
    config.selection.labels = [("hardware".to_string(), "neuron".to_string())].into();
    config.selection.skip_feature = Some("bert".to_string());
    let selector = Selector::new(&config.selection)?;
    let campaign = suites::campaign(&config)?.select(&selector)?;
    let names: Vec<&str> = campaign.features().iter().map(|f| f.name()).collect();
    assert_eq!(
        names,
        vec!["neuron-capacity", "neuron-single-node", "neuron-multi-node"]
    );
    // selection never drops prerequisites
    assert!(campaign.prerequisites().iter().any(|p| p.name() == "gpu-inventory"));
    Ok(())
}

#[tokio::test]
async fn test_campaign_without_cluster_fails_every_feature() -> Result<()> {
    let config = CampaignConfig::default();
    let campaign = suites::campaign(&config)?;
    let ctx = Context::new(None, Arc::new(config), CancellationToken::new());
    let report = campaign.run(ctx, CancellationToken::new()).await;

    assert_eq!(report.exit_code(), EXIT_FAILURE);
    assert_eq!(report.count(Outcome::Failed), 3);
    for feature in &report.features {
        let failure = &feature.failures[0];
        assert_eq!(failure.phase, Phase::Setup);
        assert_eq!(failure.kind, "config");
    }
    // the pi job's log collection still ran and only warned
    let pi = report.features.iter().find(|f| f.name == "job-pi").unwrap();
    assert_eq!(pi.failures.len(), 1);
    assert!(!pi.warnings.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_netpol_features_skip_when_servers_cannot_start() -> Result<()> {
    let mut config = CampaignConfig::default();
    config.suites = vec![Suite::Netpol];
    let campaign = suites::campaign(&config)?;
    let ctx = Context::new(None, Arc::new(config), CancellationToken::new());
    let report = campaign.run(ctx, CancellationToken::new()).await;

    assert_eq!(report.exit_code(), EXIT_FAILURE);
    assert_eq!(report.prerequisite_failures.len(), 1);
    assert_eq!(report.prerequisite_failures[0].kind, "config");
    let skipped: Vec<&str> = report
        .features
        .iter()
        .filter(|f| f.outcome == Outcome::Skipped)
        .map(|f| f.name.as_str())
        .collect();
    assert_eq!(skipped, vec!["netpol-allow-all", "netpol-block-c-to-a"]);
    Ok(())
}
