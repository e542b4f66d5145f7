//! Pod log collection, following and metric scraping.
//!
//! Collection is best-effort: a pod whose logs cannot be read is reported
//! and left out, never failing the step that asked for the logs.

use futures::TryStreamExt;
use futures::io::AsyncBufReadExt;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kube::api::{ListParams, LogParams};
use once_cell::sync::Lazy;
use owo_colors::OwoColorize;
use regex::Regex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClusterClient;
use crate::conditions::PodPhase;
use crate::results::Sample;

/// Label the Job controller puts on its pods
pub const JOB_NAME_LABEL: &str = "job-name";
/// Labels the MPI operator puts on launcher and worker pods
pub const MPI_JOB_NAME_LABEL: &str = "training.kubeflow.org/job-name";
pub const MPI_JOB_ROLE_LABEL: &str = "training.kubeflow.org/job-role";

/// How often a followed stream is reopened before giving up
pub const MAX_REOPENS: usize = 5;
const REOPEN_DELAY: Duration = Duration::from_secs(2);

pub const VALUE_GROUP: &str = "value";
pub const RANK_GROUP: &str = "rank";

/// `[Rank 3] ... local_throughput = 123.4 samples/s`
pub static RANK_THROUGHPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[Rank\s+(?P<rank>\d+)\].+local_throughput\s*=\s*(?P<value>[\d\.]+)\s+samples/s")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// `[Rank 3] ... local_avg_epoch_time = 12.3s`
pub static RANK_EPOCH_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[Rank\s+(?P<rank>\d+)\].+local_avg_epoch_time\s*=\s*(?P<value>[\d\.]+)s")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// `Process 3 - Throughput: 123.4 samples/second`, printed by the pytorch trainer
pub static PROCESS_THROUGHPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Process\s+(?P<rank>\d+)\s+-\s+Throughput:\s+(?P<value>[\d\.]+)\s+samples/second")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// Header emitted before each container's logs
pub fn log_header(pod: &str, node: &str, container: &str) -> String {
    format!("==> pod {pod} (node {node}) container {container} <==")
}

fn container_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// Concatenated logs of every container of every pod matching `selector`
pub async fn collect_pod_logs(client: &ClusterClient, namespace: &str, selector: &str) -> String {
    let pods = client.pods(namespace);
    let mut listed = match client
        .list(&pods, &ListParams::default().labels(selector))
        .await
    {
        Ok(listed) => listed,
        Err(e) => {
            warn!("Failed to list pods for {} in {}: {}", selector, namespace, e);
            return String::new();
        }
    };
    listed.sort_by_key(|p| p.name_any());
    if listed.is_empty() {
        warn!("No pods match {} in {}", selector, namespace);
    }

    let mut collected = String::new();
    for pod in &listed {
        let name = pod.name_any();
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .unwrap_or("<unscheduled>");
        for container in container_names(pod) {
            match client.logs(namespace, &name, Some(&container)).await {
                Ok(text) => {
                    collected.push_str(&log_header(&name, node, &container));
                    collected.push('\n');
                    collected.push_str(&text);
                    if !text.ends_with('\n') {
                        collected.push('\n');
                    }
                }
                Err(e) => warn!("Failed to read logs of {}/{}[{}]: {}", namespace, name, container, e),
            }
        }
    }
    collected
}

/// Logs of the pods a Job created
pub async fn collect_job_logs(client: &ClusterClient, namespace: &str, job: &str) -> String {
    collect_pod_logs(client, namespace, &format!("{JOB_NAME_LABEL}={job}")).await
}

/// Logs of an MPIJob's launcher pod
pub async fn collect_mpijob_launcher_logs(
    client: &ClusterClient,
    namespace: &str,
    mpijob: &str,
) -> String {
    let selector = format!("{MPI_JOB_NAME_LABEL}={mpijob},{MPI_JOB_ROLE_LABEL}=launcher");
    collect_pod_logs(client, namespace, &selector).await
}

/// Log collected text one line at a time, the way diagnostics are emitted
pub fn emit(logs: &str) {
    for line in logs.lines() {
        info!("{}", line);
    }
}

/// Pod name rendered in one of six rotating colors
pub fn colorize(pod: &str, index: usize) -> String {
    match index % 6 {
        0 => pod.cyan().to_string(),
        1 => pod.yellow().to_string(),
        2 => pod.green().to_string(),
        3 => pod.magenta().to_string(),
        4 => pod.blue().to_string(),
        _ => pod.bright_cyan().to_string(),
    }
}

/// Stream a pod's logs to stderr until the pod finishes or `cancel` fires.
///
/// An interrupted stream is reopened with `sinceSeconds` covering the gap,
/// at most [`MAX_REOPENS`] times.
pub async fn follow_pod_logs(
    client: ClusterClient,
    namespace: String,
    pod: String,
    color: usize,
    cancel: CancellationToken,
) {
    let pods = client.pods(&namespace);
    let prefix = colorize(&pod, color);
    let mut last_line: Option<Instant> = None;
    let mut reopens = 0;

    loop {
        let params = LogParams {
            follow: true,
            since_seconds: last_line.map(|t| t.elapsed().as_secs() as i64 + 1),
            ..Default::default()
        };
        match pods.log_stream(&pod, &params).await {
            Ok(stream) => {
                let mut lines = stream.lines();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        line = lines.try_next() => match line {
                            Ok(Some(line)) => {
                                eprintln!("[{}] {}", prefix, line);
                                last_line = Some(Instant::now());
                            }
                            Ok(None) => break,
                            Err(e) => {
                                debug!("Log stream of {} interrupted: {}", pod, e);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => debug!("Could not stream logs from {}: {}", pod, e),
        }

        match client.get_opt(&pods, &pod).await {
            Ok(None) => return,
            Ok(Some(p)) if PodPhase::of(&p).is_some_and(|phase| phase.is_final()) => return,
            _ => {}
        }
        reopens += 1;
        if reopens > MAX_REOPENS {
            warn!("Giving up following logs of {} after {} reopenings", pod, MAX_REOPENS);
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(REOPEN_DELAY) => {}
        }
    }
}

/// Follow several pods at once, each with its own color
pub fn spawn_followers(
    client: &ClusterClient,
    namespace: &str,
    pods: Vec<String>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let tasks: Vec<_> = pods
        .into_iter()
        .enumerate()
        .map(|(color, pod)| {
            let task = tokio::spawn(follow_pod_logs(
                client.clone(),
                namespace.to_string(),
                pod.clone(),
                color,
                cancel.clone(),
            ));
            (pod, task)
        })
        .collect();
    tokio::spawn(async move {
        join_followers(tasks).await;
    })
}

/// Await every follower; returns how many of them panicked or were aborted
pub async fn join_followers(tasks: Vec<(String, tokio::task::JoinHandle<()>)>) -> usize {
    let mut failed = 0;
    for (pod, task) in tasks {
        if let Err(e) = task.await {
            warn!("Log follower of {} stopped abnormally: {}", pod, e);
            failed += 1;
        }
    }
    failed
}

/// Floats captured by `value_group` on every matching line
pub fn scan_for_metric(logs: &str, regex: &Regex, value_group: &str) -> Vec<f64> {
    let clean = strip_ansi_escapes::strip_str(logs);
    clean
        .lines()
        .filter_map(|line| regex.captures(line))
        .filter_map(|caps| caps.name(value_group)?.as_str().parse().ok())
        .collect()
}

/// Samples with ranks from a regex exposing `rank` and `value` groups
pub fn scan_samples(logs: &str, metric: &str, regex: &Regex) -> Vec<Sample> {
    let clean = strip_ansi_escapes::strip_str(logs);
    clean
        .lines()
        .filter_map(|line| regex.captures(line))
        .filter_map(|caps| {
            let value = caps.name(VALUE_GROUP)?.as_str().parse().ok()?;
            let rank = caps.name(RANK_GROUP).and_then(|r| r.as_str().parse().ok());
            Some(Sample::new(metric, rank, value))
        })
        .collect()
}
