//! Node shutdown features: a rebooted node must stop its pods gracefully and
//! come back schedulable, and a terminated node must honour the kubelet's
//! graceful shutdown period.
//!
//! Instances are rebooted and terminated outside the cluster through an
//! [`InstanceAction`]; the shipped one runs the `--reboot-command` or
//! `--terminate-command` template as a subprocess.

use futures::FutureExt;
use futures::future::{self, BoxFuture, Either};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::steps::{deploy, wait_for};
use crate::campaign::{Feature, Step};
use crate::client::{ClusterClient, ExecOutput};
use crate::conditions::{PodPhase, Verdict, pod_phase_is};
use crate::config::CampaignConfig;
use crate::context::{Context, Key};
use crate::error::{Error, Result};
use crate::logs;
use crate::manifest::ManifestSet;
use crate::wait;
use crate::workloads::Workload;
use crate::workloads::heartbeat_pod::{self, HeartbeatPod, count_marker};
use crate::workloads::sleep_pod::{self, SleepPod};

pub const SUITE: &str = "disruptive";
pub const FEATURE_NAME: &str = "graceful-reboot";
pub const SHUTDOWN_FEATURE_NAME: &str = "kubelet-graceful-shutdown";
pub const INSTANCE_ID_PLACEHOLDER: &str = "{instance_id}";

pub const CANARY_RUNNING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const KUBELET_DOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const BOOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// How long the canary may keep running once the reboot went out
pub const CANARY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const REBOOT_STEP_DEADLINE: Duration = Duration::from_secs(10 * 60);
/// Lead time for the exec session to attach before the reboot goes out
const EXEC_ATTACH_DELAY: Duration = Duration::from_secs(2);

pub const HEARTBEAT_RUNNING_TIMEOUT: Duration = Duration::from_secs(2 * 60);
pub const HEARTBEAT_STARTED_TIMEOUT: Duration = Duration::from_secs(60);
pub const TERMINATE_STEP_DEADLINE: Duration = Duration::from_secs(5 * 60);
pub const SIGTERM_TIMEOUT: Duration = Duration::from_secs(60);
const SIGTERM_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Window over which heartbeats after SIGTERM are counted
pub const HEARTBEAT_WINDOW: Duration = Duration::from_secs(2 * 60);
const HEARTBEAT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// One heartbeat a second for most of the window
pub const MIN_HEARTBEATS_AFTER_SIGTERM: usize = 110;

const CANARY: Key<String> = Key::new("disruptive.canary");
const TARGET_NODE: Key<String> = Key::new("disruptive.node");
const REBOOTED_AT: Key<Instant> = Key::new("disruptive.rebooted_at");
const HEARTBEAT: Key<String> = Key::new("disruptive.heartbeat");

/// Reboots or terminates the instance backing a node
pub trait InstanceAction: Send + Sync {
    fn run<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Runs a command line with the instance id substituted
#[derive(Debug, Clone)]
pub struct InstanceCommand {
    verb: &'static str,
    template: String,
}

impl InstanceCommand {
    pub fn new(verb: &'static str, template: impl Into<String>) -> Self {
        Self {
            verb,
            template: template.into(),
        }
    }

    pub fn reboot(template: impl Into<String>) -> Self {
        Self::new("reboot", template)
    }

    pub fn terminate(template: impl Into<String>) -> Self {
        Self::new("terminate", template)
    }

    pub fn command_line(&self, instance_id: &str) -> Vec<String> {
        self.template
            .split_whitespace()
            .map(|word| word.replace(INSTANCE_ID_PLACEHOLDER, instance_id))
            .collect()
    }

    async fn execute(&self, instance_id: &str) -> Result<()> {
        let argv = self.command_line(instance_id);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::config(format!("--{}-command is empty", self.verb)))?;
        info!("Issuing {} of {}: {}", self.verb, instance_id, argv.join(" "));
        let output = Command::new(program).args(args).output().await?;
        if !output.status.success() {
            return Err(Error::terminal(format!(
                "{} command exited with {}: {}",
                self.verb,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(
            "{} command output: {}",
            self.verb,
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }
}

impl InstanceAction for InstanceCommand {
    fn run<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Result<()>> {
        self.execute(instance_id).boxed()
    }
}

/// Instance id from a provider id such as `aws:///us-west-2a/i-0abc`
pub fn instance_id_from_provider(provider_id: &str) -> Option<&str> {
    provider_id
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
}

async fn instance_id_of(client: &ClusterClient, node_name: &str) -> Result<String> {
    let node: Node = client.get(&client.cluster(), node_name).await?;
    let provider = node
        .spec
        .as_ref()
        .and_then(|s| s.provider_id.as_deref())
        .ok_or_else(|| Error::assertion(format!("node {node_name} has no provider id")))?;
    let instance_id = instance_id_from_provider(provider)
        .ok_or_else(|| Error::assertion(format!("malformed provider id {provider}")))?;
    Ok(instance_id.to_string())
}

/// Run `action` against `instance_id` while `exec` holds a session open in
/// the canary.
///
/// The outer result fails when the action fails, when the session ends
/// before the action went out, or when the canary outlives
/// `shutdown_timeout` after it. The inner result is the session's own
/// outcome, judged by [`classify_canary_exit`].
pub async fn reboot_during_exec<E>(
    action: &dyn InstanceAction,
    instance_id: &str,
    canary: &str,
    exec: E,
    shutdown_timeout: Duration,
) -> Result<Result<ExecOutput>>
where
    E: Future<Output = Result<ExecOutput>>,
{
    tokio::pin!(exec);
    tokio::select! {
        output = &mut exec => {
            let outcome = match output {
                Ok(output) => format!("exit code {:?}", output.exit_code),
                Err(e) => e.to_string(),
            };
            return Err(Error::assertion(format!(
                "exec in {canary} ended before the reboot was issued: {outcome}"
            )));
        }
        _ = tokio::time::sleep(EXEC_ATTACH_DELAY) => {}
    }

    let output = match future::select(action.run(instance_id), exec).await {
        Either::Left((rebooted, exec)) => {
            rebooted?;
            tokio::time::timeout(shutdown_timeout, exec).await.map_err(|_| {
                Error::assertion(format!(
                    "pod {canary} was still running {shutdown_timeout:?} after the reboot"
                ))
            })?
        }
        Either::Right((output, reboot)) => {
            reboot.await?;
            output
        }
    };
    Ok(output)
}

/// Judge how the canary's exec session ended after a successful reboot.
///
/// SIGTERM (143) is the expected exit. A session cut by the node going
/// down, with or without a status, also passes. Only an explicit other exit
/// code fails.
pub fn classify_canary_exit(canary: &str, exec: Result<ExecOutput>) -> Result<()> {
    match exec {
        Ok(output) if output.terminated_by_sigterm() => {
            info!("Pod {} was terminated gracefully", canary);
            Ok(())
        }
        Ok(ExecOutput { exit_code: None, .. }) => {
            info!("Exec session in {} was cut by the shutdown without a status", canary);
            Ok(())
        }
        Ok(ExecOutput { exit_code: Some(code), .. }) => Err(Error::assertion(format!(
            "pod {canary} was not terminated by SIGTERM during shutdown (exit code {code})"
        ))),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            info!("Exec session in {} ended with the node: {}", canary, e);
            Ok(())
        }
    }
}

pub fn features(config: &CampaignConfig) -> Vec<Feature> {
    vec![
        graceful_reboot(Arc::new(InstanceCommand::reboot(&config.reboot_command))),
        kubelet_graceful_shutdown(Arc::new(InstanceCommand::terminate(&config.terminate_command))),
    ]
}

pub fn manifests(config: &CampaignConfig) -> Result<Vec<ManifestSet>> {
    Ok(vec![
        SleepPod::termination_canary(&config.namespace, &config.images.sleep).manifests()?,
        HeartbeatPod::new(&config.namespace, &config.images.sleep).manifests()?,
    ])
}

pub fn graceful_reboot(rebooter: Arc<dyn InstanceAction>) -> Feature {
    Feature::new(FEATURE_NAME)
        .label("suite", SUITE)
        .setup(Step::new("create canary pod", |ctx| async move {
            let canary = SleepPod::termination_canary(ctx.namespace(), &ctx.config().images.sleep);
            deploy(&ctx, &canary).await?;
            Ok(ctx.with_value(CANARY, canary.name))
        }))
        .assess(canary_running().abort_on_failure())
        .assess(
            reboot_instance(rebooter)
                .with_deadline(REBOOT_STEP_DEADLINE)
                .abort_on_failure(),
        )
        .assess(kubelet_unreachable().abort_on_failure())
        .assess(node_schedulable())
}

fn canary_running() -> Step {
    Step::new("canary pod running", |ctx| async move {
        let canary = ctx.require(CANARY)?;
        info!("Waiting for pod {} to be running", canary);
        let node = running_on(&ctx, &canary, CANARY_RUNNING_TIMEOUT).await?;
        Ok(ctx.with_value(TARGET_NODE, node))
    })
}

async fn running_on(ctx: &Context, pod_name: &str, timeout: Duration) -> Result<String> {
    let pod = wait_for::<Pod, _>(ctx, pod_name, timeout, &pod_phase_is(PodPhase::Running)).await?;
    let node = pod
        .spec
        .and_then(|s| s.node_name)
        .ok_or_else(|| Error::assertion(format!("pod {pod_name} is running but not bound to a node")))?;
    info!("Pod {} is running on node {}", pod_name, node);
    Ok(node)
}

fn reboot_instance(rebooter: Arc<dyn InstanceAction>) -> Step {
    Step::new("reboot instance", move |ctx| async move {
        let canary = ctx.require(CANARY)?;
        let node_name = ctx.require(TARGET_NODE)?;
        let client = ctx.client()?;
        let instance_id = instance_id_of(client, &node_name).await?;

        // the exec session ends when the kubelet stops the canary
        let exec = client.exec(
            ctx.namespace(),
            &canary,
            sleep_pod::CONTAINER_NAME,
            vec!["sleep".to_string(), "infinity".to_string()],
        );
        let exec = reboot_during_exec(
            rebooter.as_ref(),
            &instance_id,
            &canary,
            exec,
            CANARY_SHUTDOWN_TIMEOUT,
        )
        .await?;
        let rebooted_at = Instant::now();
        classify_canary_exit(&canary, exec)?;
        Ok(ctx.with_value(REBOOTED_AT, rebooted_at))
    })
}

fn kubelet_unreachable() -> Step {
    Step::new("kubelet unreachable", |ctx| async move {
        let node = ctx.require(TARGET_NODE)?;
        let client = ctx.client()?;
        info!("Waiting for the kubelet on {} to stop answering", node);
        wait::until(
            &format!("kubelet on {node} to go down"),
            &ctx.wait_options(KUBELET_DOWN_TIMEOUT),
            || async {
                Ok(match client.node_healthz(&node).await {
                    Ok(body) => Verdict::not_yet(format!("healthz answered {:?}", body.trim())),
                    Err(e) => {
                        debug!("healthz of {} failed: {}", node, e);
                        Verdict::Met
                    }
                })
            },
        )
        .await?;
        info!("Node {} is down", node);
        Ok(ctx)
    })
}

fn node_schedulable() -> Step {
    Step::new("node schedulable again", |ctx| async move {
        let node = ctx.require(TARGET_NODE)?;
        let boot = SleepPod::boot_detection(ctx.namespace(), &ctx.config().images.sleep, &node);
        deploy(&ctx, &boot).await?;
        info!("Waiting up to {:?} for pod {} on {}", BOOT_TIMEOUT, boot.name, node);
        wait_for::<Pod, _>(&ctx, &boot.name, BOOT_TIMEOUT, &pod_phase_is(PodPhase::Running)).await?;
        match ctx.value(REBOOTED_AT) {
            Some(at) => info!("Node {} became ready and schedulable within {:?}", node, at.elapsed()),
            None => warn!("Node {} is schedulable but the reboot time was not recorded", node),
        }
        Ok(ctx)
    })
}

/// The kubelet must deliver SIGTERM on instance termination and let the pod
/// run through its grace period.
pub fn kubelet_graceful_shutdown(terminator: Arc<dyn InstanceAction>) -> Feature {
    Feature::new(SHUTDOWN_FEATURE_NAME)
        .label("suite", SUITE)
        .setup(Step::new("create heartbeat pod", |ctx| async move {
            let pod = HeartbeatPod::new(ctx.namespace(), &ctx.config().images.sleep);
            deploy(&ctx, &pod).await?;
            Ok(ctx.with_value(HEARTBEAT, pod.name))
        }))
        .assess(heartbeat_started().abort_on_failure())
        .assess(
            terminate_instance(terminator)
                .with_deadline(TERMINATE_STEP_DEADLINE)
                .abort_on_failure(),
        )
        .assess(sigterm_delivered().abort_on_failure())
        .assess(heartbeats_through_grace_period())
        .teardown(Step::new("dump heartbeat logs", |ctx| async move {
            let Some(pod) = ctx.value(HEARTBEAT) else {
                return Ok(ctx);
            };
            match ctx
                .client()?
                .logs(ctx.namespace(), &pod, Some(heartbeat_pod::CONTAINER_NAME))
                .await
            {
                Ok(logs) => logs::emit(&logs),
                Err(e) => warn!("Could not fetch logs of {}: {}", pod, e),
            }
            Ok(ctx)
        }))
}

async fn heartbeat_logs(client: &ClusterClient, namespace: &str, pod: &str) -> Result<String> {
    client
        .logs(namespace, pod, Some(heartbeat_pod::CONTAINER_NAME))
        .await
}

/// Wait until the pod's logs contain `marker`
async fn wait_for_marker(
    ctx: &Context,
    pod: &str,
    marker: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let client = ctx.client()?;
    let namespace = ctx.namespace();
    wait::until(
        &format!("{marker} in logs of {pod}"),
        &ctx.wait_options(timeout).with_interval(interval),
        || async {
            Ok(match heartbeat_logs(client, namespace, pod).await {
                Ok(logs) if logs.contains(marker) => Verdict::Met,
                Ok(logs) => Verdict::not_yet(format!("{} line(s) logged", logs.lines().count())),
                Err(e) => Verdict::not_yet(format!("logs unavailable: {e}")),
            })
        },
    )
    .await
}

fn heartbeat_started() -> Step {
    Step::new("heartbeat pod running", |ctx| async move {
        let pod = ctx.require(HEARTBEAT)?;
        info!("Waiting for pod {} to be running", pod);
        let node = running_on(&ctx, &pod, HEARTBEAT_RUNNING_TIMEOUT).await?;
        wait_for_marker(
            &ctx,
            &pod,
            heartbeat_pod::STARTED_MARKER,
            HEARTBEAT_STARTED_TIMEOUT,
            SIGTERM_POLL_INTERVAL,
        )
        .await?;
        Ok(ctx.with_value(TARGET_NODE, node))
    })
}

fn terminate_instance(terminator: Arc<dyn InstanceAction>) -> Step {
    Step::new("terminate instance", move |ctx| async move {
        let node = ctx.require(TARGET_NODE)?;
        let instance_id = instance_id_of(ctx.client()?, &node).await?;
        terminator.run(&instance_id).await?;
        info!("Termination of {} ({}) issued", node, instance_id);
        Ok(ctx)
    })
}

fn sigterm_delivered() -> Step {
    Step::new("SIGTERM delivered", |ctx| async move {
        let pod = ctx.require(HEARTBEAT)?;
        wait_for_marker(
            &ctx,
            &pod,
            heartbeat_pod::SIGTERM_MARKER,
            SIGTERM_TIMEOUT,
            SIGTERM_POLL_INTERVAL,
        )
        .await?;
        info!("Pod {} received SIGTERM", pod);
        Ok(ctx)
    })
}

fn heartbeats_through_grace_period() -> Step {
    Step::new("heartbeats through grace period", |ctx| async move {
        let pod = ctx.require(HEARTBEAT)?;
        let client = ctx.client()?;
        let until = Instant::now() + HEARTBEAT_WINDOW;
        let mut most = 0;
        loop {
            match heartbeat_logs(client, ctx.namespace(), &pod).await {
                Ok(logs) => most = most.max(count_marker(&logs, heartbeat_pod::AFTER_SIGTERM_MARKER)),
                // logs vanish with the node; the best count so far stands
                Err(e) => debug!("Logs of {} unavailable: {}", pod, e),
            }
            if Instant::now() >= until {
                break;
            }
            tokio::time::sleep(HEARTBEAT_POLL_INTERVAL).await;
        }
        check_heartbeats(&pod, most)?;
        Ok(ctx)
    })
}

/// Pass when enough heartbeats were logged after SIGTERM
pub fn check_heartbeats(pod: &str, heartbeats: usize) -> Result<()> {
    if heartbeats < MIN_HEARTBEATS_AFTER_SIGTERM {
        return Err(Error::assertion(format!(
            "pod {pod} logged {heartbeats} heartbeat(s) after SIGTERM, expected at least {MIN_HEARTBEATS_AFTER_SIGTERM}"
        )));
    }
    info!("Pod {} logged {} heartbeat(s) after SIGTERM", pod, heartbeats);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::Phase;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAction {
        fails: bool,
        calls: AtomicUsize,
    }

    impl StubAction {
        fn new(fails: bool) -> Self {
            Self {
                fails,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl InstanceAction for StubAction {
        fn run<'a>(&'a self, _instance_id: &'a str) -> BoxFuture<'a, Result<()>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fails = self.fails;
            async move {
                if fails {
                    Err(Error::terminal("reboot command exited with exit status: 255"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        }
    }

    fn exited(code: Option<i32>) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            ..Default::default()
        }
    }

    #[test]
    fn test_instance_id_from_provider() {
        assert_eq!(
            instance_id_from_provider("aws:///us-west-2a/i-0123456789abcdef0"),
            Some("i-0123456789abcdef0")
        );
        assert_eq!(instance_id_from_provider("i-0abc"), Some("i-0abc"));
        assert_eq!(instance_id_from_provider("aws:///us-west-2a/"), None);
        assert_eq!(instance_id_from_provider(""), None);
    }

    #[test]
    fn test_command_line_substitutes_instance_id() {
        let rebooter = InstanceCommand::reboot("aws ec2 reboot-instances --instance-ids {instance_id}");
        assert_eq!(
            rebooter.command_line("i-0abc"),
            vec!["aws", "ec2", "reboot-instances", "--instance-ids", "i-0abc"]
        );
    }

    #[tokio::test]
    async fn test_failing_reboot_command_is_terminal() {
        let rebooter = InstanceCommand::reboot("false {instance_id}");
        let err = rebooter.run("i-0abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterTerminal);
        assert!(err.to_string().contains("reboot command exited"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reboot_does_not_wait_for_the_canary() {
        let rebooter = StubAction::new(true);
        let exec = futures::future::pending::<Result<ExecOutput>>();
        let err = reboot_during_exec(&rebooter, "i-0abc", "canary", exec, CANARY_SHUTDOWN_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ClusterTerminal);
        assert_eq!(rebooter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canary_outliving_the_reboot_fails() {
        let rebooter = StubAction::new(false);
        let started = Instant::now();
        let exec = futures::future::pending::<Result<ExecOutput>>();
        let err = reboot_during_exec(&rebooter, "i-0abc", "canary", exec, CANARY_SHUTDOWN_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Assertion);
        assert!(started.elapsed() >= CANARY_SHUTDOWN_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_ending_before_reboot_skips_the_reboot() {
        let rebooter = StubAction::new(false);
        let exec = async { Err::<ExecOutput, _>(Error::not_found("Pod", "canary")) };
        let err = reboot_during_exec(&rebooter, "i-0abc", "canary", exec, CANARY_SHUTDOWN_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Assertion);
        assert_eq!(rebooter.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_canary_stopped_by_reboot_returns_its_exit() {
        let rebooter = StubAction::new(false);
        let exec = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(exited(Some(143)))
        };
        let exec = reboot_during_exec(&rebooter, "i-0abc", "canary", exec, CANARY_SHUTDOWN_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(exec.unwrap().exit_code, Some(143));
    }

    #[test]
    fn test_classify_canary_exit() {
        assert!(classify_canary_exit("canary", Ok(exited(Some(143)))).is_ok());
        assert!(classify_canary_exit("canary", Ok(exited(None))).is_ok());
        assert!(
            classify_canary_exit(
                "canary",
                Err(Error::transient("exec session in canary ended abnormally"))
            )
            .is_ok()
        );
        assert!(
            classify_canary_exit(
                "canary",
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset).into())
            )
            .is_ok()
        );

        let err = classify_canary_exit("canary", Ok(exited(Some(137)))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "assertion failed: pod canary was not terminated by SIGTERM during shutdown (exit code 137)"
        );
        let err = classify_canary_exit("canary", Err(Error::cancelled("interrupted"))).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_check_heartbeats() {
        assert!(check_heartbeats("graceful-shutdown-test-1", 120).is_ok());
        assert!(check_heartbeats("graceful-shutdown-test-1", MIN_HEARTBEATS_AFTER_SIGTERM).is_ok());
        let err = check_heartbeats("graceful-shutdown-test-1", 12).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Assertion);
    }

    #[test]
    fn test_feature_outline() {
        let features = features(&CampaignConfig::default());
        let names: Vec<&str> = features.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["graceful-reboot", "kubelet-graceful-shutdown"]);
        assert_eq!(
            features[0].outline(),
            vec![
                (Phase::Setup, "create canary pod"),
                (Phase::Assess, "canary pod running"),
                (Phase::Assess, "reboot instance"),
                (Phase::Assess, "kubelet unreachable"),
                (Phase::Assess, "node schedulable again"),
            ]
        );
        assert_eq!(
            features[1].outline(),
            vec![
                (Phase::Setup, "create heartbeat pod"),
                (Phase::Assess, "heartbeat pod running"),
                (Phase::Assess, "terminate instance"),
                (Phase::Assess, "SIGTERM delivered"),
                (Phase::Assess, "heartbeats through grace period"),
                (Phase::Teardown, "dump heartbeat logs"),
            ]
        );
    }
}
