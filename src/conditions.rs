//! Reusable predicates over cluster objects.
//!
//! A predicate never talks to the API server itself; the wait engine fetches
//! the object and hands it over. A predicate answers with [`Verdict::Met`],
//! with [`Verdict::NotYet`] plus what it saw, or with an error. Transient
//! errors keep the wait going, anything else ends it.

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use kube::api::DynamicObject;
use serde_json::Value;
use std::fmt;

use crate::error::{Error, Result};
use crate::inventory::capacity_of;
use crate::schemaless::FieldPath;

/// Outcome of evaluating a predicate once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Met,
    /// Not satisfied yet; carries the observation for timeout reports
    NotYet(String),
}

impl Verdict {
    pub fn not_yet(observation: impl Into<String>) -> Self {
        Self::NotYet(observation.into())
    }

    pub fn is_met(&self) -> bool {
        matches!(self, Self::Met)
    }

    fn from_bool(met: bool, observation: impl FnOnce() -> String) -> Self {
        if met { Self::Met } else { Self::NotYet(observation()) }
    }
}

/// A check over one observed object
pub trait Predicate<T: ?Sized>: Send + Sync {
    fn check(&self, obj: &T) -> Result<Verdict>;
}

impl<T: ?Sized, F> Predicate<T> for F
where
    F: Fn(&T) -> Result<Verdict> + Send + Sync,
{
    fn check(&self, obj: &T) -> Result<Verdict> {
        self(obj)
    }
}

/// Pod lifecycle phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
        }
    }

    pub fn of(pod: &Pod) -> Option<Self> {
        match pod.status.as_ref()?.phase.as_deref()? {
            "Pending" => Some(PodPhase::Pending),
            "Running" => Some(PodPhase::Running),
            "Succeeded" => Some(PodPhase::Succeeded),
            "Failed" => Some(PodPhase::Failed),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Done when the pod reports the target phase.
///
/// A pod that settled in a different final phase can never reach the target,
/// which is reported as terminal.
pub fn pod_phase_is(target: PodPhase) -> impl Predicate<Pod> {
    move |pod: &Pod| {
        let observed = PodPhase::of(pod);
        match observed {
            Some(phase) if phase == target => Ok(Verdict::Met),
            Some(phase) if phase.is_final() => Err(Error::terminal(format!(
                "pod {} is {} and will never be {}",
                pod.name_any(),
                phase,
                target
            ))),
            Some(phase) => Ok(Verdict::not_yet(format!("pod {} is {}", pod.name_any(), phase))),
            None => Ok(Verdict::not_yet(format!(
                "pod {} has no phase yet",
                pod.name_any()
            ))),
        }
    }
}

/// Done when `status.succeeded >= spec.completions`; a `Failed=True` condition is terminal
pub fn job_succeeded() -> impl Predicate<Job> {
    |job: &Job| {
        let completions = job
            .spec
            .as_ref()
            .and_then(|s| s.completions)
            .unwrap_or(1);
        let status = job.status.as_ref();

        let failed = status
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .find(|c| c.type_ == "Failed" && c.status == "True");
        if let Some(condition) = failed {
            return Err(Error::terminal(format!(
                "job {} failed: {}",
                job.name_any(),
                condition
                    .message
                    .as_deref()
                    .or(condition.reason.as_deref())
                    .unwrap_or("no reason given")
            )));
        }

        let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
        Ok(Verdict::from_bool(succeeded >= completions, || {
            format!(
                "job {} succeeded {}/{} (active {}, failed {})",
                job.name_any(),
                succeeded,
                completions,
                status.and_then(|s| s.active).unwrap_or(0),
                status.and_then(|s| s.failed).unwrap_or(0)
            )
        }))
    }
}

/// Done when every scheduled pod is ready and none is unavailable
pub fn daemonset_ready() -> impl Predicate<DaemonSet> {
    |ds: &DaemonSet| {
        let Some(status) = ds.status.as_ref() else {
            return Ok(Verdict::not_yet(format!(
                "daemonset {} has no status yet",
                ds.name_any()
            )));
        };
        let unavailable = status.number_unavailable.unwrap_or(0);
        Ok(Verdict::from_bool(
            status.number_ready == status.desired_number_scheduled && unavailable == 0,
            || {
                format!(
                    "daemonset {} ready {}/{} (unavailable {})",
                    ds.name_any(),
                    status.number_ready,
                    status.desired_number_scheduled,
                    unavailable
                )
            },
        ))
    }
}

/// Done when the deployment reports `Available=True`
pub fn deployment_available() -> impl Predicate<Deployment> {
    |deployment: &Deployment| {
        let available = deployment
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .any(|c| c.type_ == "Available" && c.status == "True");
        Ok(Verdict::from_bool(available, || {
            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);
            format!("deployment {} not available (ready {ready})", deployment.name_any())
        }))
    }
}

/// Done when the node reports `Ready=True`
pub fn node_ready() -> impl Predicate<Node> {
    |node: &Node| {
        let ready = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .into_iter()
            .flatten()
            .find(|c| c.type_ == "Ready");
        match ready {
            Some(c) if c.status == "True" => Ok(Verdict::Met),
            Some(c) => Ok(Verdict::not_yet(format!(
                "node {} Ready={}",
                node.name_any(),
                c.status
            ))),
            None => Ok(Verdict::not_yet(format!(
                "node {} reports no Ready condition",
                node.name_any()
            ))),
        }
    }
}

/// `status.conditions[]` lookup on a schemaless object
#[derive(Debug, Clone)]
pub struct StatusCondition {
    type_: String,
    status: String,
    fail_on: Vec<String>,
}

/// Done when a condition of `type_` has `status`
pub fn custom_resource_status_has(
    type_: impl Into<String>,
    status: impl Into<String>,
) -> StatusCondition {
    StatusCondition {
        type_: type_.into(),
        status: status.into(),
        fail_on: Vec::new(),
    }
}

impl StatusCondition {
    /// Treat `<type_>=True` as a terminal failure
    pub fn failing_on(mut self, type_: impl Into<String>) -> Self {
        self.fail_on.push(type_.into());
        self
    }

    fn evaluate(&self, name: &str, conditions: Option<&Vec<Value>>) -> Result<Verdict> {
        let conditions = conditions.map(Vec::as_slice).unwrap_or_default();
        let status_of = |c: &Value| c.field_str("status").unwrap_or_default().to_string();

        for condition in conditions {
            let Some(type_) = condition.field_str("type") else {
                continue;
            };
            if self.fail_on.iter().any(|f| f == type_) && status_of(condition) == "True" {
                return Err(Error::terminal(format!(
                    "{name} reports {type_}: {}",
                    condition.field_str("message").unwrap_or("no message")
                )));
            }
        }

        let matching = conditions
            .iter()
            .find(|c| c.field_str("type") == Some(self.type_.as_str()));
        match matching {
            Some(c) if status_of(c) == self.status => Ok(Verdict::Met),
            Some(c) => Ok(Verdict::not_yet(format!(
                "{name} {}={}",
                self.type_,
                status_of(c)
            ))),
            None => Ok(Verdict::not_yet(format!(
                "{name} has no {} condition",
                self.type_
            ))),
        }
    }
}

impl Predicate<DynamicObject> for StatusCondition {
    fn check(&self, obj: &DynamicObject) -> Result<Verdict> {
        self.evaluate(&obj.name_any(), obj.field_array("status.conditions"))
    }
}

impl Predicate<Value> for StatusCondition {
    fn check(&self, obj: &Value) -> Result<Verdict> {
        let name = obj.field_str("metadata.name").unwrap_or("object");
        self.evaluate(name, obj.field_array("status.conditions"))
    }
}

/// Done when every listed node has a strictly positive capacity of `resource`
pub fn all_nodes_have_nonzero_capacity(resource: impl Into<String>) -> impl Predicate<[Node]> {
    let resource = resource.into();
    move |nodes: &[Node]| {
        if nodes.is_empty() {
            return Ok(Verdict::not_yet("no nodes listed"));
        }
        let lacking: Vec<String> = nodes
            .iter()
            .filter(|n| capacity_of(n, &resource).unwrap_or(0) <= 0)
            .map(|n| n.name_any())
            .collect();
        Ok(Verdict::from_bool(lacking.is_empty(), || {
            format!(
                "{}/{} nodes lack {}: {}",
                lacking.len(),
                nodes.len(),
                resource,
                lacking.join(", ")
            )
        }))
    }
}

/// Done when `matches` returns true on the latest observation
pub fn resource_match<T, F>(description: impl Into<String>, matches: F) -> impl Predicate<T>
where
    T: ?Sized,
    F: Fn(&T) -> bool + Send + Sync,
{
    let description = description.into();
    move |obj: &T| {
        Ok(Verdict::from_bool(matches(obj), || {
            format!("{description} not matched")
        }))
    }
}

/// Done once the object can no longer be fetched
pub fn resource_deleted<T>() -> impl Predicate<Option<T>> {
    |obj: &Option<T>| {
        Ok(Verdict::from_bool(obj.is_none(), || {
            "object still present".to_string()
        }))
    }
}

/// Done when gathered logs contain `needle`
pub fn logs_contain(needle: impl Into<String>) -> impl Predicate<str> {
    let needle = needle.into();
    move |logs: &str| {
        Ok(Verdict::from_bool(logs.contains(&needle), || {
            format!("logs ({} bytes) do not contain {:?}", logs.len(), needle)
        }))
    }
}

/// Met when every predicate is met; the first unmet or failing one answers
pub fn all_of<T: ?Sized + 'static>(predicates: Vec<Box<dyn Predicate<T>>>) -> impl Predicate<T> {
    move |obj: &T| {
        for predicate in &predicates {
            if let Verdict::NotYet(observation) = predicate.check(obj)? {
                return Ok(Verdict::NotYet(observation));
            }
        }
        Ok(Verdict::Met)
    }
}

/// Met when any predicate is met; observations of the others are joined
pub fn any_of<T: ?Sized + 'static>(predicates: Vec<Box<dyn Predicate<T>>>) -> impl Predicate<T> {
    move |obj: &T| {
        let mut observations = Vec::new();
        for predicate in &predicates {
            match predicate.check(obj)? {
                Verdict::Met => return Ok(Verdict::Met),
                Verdict::NotYet(observation) => observations.push(observation),
            }
        }
        Ok(Verdict::NotYet(observations.join("; ")))
    }
}

/// Inverts a predicate; errors pass through unchanged
pub fn not<T: ?Sized, P: Predicate<T>>(predicate: P) -> impl Predicate<T> {
    move |obj: &T| match predicate.check(obj)? {
        Verdict::Met => Ok(Verdict::not_yet("negated condition holds")),
        Verdict::NotYet(_) => Ok(Verdict::Met),
    }
}

/// Chaining combinators for any predicate
pub trait PredicateExt<T: ?Sized>: Predicate<T> + Sized {
    fn and<P: Predicate<T>>(self, other: P) -> impl Predicate<T> {
        move |obj: &T| match self.check(obj)? {
            Verdict::Met => other.check(obj),
            not_yet => Ok(not_yet),
        }
    }

    fn or<P: Predicate<T>>(self, other: P) -> impl Predicate<T> {
        move |obj: &T| match self.check(obj)? {
            Verdict::Met => Ok(Verdict::Met),
            Verdict::NotYet(first) => match other.check(obj)? {
                Verdict::Met => Ok(Verdict::Met),
                Verdict::NotYet(second) => Ok(Verdict::NotYet(format!("{first}; {second}"))),
            },
        }
    }
}

impl<T: ?Sized, P: Predicate<T>> PredicateExt<T> for P {}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DaemonSetStatus;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{NodeStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn pod(phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pingpong-server".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn job(completions: i32, succeeded: i32, failed_condition: bool) -> Job {
        let conditions = failed_condition.then(|| {
            vec![JobCondition {
                type_: "Failed".to_string(),
                status: "True".to_string(),
                reason: Some("BackoffLimitExceeded".to_string()),
                ..Default::default()
            }]
        });
        Job {
            metadata: ObjectMeta {
                name: Some("job-pi".to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                completions: Some(completions),
                ..Default::default()
            }),
            status: Some(JobStatus {
                succeeded: Some(succeeded),
                conditions,
                ..Default::default()
            }),
        }
    }

    fn node(name: &str, capacity: &[(&str, &str)]) -> Node {
        let capacity: BTreeMap<String, Quantity> = capacity
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect();
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                capacity: Some(capacity),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_phase_is() {
        let running = pod_phase_is(PodPhase::Running);
        assert!(running.check(&pod("Running")).unwrap().is_met());
        assert_eq!(
            running.check(&pod("Pending")).unwrap(),
            Verdict::not_yet("pod pingpong-server is Pending")
        );
        let err = running.check(&pod("Failed")).unwrap_err();
        assert!(!err.is_transient());

        assert!(pod_phase_is(PodPhase::Failed).check(&pod("Failed")).unwrap().is_met());
    }

    #[test]
    fn test_job_succeeded_holds_iff_succeeded_reaches_completions() {
        let predicate = job_succeeded();
        assert!(predicate.check(&job(1000, 1000, false)).unwrap().is_met());
        assert!(predicate.check(&job(1000, 1001, false)).unwrap().is_met());
        assert_eq!(
            predicate.check(&job(1000, 999, false)).unwrap(),
            Verdict::not_yet("job job-pi succeeded 999/1000 (active 0, failed 0)")
        );
    }

    #[test]
    fn test_job_failed_condition_is_terminal() {
        let err = job_succeeded().check(&job(10, 3, true)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ClusterTerminal);
        assert!(err.to_string().contains("BackoffLimitExceeded"));
    }

    #[test]
    fn test_daemonset_ready() {
        let ds = |ready, desired, unavailable| DaemonSet {
            metadata: ObjectMeta {
                name: Some("neuron-device-plugin-daemonset".to_string()),
                ..Default::default()
            },
            status: Some(DaemonSetStatus {
                number_ready: ready,
                desired_number_scheduled: desired,
                number_unavailable: unavailable,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(daemonset_ready().check(&ds(3, 3, None)).unwrap().is_met());
        assert!(!daemonset_ready().check(&ds(2, 3, Some(1))).unwrap().is_met());
        assert!(!daemonset_ready().check(&ds(3, 3, Some(1))).unwrap().is_met());
        assert!(!daemonset_ready().check(&DaemonSet::default()).unwrap().is_met());
    }

    #[test]
    fn test_custom_resource_status_has() {
        let mpijob = json!({
            "metadata": {"name": "multi-node-all-reduce-perf"},
            "status": {"conditions": [
                {"type": "Created", "status": "True"},
                {"type": "Running", "status": "False"},
            ]}
        });
        assert!(custom_resource_status_has("Created", "True")
            .check(&mpijob)
            .unwrap()
            .is_met());
        assert_eq!(
            custom_resource_status_has("Running", "True")
                .check(&mpijob)
                .unwrap(),
            Verdict::not_yet("multi-node-all-reduce-perf Running=False")
        );
        assert!(!custom_resource_status_has("Succeeded", "True")
            .check(&json!({"metadata": {"name": "x"}}))
            .unwrap()
            .is_met());
    }

    #[test]
    fn test_custom_resource_failure_is_terminal() {
        let failed = json!({
            "metadata": {"name": "neuron-multi-node"},
            "status": {"conditions": [{"type": "Failed", "status": "True", "message": "launcher failed"}]}
        });
        let err = custom_resource_status_has("Succeeded", "True")
            .failing_on("Failed")
            .check(&failed)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "terminal cluster error: neuron-multi-node reports Failed: launcher failed"
        );
    }

    #[test]
    fn test_all_nodes_have_nonzero_capacity() {
        let predicate = all_nodes_have_nonzero_capacity("aws.amazon.com/neuroncore");
        let nodes = vec![
            node("a", &[("aws.amazon.com/neuroncore", "32")]),
            node("b", &[("aws.amazon.com/neuroncore", "32")]),
        ];
        assert!(predicate.check(&nodes).unwrap().is_met());

        let nodes = vec![
            node("a", &[("aws.amazon.com/neuroncore", "32")]),
            node("b", &[("aws.amazon.com/neuroncore", "0")]),
            node("c", &[]),
        ];
        assert_eq!(
            predicate.check(&nodes).unwrap(),
            Verdict::not_yet("2/3 nodes lack aws.amazon.com/neuroncore: b, c")
        );
        assert!(!predicate.check(&[]).unwrap().is_met());
    }

    #[test]
    fn test_resource_deleted_and_match() {
        assert!(resource_deleted::<Pod>().check(&None).unwrap().is_met());
        assert!(!resource_deleted().check(&Some(pod("Running"))).unwrap().is_met());

        let named = resource_match("pod name", |p: &Pod| p.name_any() == "pingpong-server");
        assert!(named.check(&pod("Running")).unwrap().is_met());
    }

    #[test]
    fn test_logs_contain() {
        let logs = "DRA_RESOURCE_DRIVER_NAME=\"gpu.example.com\"\nGPU_DEVICE_0=gpu-0\n";
        assert!(logs_contain("DRA_RESOURCE_DRIVER_NAME=\"gpu.example.com\"")
            .check(logs)
            .unwrap()
            .is_met());
        assert!(!logs_contain("GPU_DEVICE_1").check(logs).unwrap().is_met());
    }

    #[test]
    fn test_combinators() {
        let running: Box<dyn Predicate<Pod>> = Box::new(pod_phase_is(PodPhase::Running));
        let named: Box<dyn Predicate<Pod>> =
            Box::new(resource_match("named", |p: &Pod| p.name_any() == "other"));

        let both = all_of(vec![running, named]);
        assert_eq!(
            both.check(&pod("Running")).unwrap(),
            Verdict::not_yet("named not matched")
        );

        let succeeded: Box<dyn Predicate<Pod>> = Box::new(pod_phase_is(PodPhase::Succeeded));
        let running: Box<dyn Predicate<Pod>> = Box::new(pod_phase_is(PodPhase::Running));
        let either = any_of(vec![succeeded, running]);
        assert!(either.check(&pod("Running")).unwrap().is_met());

        assert!(not(pod_phase_is(PodPhase::Pending))
            .check(&pod("Running"))
            .unwrap()
            .is_met());

        let chained = pod_phase_is(PodPhase::Running)
            .and(resource_match("named", |p: &Pod| p.name_any() == "pingpong-server"));
        assert!(chained.check(&pod("Running")).unwrap().is_met());

        let fallback = pod_phase_is(PodPhase::Pending).or(pod_phase_is(PodPhase::Running));
        assert!(fallback.check(&pod("Running")).unwrap().is_met());
    }

    #[test]
    fn test_errors_short_circuit_combinators() {
        let failed_pod = pod("Failed");
        let either = pod_phase_is(PodPhase::Running).or(pod_phase_is(PodPhase::Failed));
        // the first operand already failed terminally
        assert!(either.check(&failed_pod).is_err());
    }
}
