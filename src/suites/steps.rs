//! Building blocks shared by the suite definitions.

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::batch::v1::Job;
use kube::Resource;
use kube::api::DynamicObject;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{info, warn};

use crate::campaign::Step;
use crate::conditions::{Predicate, job_succeeded, resource_deleted};
use crate::context::{Context, TeardownAction};
use crate::error::{Error, Result};
use crate::logs;
use crate::manifest::{self, ManifestSet};
use crate::models::Accelerator;
use crate::results::aggregate;
use crate::wait;
use crate::workloads::Workload;
use crate::workloads::bert::{training_samples, unit_of};
use crate::workloads::mpi_job::{self, MpiJob, mpijob_succeeded};

/// Apply a workload and queue its deletion for the feature's teardown
pub async fn deploy(ctx: &Context, workload: &dyn Workload) -> Result<ManifestSet> {
    let set = workload.manifests()?;
    let client = ctx.client()?;
    // registered before applying: a partial apply is reaped as well
    ctx.register_teardown(TeardownAction::DeleteManifest(set.clone()))
        .await;
    let applied = manifest::apply(client, &set).await?;
    info!(
        "Applied {} ({} object(s), expected to take up to {:?})",
        workload.name(),
        applied.len(),
        workload.expected_duration()
    );
    Ok(set)
}

/// Setup step deploying whatever `build` returns for the step's context
pub fn deploy_step<W, F>(name: impl Into<String>, build: F) -> Step
where
    W: Workload + 'static,
    F: FnOnce(&Context) -> Result<W> + Send + 'static,
{
    Step::new(name, move |ctx| async move {
        let workload = build(&ctx)?;
        deploy(&ctx, &workload).await?;
        Ok(ctx)
    })
}

/// Poll a namespaced object until `predicate` holds; returns the last observation
pub async fn wait_for<K, P>(
    ctx: &Context,
    name: &str,
    timeout: Duration,
    predicate: &P,
) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
    P: Predicate<K> + ?Sized,
{
    let client = ctx.client()?;
    let namespace = ctx.namespace();
    let api = client.namespaced::<K>(namespace);
    let what = format!("{} {}/{}", K::kind(&()), namespace, name);
    wait::for_object(&what, &ctx.wait_options(timeout), || client.get(&api, name), predicate).await
}

/// Same as [`wait_for`] for objects outside the campaign namespace
pub async fn wait_for_in<K, P>(
    ctx: &Context,
    namespace: &str,
    name: &str,
    timeout: Duration,
    predicate: &P,
) -> Result<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
    P: Predicate<K> + ?Sized,
{
    let client = ctx.client()?;
    let api = client.namespaced::<K>(namespace);
    let what = format!("{} {}/{}", K::kind(&()), namespace, name);
    wait::for_object(&what, &ctx.wait_options(timeout), || client.get(&api, name), predicate).await
}

/// Wait until the object can no longer be fetched
pub async fn wait_deleted<K>(ctx: &Context, name: &str, timeout: Duration) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync,
{
    let client = ctx.client()?;
    let namespace = ctx.namespace();
    let api = client.namespaced::<K>(namespace);
    let what = format!("deletion of {} {}/{}", K::kind(&()), namespace, name);
    wait::for_object(
        &what,
        &ctx.wait_options(timeout),
        || client.get_opt(&api, name),
        &resource_deleted::<K>(),
    )
    .await?;
    Ok(())
}

pub async fn wait_job_succeeded(ctx: &Context, name: &str, timeout: Duration) -> Result<Job> {
    info!("Waiting for job {} to complete", name);
    let job = wait_for::<Job, _>(ctx, name, timeout, &job_succeeded()).await?;
    info!("Job {} completed", name);
    Ok(job)
}

/// Wait for the operator to report the MPIJob succeeded
pub async fn wait_mpijob_succeeded(ctx: &Context, job: &MpiJob) -> Result<DynamicObject> {
    let client = ctx.client()?;
    let handle = job.handle();
    let predicate = mpijob_succeeded();
    info!("Waiting for MPIJob {} to complete", job.name);
    let fetch = || {
        let client = client.clone();
        let handle = handle.clone();
        async move {
            client
                .get_dynamic(&handle)
                .await?
                .ok_or_else(|| Error::not_found(mpi_job::KIND, &handle.name))
        }
    };
    let done = wait::for_object(
        &handle.to_string(),
        &ctx.wait_options(job.timeout),
        fetch,
        &predicate,
    )
    .await?;
    info!("MPIJob {} completed", job.name);
    Ok(done)
}

/// Log the launcher output of an MPIJob and hand it back for assertions
pub async fn launcher_logs(ctx: &Context, job: &MpiJob) -> Result<String> {
    let output =
        logs::collect_mpijob_launcher_logs(ctx.client()?, ctx.namespace(), &job.name).await;
    info!("Test log for {}:", job.name);
    logs::emit(&output);
    Ok(output)
}

/// Teardown step emitting the logs of a Job's pods
pub fn job_logs_step(job: impl Into<String>) -> Step {
    let job = job.into();
    Step::new("collect logs", move |ctx| async move {
        let output = logs::collect_job_logs(ctx.client()?, ctx.namespace(), &job).await;
        info!("Test log for {}:", job);
        logs::emit(&output);
        Ok(ctx)
    })
}

/// Log the average of every training metric found in `logs`
pub fn report_training(accelerator: Accelerator, logs: &str) {
    let samples = training_samples(accelerator, logs);
    if samples.is_empty() {
        warn!("No training metrics found in the launcher logs");
        return;
    }
    for (metric, summary) in aggregate(&samples) {
        info!("{}", summary.average_line(&metric, unit_of(&metric)));
        info!("{} samples: {}", metric, summary.count);
    }
}
