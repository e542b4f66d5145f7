//! NetworkPolicy enforcement between three tenant namespaces.
//!
//! Every tenant reaches every other while no policy exists. Once
//! `block-c-to-a` is in place, tenant a still reaches b but c no longer
//! reaches a.

use k8s_openapi::api::apps::v1::Deployment;
use kube::api::ListParams;
use std::time::Duration;
use tracing::info;

use super::prerequisites::READY_TIMEOUT;
use super::steps::{deploy, wait_for_in};
use crate::campaign::{Feature, Prerequisite, Step};
use crate::client::ClusterClient;
use crate::conditions::{PodPhase, deployment_available};
use crate::config::CampaignConfig;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::manifest::{self, ManifestSet};
use crate::workloads::Workload;
use crate::workloads::netpol::{self, BlockCToA, TenantServer, curl_command, http_ok};

pub const SUITE: &str = "netpol";
pub const SERVERS: &str = "netpol-servers";
pub const ALLOW_ALL: &str = "netpol-allow-all";
pub const BLOCK_C_TO_A: &str = "netpol-block-c-to-a";
/// Time the CNI gets to program a new policy
pub const POLICY_SETTLE: Duration = Duration::from_secs(60);

fn server(ctx: &Context, tenant: &str) -> TenantServer {
    TenantServer::new(tenant, &ctx.config().images.netpol_server)
}

/// Tenant namespaces and servers, shared by both features
pub fn prerequisites() -> Vec<Prerequisite> {
    vec![
        Prerequisite::new(SERVERS)
            .setup(Step::new("create servers", |ctx| async move {
                let client = ctx.client()?;
                for server in netpol::servers(&ctx.config().images.netpol_server) {
                    manifest::apply(client, &server.manifests()?).await?;
                }
                for server in netpol::servers(&ctx.config().images.netpol_server) {
                    info!("Waiting for deployment {}/{} to be available", server.namespace, server.name);
                    wait_for_in::<Deployment, _>(
                        &ctx,
                        &server.namespace,
                        &server.name,
                        READY_TIMEOUT,
                        &deployment_available(),
                    )
                    .await?;
                }
                Ok(ctx)
            }))
            .finish(Step::new("delete servers", |ctx| async move {
                if !ctx.config().cleanup.should_cleanup() {
                    info!("Keeping {} (--no-cleanup)", SERVERS);
                    return Ok(ctx);
                }
                let client = ctx.client()?;
                for server in netpol::servers(&ctx.config().images.netpol_server).iter().rev() {
                    manifest::delete(client, &server.manifests()?).await?;
                }
                Ok(ctx)
            })),
    ]
}

pub fn features() -> Vec<Feature> {
    vec![allow_all(), block_c_to_a()]
}

pub fn manifests(config: &CampaignConfig) -> Result<Vec<ManifestSet>> {
    let image = &config.images.netpol_server;
    let mut sets = netpol::servers(image)
        .iter()
        .map(Workload::manifests)
        .collect::<Result<Vec<_>>>()?;
    sets.push(BlockCToA::new(image).manifests()?);
    Ok(sets)
}

fn allow_all() -> Feature {
    Feature::new(ALLOW_ALL)
        .label("suite", SUITE)
        .label("policy", "none")
        .assess(connectivity("a", "b", true))
        .assess(connectivity("c", "a", true))
}

fn block_c_to_a() -> Feature {
    Feature::new(BLOCK_C_TO_A)
        .label("suite", SUITE)
        .label("policy", netpol::POLICY_NAME)
        .setup(Step::new("create policy", |ctx| async move {
            let policy = BlockCToA::new(&ctx.config().images.netpol_server);
            deploy(&ctx, &policy).await?;
            info!("Giving the CNI {:?} to enforce {}", POLICY_SETTLE, netpol::POLICY_NAME);
            tokio::time::sleep(POLICY_SETTLE).await;
            Ok(ctx)
        }))
        .assess(connectivity("a", "b", true))
        .assess(connectivity("c", "a", false))
}

/// A running pod of `server`
async fn server_pod(client: &ClusterClient, server: &TenantServer) -> Result<String> {
    let params = ListParams::default().labels(&server.selector());
    let pods = client.list(&client.pods(&server.namespace), &params).await?;
    pods.into_iter()
        .find(|p| PodPhase::of(p) == Some(PodPhase::Running))
        .and_then(|p| p.metadata.name)
        .ok_or_else(|| Error::not_found("Pod", format!("{}/{}", server.namespace, server.selector())))
}

/// Whether an HTTP request from `from`'s server to `to`'s server gets through
async fn reaches(ctx: &Context, from: &TenantServer, to: &TenantServer) -> Result<bool> {
    let client = ctx.client()?;
    let pod = server_pod(client, from).await?;
    let output = client
        .exec(&from.namespace, &pod, &from.name, curl_command(to))
        .await?;
    let ok = http_ok(&output.stdout);
    info!(
        "{} -> {}: {} (exit code {:?})",
        from.name,
        to.url(),
        output.stdout.lines().next().unwrap_or("no response"),
        output.exit_code
    );
    Ok(ok)
}

fn connectivity(from: &'static str, to: &'static str, allowed: bool) -> Step {
    let name = if allowed {
        format!("{from} reaches {to}")
    } else {
        format!("{from} blocked from {to}")
    };
    Step::new(name, move |ctx| async move {
        let source = server(&ctx, from);
        let target = server(&ctx, to);
        let ok = reaches(&ctx, &source, &target).await?;
        check_connectivity(&source, &target, allowed, ok)?;
        Ok(ctx)
    })
}

/// Compare an observed request outcome with the expected one
pub fn check_connectivity(
    from: &TenantServer,
    to: &TenantServer,
    allowed: bool,
    reached: bool,
) -> Result<()> {
    match (allowed, reached) {
        (true, false) => Err(Error::assertion(format!(
            "{} could not reach {}",
            from.name,
            to.url()
        ))),
        (false, true) => Err(Error::assertion(format!(
            "{} reached {} despite policy {}",
            from.name,
            to.url(),
            netpol::POLICY_NAME
        ))),
        _ => Ok(()),
    }
}
