use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, info, warn};

use argus::campaign::{EXIT_SUCCESS, Interrupts};
use argus::client::ClusterClient;
use argus::config::CampaignArgs;
use argus::context::Context;
use argus::formatters::{FeatureListing, get_formatter};
use argus::inventory::{self, CAPACITY_RETRY_TIMEOUT, InventoryRequest};
use argus::manifest::ManifestSet;
use argus::models::{ExecutionMode, OutputFormat};
use argus::selection::Selector;
use argus::suites;
use argus::wait::WaitOptions;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Report format
    #[arg(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Maximum log level written to stderr (error, warn, info, debug, trace)
    #[arg(long, alias = "logLevel", global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Run the selected features against the cluster
    Run {
        #[command(flatten)]
        campaign: CampaignArgs,

        /// Print the manifests instead of deploying them
        #[arg(long, alias = "dryRun")]
        dry_run: bool,
    },
    /// List the features the selection would run, with their steps
    List {
        #[command(flatten)]
        campaign: CampaignArgs,
    },
    /// Print every manifest the campaign would apply, prerequisites first
    Render {
        #[command(flatten)]
        campaign: CampaignArgs,
    },
    /// Probe the accelerator capacity of the cluster's nodes
    Inventory {
        /// Path to a kubeconfig file (default: inferred)
        #[arg(long)]
        kubeconfig: Option<PathBuf>,

        /// Instance type to count (default: type of the first labelled node)
        #[arg(long, alias = "nodeType")]
        node_type: Option<String>,

        /// Extended resource every counted node must advertise (repeatable)
        #[arg(long)]
        require: Vec<String>,

        /// Fail when the cluster mixes instance types
        #[arg(long)]
        uniform: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(args.log_level)
        .init();

    let code = match args.command {
        Commands::Run { campaign, dry_run } => run_campaign(campaign, dry_run, args.format).await?,
        Commands::List { campaign } => list_features(campaign, args.format)?,
        Commands::Render { campaign } => render_manifests(campaign)?,
        Commands::Inventory {
            kubeconfig,
            node_type,
            require,
            uniform,
        } => run_inventory(kubeconfig, node_type, require, uniform, args.format).await?,
    };
    std::process::exit(code);
}

async fn run_campaign(args: CampaignArgs, dry_run: bool, format: OutputFormat) -> Result<i32> {
    let kubeconfig = args.kubeconfig.clone();
    let execution = if dry_run {
        ExecutionMode::DryRun
    } else {
        ExecutionMode::Execute
    };
    let config = args.into_config(execution)?;

    if config.execution.is_dry_run() {
        info!("Dry run mode: rendering manifests to stdout without deploying");
        print_manifests(&suites::render(&config)?);
        return Ok(EXIT_SUCCESS);
    }

    let selector = Selector::new(&config.selection)?;
    let campaign = suites::campaign(&config)?.select(&selector)?;
    if campaign.features().is_empty() {
        warn!("No feature matches the selection");
    }

    let client = ClusterClient::connect(kubeconfig.as_deref()).await?;
    let interrupts = Interrupts::new();
    let _signals = interrupts.install();

    let ctx = Context::new(Some(client), Arc::new(config), interrupts.root.clone());
    let report = campaign.run(ctx, interrupts.teardown.clone()).await;

    let output = get_formatter(format).format_report(&report)?;
    print!("{}", output);
    Ok(report.exit_code())
}

fn list_features(args: CampaignArgs, format: OutputFormat) -> Result<i32> {
    let config = args.into_config(ExecutionMode::DryRun)?;
    let selector = Selector::new(&config.selection)?;
    let campaign = suites::campaign(&config)?.select(&selector)?;
    let listings: Vec<FeatureListing> = campaign.features().iter().map(FeatureListing::from).collect();
    print!("{}", get_formatter(format).format_features(&listings)?);
    Ok(EXIT_SUCCESS)
}

fn render_manifests(args: CampaignArgs) -> Result<i32> {
    let config = args.into_config(ExecutionMode::DryRun)?;
    print_manifests(&suites::render(&config)?);
    Ok(EXIT_SUCCESS)
}

fn print_manifests(sets: &[ManifestSet]) {
    for (i, set) in sets.iter().enumerate() {
        if i > 0 {
            println!("---");
        }
        println!("# {}", set.name);
        print!("{}", set.rendered.trim_end());
        println!();
    }
}

async fn run_inventory(
    kubeconfig: Option<PathBuf>,
    node_type: Option<String>,
    require: Vec<String>,
    uniform: bool,
    format: OutputFormat,
) -> Result<i32> {
    let mut request = InventoryRequest::new(node_type);
    for resource in require {
        request = request.require(resource);
    }
    if uniform {
        request = request.uniform();
    }

    let client = ClusterClient::connect(kubeconfig.as_deref()).await?;
    let interrupts = Interrupts::new();
    let _signals = interrupts.install();
    let options = WaitOptions::new(interrupts.root.clone()).with_timeout(CAPACITY_RETRY_TIMEOUT);
    let snapshot = inventory::probe_with_retry(&client, &request, &options).await?;

    print!("{}", get_formatter(format).format_inventory(&snapshot)?);
    Ok(EXIT_SUCCESS)
}
