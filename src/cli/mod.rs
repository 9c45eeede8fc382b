/*
* gce-lab Command Line Interface
* ------------------------------
* Git-style subcommands over the lab planner and deployer.
*
* Command Structure:
* ---------------
* gce-lab [--config lab.toml]
* ├── up [--dry-run] [--json]   // plan the lab, create it, wait for every readiness gate
* ├── plan                      // print the resource graph without touching the cloud
* ├── wait --zone Z --instance N...   // block until guests publish a value
* └── init [--force]            // write a sample lab.toml
*
* Ctrl-C cancels a running deployment; in-flight polls are abandoned and nothing
* that depends on an unfinished resource is created.
*/

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures_util::future::try_join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{generate_default_config, LabRequest, LabSettings, SettingsSources};
use crate::core::credentials::CredentialSource;
use crate::core::deployer::Deployer;
use crate::core::gce::GceClient;
use crate::core::provider::{CloudProvider, GuestAttributes, InstanceTarget};
use crate::core::readiness::{wait_for_guest_attribute, PollSettings, ReadinessCondition};
use crate::core::resources::Resource;
use crate::core::simulated::SimulatedCloud;
use crate::errors::SettingsError;
use crate::monitoring::InstanceState;
use crate::topology::{LabContext, LabOutput, LabPlan};
use crate::utils::keys::load_or_generate;

const DRY_RUN_PROJECT: &str = "dry-run-project";

#[derive(Parser)]
#[command(name = "gce-lab")]
#[command(about = "Provision VM fleets and Kubernetes labs on Compute Engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configured lab and wait until it is ready
    Up {
        /// Run against an in-memory cloud instead of Compute Engine
        #[arg(long)]
        dry_run: bool,
        /// Print the lab output as JSON, private key included
        #[arg(long)]
        json: bool,
    },
    /// Show the resources the configured lab would create
    Plan,
    /// Wait for instances to publish a guest attribute value
    Wait {
        #[arg(short, long)]
        zone: String,
        #[arg(short, long = "instance", required = true)]
        instances: Vec<String>,
        #[arg(long, default_value = "status/startup")]
        query_path: String,
        #[arg(long, default_value = "completed")]
        expected: String,
        #[arg(long)]
        error_value: Option<String>,
        /// Seconds between polls, `poll_interval_secs` when omitted
        #[arg(long)]
        interval: Option<u64>,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Generate a sample lab configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Init { force } => handle_init_command(cli.config, force),
        Commands::Plan => {
            let request = load_request(cli.config)?;
            handle_plan_command(&request).await
        }
        Commands::Up { dry_run, json } => {
            let request = load_request(cli.config)?;
            handle_up_command(&request, dry_run, json, &cancel).await
        }
        Commands::Wait {
            zone,
            instances,
            query_path,
            expected,
            error_value,
            interval,
            timeout,
        } => {
            let settings =
                LabSettings::load(&SettingsSources::from_process(cli.config))?.with_poll_overrides(interval, timeout);
            let poll = settings.poll_settings()?;
            let conditions = WaitRequest {
                zone,
                instances,
                query_path,
                expected,
                error_value,
                poll,
            };
            handle_wait_command(&settings, conditions, &cancel).await
        }
    }
}

fn load_request(config: Option<PathBuf>) -> anyhow::Result<LabRequest> {
    let settings = LabSettings::load(&SettingsSources::from_process(config))?;
    Ok(settings.resolve()?)
}

async fn resolve_project(explicit: Option<&str>, credentials: &CredentialSource) -> anyhow::Result<String> {
    if let Some(project) = explicit {
        return Ok(project.to_string());
    }
    let from_key = credentials
        .service_account_key()
        .await?
        .and_then(|key| key.project_id);
    from_key.ok_or_else(|| SettingsError::Missing { key: "project" }.into())
}

async fn lab_context(request: &LabRequest, project: String) -> anyhow::Result<(LabContext, LabPlan, String)> {
    let keys = load_or_generate(&request.key_dir)
        .await
        .context("preparing the lab SSH key pair")?;
    let ctx = LabContext {
        project,
        region: request.region.clone(),
        lab_name: request.lab_name.clone(),
        public_key: keys.public_key.clone(),
        existing_network: request.existing_network.clone(),
        poll: request.poll,
    };
    let plan = LabPlan::assemble(&ctx, &request.options, &keys).await?;
    Ok((ctx, plan, keys.private_key))
}

async fn handle_plan_command(request: &LabRequest) -> anyhow::Result<()> {
    let project = request.project.clone().unwrap_or_else(|| DRY_RUN_PROJECT.to_string());
    let (ctx, plan, _) = lab_context(request, project).await?;
    let graph = plan.graph();

    println!("{} {} ({} resources)", "Lab".bold(), ctx.lab_name.cyan(), graph.len());
    for node in graph.iter() {
        let kind = match &node.resource {
            Resource::Readiness(_) => node.resource.kind().yellow(),
            Resource::Instance(_) => node.resource.kind().green(),
            _ => node.resource.kind().normal(),
        };
        if node.depends_on.is_empty() {
            println!("  {:<14} {}", kind, node.id);
        } else {
            let deps: Vec<&str> = node.depends_on.iter().map(|d| d.as_str()).collect();
            println!("  {:<14} {} {} {}", kind, node.id, "<-".dimmed(), deps.join(", ").dimmed());
        }
    }
    Ok(())
}

async fn handle_up_command(request: &LabRequest, dry_run: bool, json: bool, cancel: &CancellationToken) -> anyhow::Result<()> {
    let provider: Arc<dyn CloudProvider>;
    let guest: Arc<dyn GuestAttributes>;
    let project = if dry_run {
        let project = request.project.clone().unwrap_or_else(|| DRY_RUN_PROJECT.to_string());
        let cloud = Arc::new(SimulatedCloud::new(project.clone()));
        provider = cloud.clone();
        guest = cloud;
        project
    } else {
        let credentials = CredentialSource::discover(request.credentials.as_deref());
        let project = resolve_project(request.project.as_deref(), &credentials).await?;
        let client = Arc::new(GceClient::new(project.clone(), credentials));
        provider = client.clone();
        guest = client;
        project
    };

    let (_, plan, private_key) = lab_context(request, project).await?;
    info!("Deploying lab {} ({} resources)", request.lab_name, plan.graph().len());

    let deployer = Deployer::new(provider, guest);
    let deployed = deployer.deploy(plan.graph(), cancel).await;
    print_progress(&deployer).await;
    let outputs = deployed?;

    let output = plan.output(&outputs, &private_key)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_output(&output);
    }
    Ok(())
}

async fn print_progress<P, G>(deployer: &Deployer<P, G>)
where
    P: CloudProvider + ?Sized + 'static,
    G: GuestAttributes + ?Sized + 'static,
{
    for (instance, record) in deployer.progress().snapshot().await {
        let state = match record.state {
            InstanceState::Ready => record.state.to_string().green(),
            InstanceState::Failed => record.state.to_string().red(),
            _ => record.state.to_string().yellow(),
        };
        println!("  {:<32} {} (since {})", instance, state, record.since.format("%H:%M:%S"));
    }
}

fn print_output(output: &LabOutput) {
    match output {
        LabOutput::Vm(fleet) => {
            println!("{}", "Instances:".bold());
            for vm in &fleet.instances {
                println!(
                    "- {} public={} private={}",
                    vm.name.cyan(),
                    vm.public_address.as_deref().unwrap_or("-"),
                    vm.private_address
                );
            }
        }
        LabOutput::K8s(lab) => {
            for (i, address) in lab.access.iter().enumerate() {
                println!("{} {}", format!("AccessVM{}:", i).bold(), address);
            }
            println!("{} {}", "ConfigBucket:".bold(), lab.config_bucket);
            for (i, cluster) in lab.clusters.iter().enumerate() {
                println!(
                    "{} cp={} wks={}",
                    format!("Cluster{}:", i).bold(),
                    cluster.control_planes.join(","),
                    cluster.workers.join(",")
                );
            }
        }
    }
    println!("{} Lab is ready", "✓".green());
}

struct WaitRequest {
    zone: String,
    instances: Vec<String>,
    query_path: String,
    expected: String,
    error_value: Option<String>,
    poll: PollSettings,
}

async fn handle_wait_command(settings: &LabSettings, request: WaitRequest, cancel: &CancellationToken) -> anyhow::Result<()> {
    let credentials = CredentialSource::discover(settings.credentials.as_deref());
    let project = resolve_project(settings.project.as_deref(), &credentials).await?;
    let client = GceClient::new(project.clone(), credentials);

    let waits = request.instances.iter().map(|instance| {
        let target = InstanceTarget {
            project: project.clone(),
            zone: request.zone.clone(),
            instance: instance.clone(),
        };
        let mut condition = ReadinessCondition::new(target, &request.query_path, &request.expected, request.poll);
        if let Some(error_value) = &request.error_value {
            condition = condition.with_error_value(error_value);
        }
        let client = &client;
        async move { wait_for_guest_attribute(client, &condition, cancel).await }
    });

    for marker in try_join_all(waits).await? {
        println!("{} {} after {} poll(s)", "✓".green(), marker.id, marker.polls);
    }
    Ok(())
}

fn handle_init_command(config: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config.unwrap_or_else(|| PathBuf::from("lab.toml"));
    if path.exists() && !force {
        anyhow::bail!("{} already exists. Use --force to overwrite.", path.display());
    }

    let config_str = toml::to_string_pretty(&generate_default_config())?;
    std::fs::write(&path, config_str)?;

    println!("{} Default configuration written to {}", "✓".green(), path.display());
    Ok(())
}
