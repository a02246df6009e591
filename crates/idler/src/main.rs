use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devbox_idler::{
    config::Config,
    gcp::{GceClient, GcpHttp},
    provision::{
        resources::{FirewallSpec, InstanceSpec, NetworkSpec, NotificationChannelSpec, TopicSpec},
        GcpProvisioner, Plan, Provisioner,
    },
    server::Server,
};

#[derive(Parser)]
#[command(author, version, about = "Start a preemptible code-server VM on demand and stop it when idle", long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the start trigger and the idle-alert push endpoint
    Serve,

    /// Print the provisioning order and resource bodies without calling any API
    Plan,

    /// Create (or reuse) the VM and the idle-shutdown wiring
    Provision,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Plan => print_plan(&config),
        Commands::Provision => provision(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    config.validate_for_server()?;

    let http = Arc::new(GcpHttp::new(&config.gcp)?);
    let compute = Arc::new(GceClient::new(http, &config.gcp));

    let server = Server::new(&config, compute);
    info!("Starting server on {}", config.server.addr);
    server.start(&config.server.addr).await?;

    Ok(())
}

fn print_plan(config: &Config) -> Result<()> {
    let plan = Plan::for_config(&config.provision)?;
    let network = format!(
        "projects/{}/global/networks/{}",
        config.gcp.project, config.provision.network_name
    );
    let topic = format!(
        "projects/{}/topics/{}",
        config.gcp.project, config.provision.topic_name
    );

    // Bodies that depend on runtime outputs (instance id, project number) are omitted
    let rendered = json!({
        "steps": plan.steps(),
        "resources": {
            "network": NetworkSpec::new(&config.provision.network_name),
            "firewall": FirewallSpec::ssh(&config.provision.firewall_name, &network),
            "instance": InstanceSpec::preemptible(&config.provision, &config.gcp.zone, &network),
            "topic": TopicSpec::new(&config.provision.topic_name),
            "notificationChannel": NotificationChannelSpec::pubsub(&topic),
            "alert": config.provision.alert,
        }
    });
    println!("{}", serde_json::to_string_pretty(&rendered)?);
    Ok(())
}

async fn provision(config: Config) -> Result<()> {
    config.validate_for_provision()?;

    let plan = Plan::for_config(&config.provision)?;
    let http = Arc::new(GcpHttp::new(&config.gcp)?);
    let api = Arc::new(GcpProvisioner::new(http, &config.gcp));

    let outputs = Provisioner::new(api, config).apply(&plan).await?;
    if let Some(id) = &outputs.instance_id {
        info!("Set CODE_SERVER_INSTANCE_ID={} for the serve command", id);
    }
    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}
