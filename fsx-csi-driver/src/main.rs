//! FSx for Lustre CSI Driver
//!
//! Command-line entry point for the provisioning core: validates a driver
//! configuration and runs an end-to-end smoke cycle against the simulated
//! backing store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use fsx_csi_driver::types::{SECURITY_GROUP_IDS_KEY, SUBNET_ID_KEY};
use fsx_csi_driver::{
    AccessMode, Capacity, Driver, DriverConfig, SimulatedBackingStore, VolumeParameters,
    VolumeRequest, metrics,
};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "fsx-csi-driver")]
#[command(about = "FSx for Lustre CSI provisioning driver")]
struct Args {
    /// Driver configuration file (JSON)
    #[arg(long, env = "FSX_CSI_CONFIG")]
    config: Option<PathBuf>,

    /// Node ID for this CSI node
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Driver name, overriding the configuration
    #[arg(long)]
    driver_name: Option<String>,

    /// Address for the Prometheus metrics endpoint (e.g. 0.0.0.0:9090)
    #[arg(long, env = "FSX_CSI_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration and print the capability set
    Validate,

    /// Run create, wait, attach, detach and delete against the simulated store
    Smoke {
        /// Subnet the file system is placed in
        #[arg(long, env = "FSX_SUBNET_ID")]
        subnet_id: String,

        /// Comma-separated security group IDs
        #[arg(long, env = "FSX_SECURITY_GROUPS")]
        security_groups: String,

        /// Name of the smoke volume
        #[arg(long, default_value = "fsx-smoke")]
        volume_name: String,

        /// Requested capacity (defaults to the configured claim size)
        #[arg(long)]
        capacity: Option<Capacity>,

        /// Access mode used for the attach step
        #[arg(long, default_value = "ReadWriteMany")]
        access_mode: AccessMode,

        /// Mount path used for the attach step
        #[arg(long, default_value = "/mnt/fsx")]
        mount_path: PathBuf,
    },
}

#[derive(Serialize)]
struct CapabilityReport<'a> {
    driver_name: &'a str,
    version: &'a str,
    claim_size: String,
    capabilities: Vec<fsx_csi_driver::Capability>,
}

fn print_json<T: Serialize>(step: &str, value: &T) -> Result<(), serde_json::Error> {
    println!("{}: {}", step, serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    if let Some(name) = args.driver_name {
        config.capabilities.driver_name = name;
    }
    config.validate()?;

    // Determine node_id
    let node_id = match args.node_id {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    if let Some(addr) = args.metrics_addr {
        metrics::init_metrics(addr).map_err(|e| e as Box<dyn std::error::Error>)?;
    }

    info!(
        driver_name = %config.capabilities.driver_name,
        node_id = %node_id,
        config = ?args.config,
        "Starting FSx for Lustre CSI Driver"
    );

    match args.command {
        Command::Validate => {
            let descriptor = config.descriptor()?;
            print_json(
                "capabilities",
                &CapabilityReport {
                    driver_name: descriptor.driver_name(),
                    version: fsx_csi_driver::DRIVER_VERSION,
                    claim_size: descriptor.claim_size().to_string(),
                    capabilities: descriptor.capabilities().collect(),
                },
            )?;
        }
        Command::Smoke {
            subnet_id,
            security_groups,
            volume_name,
            capacity,
            access_mode,
            mount_path,
        } => {
            if subnet_id.trim().is_empty() {
                return Err("--subnet-id is required".into());
            }
            if security_groups.trim().is_empty() {
                return Err("--security-groups is required".into());
            }

            let parameters = VolumeParameters::from_map(
                &[
                    (SUBNET_ID_KEY.to_string(), subnet_id),
                    (SECURITY_GROUP_IDS_KEY.to_string(), security_groups),
                ]
                .into(),
            )?;

            let store = Arc::new(SimulatedBackingStore::new());
            let driver = Driver::new(&config, store)?;
            let capacity = capacity.unwrap_or_else(|| driver.capabilities().claim_size());
            let request = VolumeRequest::new(&volume_name, capacity, parameters);

            let record = driver.create_volume(&request).await?;
            print_json("created", &record)?;

            let record = driver.wait_ready(&volume_name).await?;
            print_json("ready", &record)?;

            let attachment = driver
                .attach(&volume_name, &node_id, access_mode, &mount_path)
                .await?;
            print_json("attached", &attachment)?;

            driver.detach(&volume_name, &node_id).await?;
            driver.delete_volume(&volume_name).await?;
            info!(volume = %volume_name, "Smoke cycle completed");
            println!("deleted: {}", volume_name);
        }
    }

    Ok(())
}
