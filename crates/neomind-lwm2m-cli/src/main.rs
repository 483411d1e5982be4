//! Command-line tools for the NeoMind LwM2M gateway.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use neomind_lwm2m::{
    FirmwareAssignment, FirmwareStore, GatewayConfig, Lwm2mGateway, MemoryFirmwareStore, NewFirmware,
};
use neomind_lwm2m_testing::{
    eventually, MemoryBootstrapStore, ProfileBuilder, RecordingBackend, SimulatedDevice, SimulatedEngine,
};
use serde_json::{json, Map, Value};
use tracing::info;

/// NeoMind LwM2M gateway tools.
#[derive(Parser, Debug)]
#[command(name = "neomind-lwm2m")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to lwm2m.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load and validate the configuration, then print it.
    CheckConfig,
    /// Run the gateway against a simulated device and print what it published.
    Simulate {
        /// Endpoint name of the simulated device.
        #[arg(long, default_value = "dev1")]
        endpoint: String,
        /// Battery level reported by the device.
        #[arg(long, default_value_t = 87)]
        battery: i64,
        /// Push a firmware image and wait for the device to report this version.
        #[arg(long)]
        upgrade_to: Option<String>,
        /// Size of the simulated firmware image in bytes.
        #[arg(long, default_value_t = 4096)]
        image_size: usize,
        /// Seconds to wait for the device to settle.
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let config = GatewayConfig::load(args.config.as_deref()).context("invalid gateway configuration")?;
    match args.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate {
            endpoint,
            battery,
            upgrade_to,
            image_size,
            wait,
        } => simulate(config, &endpoint, battery, upgrade_to, image_size, Duration::from_secs(wait)).await,
    }
}

fn init_tracing() {
    let json_logging = std::env::var("NEOMIND_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("neomind_lwm2m=info"));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn simulate(
    config: GatewayConfig,
    endpoint: &str,
    battery: i64,
    upgrade_to: Option<String>,
    image_size: usize,
    wait: Duration,
) -> Result<()> {
    let engine = Arc::new(SimulatedEngine::new());
    let backend = Arc::new(RecordingBackend::new());
    let firmware = Arc::new(MemoryFirmwareStore::new());
    let bootstrap = Arc::new(MemoryBootstrapStore::new());
    let gateway = Lwm2mGateway::new(config, engine.clone(), backend.clone(), firmware.clone(), Some(bootstrap))?;
    gateway.start();

    let profile = ProfileBuilder::new("simulated")
        .attribute("/3_1.0/0/9", "battery")
        .telemetry("/3_1.0/0/15", "timezone")
        .observe("/3_1.0/0/9")
        .build();
    let mut device = SimulatedDevice::new(endpoint).with_device_object(battery);
    if let Some(version) = &upgrade_to {
        device = device.with_firmware("1.0", image_size, version);
    }
    let device_info = backend.add_device(endpoint, &profile);
    let registration = engine.add_device(device);

    if let Some(version) = &upgrade_to {
        let image = (0..image_size).map(|i| i as u8).collect();
        let stored = firmware
            .save(NewFirmware::new(device_info.tenant_id, "simulated", version.clone(), image))
            .await?;
        backend.assign_firmware(
            device_info.device_id,
            FirmwareAssignment {
                firmware_id: stored.id,
                title: stored.title.clone(),
                version: version.clone(),
            },
        );
    }

    let session = gateway.on_registered(registration).await?;
    let settled = eventually(wait, || {
        session.is_initialized() && (upgrade_to.is_none() || session.firmware().is_converged())
    })
    .await;
    info!(endpoint, settled, "Simulation finished");

    let mut attributes = Map::new();
    for published in backend.attributes() {
        for kv in published.values {
            attributes.insert(kv.key, kv.value.to_json());
        }
    }
    let mut telemetry = Map::new();
    for published in backend.telemetry() {
        for kv in published.values {
            telemetry.insert(kv.key, kv.value.to_json());
        }
    }
    let report = json!({
        "endpoint": endpoint,
        "sessionId": session.session_id().to_string(),
        "settled": settled,
        "attributes": Value::Object(attributes),
        "telemetry": Value::Object(telemetry),
        "firmwareBytes": engine.firmware_received(endpoint),
        "requests": engine.requests(endpoint).iter().map(|r| r.name()).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    gateway.shutdown();
    Ok(())
}
