use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use bluest::Adapter;
use clap::Parser;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use efble::transport::BluestTransport;
use efble::{new_device, Advertisement, ConnectionConfig, Device, KeyTable};

/// Connect to an EcoFlow device and print its telemetry whenever it changes
#[derive(Parser, Debug)]
#[command(name = "efble")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// User id the device is bound to
    #[arg(long, env = "EFBLE_USER_ID")]
    user_id: String,

    /// Key table used to derive the session key
    #[arg(long, value_name = "FILE", env = "EFBLE_KEY_TABLE")]
    key_table: PathBuf,

    /// Only connect to the device with this address
    #[arg(long)]
    address: Option<String>,

    /// Give up scanning after this many seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    scan_timeout: u64,

    /// Enable verbose debug output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let key_table = KeyTable::from_file(&cli.key_table)
        .with_context(|| format!("Unable to read key table {}", cli.key_table.display()))?;
    let config = ConnectionConfig::new(cli.user_id, key_table);

    let adapter = Adapter::default().await.ok_or(anyhow!("Default adapter not found"))?;
    adapter.wait_available().await?;

    let mut device = timeout(Duration::from_secs(cli.scan_timeout), discover(&adapter, cli.address.as_deref()))
        .await
        .map_err(|_| anyhow!("No supported device found"))??;
    info!("Found {} {} at {}", device.model(), device.serial(), device.address());

    let (tx, mut changes) = mpsc::unbounded_channel();
    device.register_callback(Arc::new(move || {
        let _ = tx.send(());
    }));
    device.connect(config).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = device.wait_disconnected() => {
                warn!("Device disconnected");
                break;
            }
            Some(()) = changes.recv() => print_readings(&device),
        }
    }

    device.disconnect().await?;
    Ok(())
}

async fn discover(adapter: &Adapter, address: Option<&str>) -> anyhow::Result<Device> {
    let mut adapter_events = adapter.scan(&[]).await?;
    while let Some(found) = adapter_events.next().await {
        let adv = Advertisement::from(&found);
        if address.is_some_and(|address| address != adv.address) {
            continue;
        }

        if let Some(device) = new_device(&adv, BluestTransport::new(adapter.clone(), found.device.clone())) {
            return Ok(device);
        }
    }
    Err(anyhow!("Scan ended without finding a supported device"))
}

fn print_readings(device: &Device) {
    for capability in device.capabilities() {
        if let Some(reading) = device.reading(capability.kind()) {
            println!("{:?}: {reading:?}", capability.kind());
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "efble=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
