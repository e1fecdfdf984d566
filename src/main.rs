//! KNX signal bridge daemon

use clap::Parser;
use knx_signal_bridge::{
    logging::{init_logging, LogConfig},
    supervisor, BridgeConfig, Result,
};
use std::path::PathBuf;
use tracing::info;

/// KNX bus adapter daemon
#[derive(Parser, Debug)]
#[command(name = "knx-signal-bridge")]
#[command(about = "Bridges field devices to a KNX bus through linknx")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config.json", env = "KNX_BRIDGE_CONFIG")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BridgeConfig::load(&cli.config)?;
    init_logging(LogConfig::from_sys(&config.sys).with_debug(cli.debug))?;

    info!(
        "🚀 Starting KNX signal bridge v{} ({})",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );

    if cli.check {
        info!(
            "✅ Configuration valid: {} devices, {} enabled",
            config.devices.len(),
            config.enabled_devices().count()
        );
        return Ok(());
    }

    supervisor::run(config).await
}
