//! Maps a UDP port on the local gateway over NAT-PMP.
//!
//! Run with `RUST_LOG=natpmp_portmapper=debug` to follow the exchanges with the gateway.

use std::{net::Ipv4Addr, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use natpmp_portmapper::{Client, Config};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Port mapping over NAT-PMP.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// Talk to this gateway instead of the system's default gateway.
    #[clap(long, global = true)]
    gateway: Option<Ipv4Addr>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Map a UDP port, hold it for a while and release it.
    Map {
        /// Port to map, on both sides of the gateway.
        port: u16,
        /// Seconds to hold the mapping before releasing it.
        #[clap(long, default_value_t = 30)]
        hold_secs: u64,
    },
    /// Check whether the gateway speaks NAT-PMP.
    Probe,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config {
        gateway: cli.gateway,
        ..Default::default()
    };

    match cli.command {
        Command::Map { port, hold_secs } => {
            let client = Client::new(config)?;
            if !client.try_portmapping_blocking(port) {
                bail!("failed to map port {port}");
            }
            if let Some(mapping) = client.mapping() {
                println!(
                    "mapped: {} (lifetime {}s)",
                    mapping.external_addr(),
                    mapping.lifetime_seconds()
                );
            }
            std::thread::sleep(Duration::from_secs(hold_secs));
            client.stop_portmapping();
            println!("released port {port}");
        }
        Command::Probe => {
            let client = Client::new(config)?;
            let Some(public_ip) = client.probe_blocking() else {
                bail!("no NAT-PMP gateway found");
            };
            println!("gateway speaks NAT-PMP, public address: {public_ip}");
        }
    }
    Ok(())
}
