//! LoRa Mesh Routing Simulator Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running the mesh engine over a simulated topology
//! - Computing LoRa time on air for a frame
//! - Printing the default engine configuration as JSON

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use loramesh_core::mesh::{
    MeshConfig, MeshSimulator, RadioSettings, RoutingMetric, SimConfig, Topology,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "loramesh")]
#[command(author, version, about = "LoRa mesh routing simulator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the mesh engine over a simulated network
    Simulate {
        /// Topology (chain, grid, full, random)
        #[arg(short, long, default_value = "grid")]
        topology: String,

        /// Number of nodes (grid uses the nearest square at or above)
        #[arg(short, long, default_value = "9")]
        nodes: usize,

        /// Routing metric (see `loramesh metrics`)
        #[arg(short, long)]
        metric: Option<String>,

        /// Use on-demand RREQ/RREP discovery instead of beacons
        #[arg(long)]
        aodv: bool,

        /// Relay flooded packets
        #[arg(long)]
        discovery: bool,

        /// Request end-to-end acknowledgements
        #[arg(long)]
        ack: bool,

        /// Packets per destination in each traffic batch
        #[arg(long)]
        packets: Option<u32>,

        /// Destinations per batch (0 = every other node)
        #[arg(long)]
        destinations: Option<usize>,

        /// Duty cycle fraction (0 disables the budget)
        #[arg(long)]
        duty_cycle: Option<f64>,

        /// Simulated duration in seconds
        #[arg(short, long, default_value = "3600")]
        duration: u64,

        /// Random seed
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Drop overlapping receptions
        #[arg(long)]
        collisions: bool,

        /// Independent per-reception loss probability
        #[arg(long, default_value = "0.0")]
        link_loss: f64,

        /// Side of the square area for random layouts (meters)
        #[arg(long, default_value = "3000.0")]
        area: f64,

        /// Radio range for random layouts (meters)
        #[arg(long, default_value = "1000.0")]
        range: f64,

        /// Engine configuration file (JSON); flags override its fields
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compute time on air for one frame
    Airtime {
        /// Spreading factor (7-12)
        #[arg(long, default_value = "7")]
        sf: u8,

        /// Bandwidth in kHz (125, 250, 500)
        #[arg(long, default_value = "125")]
        bw: u32,

        /// Coding rate (5-8 for 4/5 to 4/8)
        #[arg(long, default_value = "5")]
        cr: u8,

        /// Application payload length in bytes
        #[arg(short, long, default_value = "20")]
        bytes: u16,
    },

    /// Print the default engine configuration as JSON
    Config,

    /// List available routing metrics
    Metrics,
}

fn validate_sf(sf: u8) -> Result<u8> {
    if (7..=12).contains(&sf) {
        Ok(sf)
    } else {
        anyhow::bail!("Invalid spreading factor: {}. Must be 7-12", sf)
    }
}

fn validate_bw(bw: u32) -> Result<u32> {
    match bw {
        125 => Ok(125_000), // Convert kHz to Hz
        250 => Ok(250_000),
        500 => Ok(500_000),
        _ => anyhow::bail!("Invalid bandwidth: {}kHz. Must be 125, 250, or 500", bw),
    }
}

fn validate_cr(cr: u8) -> Result<u8> {
    if (5..=8).contains(&cr) {
        Ok(cr - 4)
    } else {
        anyhow::bail!("Invalid coding rate: 4/{}. Must be 4/5 to 4/8", cr)
    }
}

fn parse_metric(metric: &str) -> Result<RoutingMetric> {
    metric.parse::<RoutingMetric>().map_err(anyhow::Error::msg)
}

fn build_topology(kind: &str, nodes: usize, area: f64, range: f64, seed: u64) -> Result<Topology> {
    let topology = match kind.to_lowercase().as_str() {
        "chain" | "line" => Topology::chain(nodes),
        "grid" => {
            let side = (nodes as f64).sqrt().ceil() as usize;
            Topology::grid(side, side)
        }
        "full" | "mesh" => Topology::full(nodes),
        "random" => Topology::random_geometric(nodes, area, range, seed),
        _ => anyhow::bail!("Unknown topology: {}. Use chain, grid, full, or random", kind),
    };
    if !topology.is_connected() {
        warn!("Topology is not connected; some destinations are unreachable");
    }
    Ok(topology)
}

fn load_config(path: Option<&PathBuf>) -> Result<MeshConfig> {
    match path {
        Some(path) => MeshConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(MeshConfig::default()),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    topology: String,
    nodes: usize,
    metric: Option<String>,
    aodv: bool,
    discovery: bool,
    ack: bool,
    packets: Option<u32>,
    destinations: Option<usize>,
    duty_cycle: Option<f64>,
    duration: u64,
    seed: u64,
    collisions: bool,
    link_loss: f64,
    area: f64,
    range: f64,
    config: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let mut mesh = load_config(config.as_ref())?;
    if let Some(metric) = metric {
        mesh = mesh.with_metric(parse_metric(&metric)?);
    }
    if aodv {
        mesh = mesh.with_aodv(true);
    }
    if discovery {
        mesh = mesh.with_route_discovery(true);
    }
    if ack {
        mesh = mesh.with_request_ack(true);
    }
    if packets.is_some() || destinations.is_some() {
        let packets = packets.unwrap_or(mesh.packets_per_destination);
        let destinations = destinations.unwrap_or(mesh.number_of_destinations);
        mesh = mesh.with_traffic(packets, destinations);
    }
    if let Some(duty) = duty_cycle {
        mesh = mesh.with_duty_cycle((duty > 0.0).then_some(duty));
    }

    let topology = build_topology(&topology, nodes, area, range, seed)?;
    info!(
        "Simulating {} nodes, {} links, metric {}",
        topology.size(),
        topology.link_count(),
        mesh.metric
    );

    let sim_config = SimConfig::default()
        .with_duration(Duration::from_secs(duration))
        .with_seed(seed)
        .with_collisions(collisions)
        .with_link_loss(link_loss);

    let mut sim = MeshSimulator::new(topology, &mesh, sim_config).context("Invalid simulation setup")?;
    let report = sim.run().context("Simulation failed to start")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

fn cmd_airtime(sf: u8, bw: u32, cr: u8, bytes: u16) -> Result<()> {
    validate_sf(sf)?;
    let cr_index = validate_cr(cr)?;
    let bw_hz = validate_bw(bw)?;

    let radio = RadioSettings {
        spreading_factor: sf,
        bandwidth_hz: bw_hz,
        coding_rate: cr_index,
        ..RadioSettings::default()
    };
    let toa = radio.airtime(bytes);
    let symbol_ms = radio.symbol_time().as_secs_f64() * 1000.0;

    println!("=== LoRa Time on Air ===");
    println!();
    println!("Configuration:");
    println!("  Spreading Factor:  SF{}", sf);
    println!("  Bandwidth:         {} kHz", bw);
    println!("  Coding Rate:       4/{}", cr);
    println!("  Payload Length:    {} bytes", bytes);
    println!();
    println!("Timing:");
    println!("  Symbol duration:   {:.3} ms", symbol_ms);
    println!("  Time on air:       {:.2} ms", toa.as_secs_f64() * 1000.0);
    println!();
    println!("Duty cycle (1%):");
    println!("  Off period:        {:.2} s", toa.as_secs_f64() / 0.01);

    Ok(())
}

fn cmd_config() -> Result<()> {
    let json = MeshConfig::default()
        .to_json()
        .context("Failed to serialize default config")?;
    println!("{}", json);
    Ok(())
}

fn cmd_metrics() -> Result<()> {
    println!("=== Routing Metrics ===");
    println!();
    for metric in RoutingMetric::ALL {
        let kind = if metric.is_dual() {
            "dual (RSSI + time on air)"
        } else if metric.uses_beacons() {
            "beacon"
        } else {
            "flooding"
        };
        println!("  {:<20} {}", metric.to_string(), kind);
    }
    println!();
    println!("Examples:");
    println!("  loramesh simulate --topology chain --nodes 6 --metric etx");
    println!("  loramesh simulate --topology grid --nodes 16 --aodv --ack");
    println!("  loramesh simulate --config mesh.json --json");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            topology,
            nodes,
            metric,
            aodv,
            discovery,
            ack,
            packets,
            destinations,
            duty_cycle,
            duration,
            seed,
            collisions,
            link_loss,
            area,
            range,
            config,
            json,
        } => cmd_simulate(
            topology,
            nodes,
            metric,
            aodv,
            discovery,
            ack,
            packets,
            destinations,
            duty_cycle,
            duration,
            seed,
            collisions,
            link_loss,
            area,
            range,
            config,
            json,
        ),

        Commands::Airtime { sf, bw, cr, bytes } => cmd_airtime(sf, bw, cr, bytes),

        Commands::Config => cmd_config(),

        Commands::Metrics => cmd_metrics(),
    }
}
