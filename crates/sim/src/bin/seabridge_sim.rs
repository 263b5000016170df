//! acoustic channel simulation for SeaBridge

use anyhow::Result;
use clap::{Parser, ValueEnum};
use colored::Colorize;
use seabridge_gateway::ChannelConfig;
use seabridge_sim::scenarios::{self, Scenario, ScenarioReport};
use seabridge_sim::SimulationPresets;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Preset {
    Good,
    Average,
    Poor,
    Extreme,
}

impl Preset {
    fn label(self) -> &'static str {
        match self {
            Preset::Good => "Good Conditions",
            Preset::Average => "Average Conditions",
            Preset::Poor => "Poor Conditions",
            Preset::Extreme => "Extreme Conditions",
        }
    }
}

/// Runs a ring of modem drivers over the emulated channel under each preset
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Nodes in the ring
    #[arg(short, long, default_value_t = 4)]
    nodes: u32,

    /// Packets each node sends to its neighbour
    #[arg(short, long, default_value_t = 5)]
    packets: u32,

    /// Application payload per packet, in bytes
    #[arg(long, default_value_t = 16)]
    payload: usize,

    /// Run only this preset
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Print the reports as JSON instead of tables
    #[arg(long)]
    json: bool,
}

impl Args {
    fn scenario(&self) -> Scenario {
        Scenario {
            nodes: self.nodes,
            packets_per_node: self.packets,
            payload_bytes: self.payload,
            progress: !self.json,
            ..Default::default()
        }
    }
}

fn print_config(config: &ChannelConfig) {
    println!("Bitrate: {} bps", config.bitrate_bps);
    println!("Packet Loss: {}%{}", (config.packet_loss * 100.0) as u32, if config.bursty_loss { " (bursty)" } else { "" });
    println!("Propagation: {:?} ± {:?}", config.latency, config.latency_jitter);
}

fn print_report(report: &ScenarioReport) {
    println!(
        "  {:>4} {:>5} {:>9} {:>7} {:>8} {:>8} {:>9} {:>9}",
        "node", "sent", "delivered", "aborted", "attempts", "received", "rx errors", "range"
    );
    for n in &report.nodes {
        let range = n.range_m.map_or_else(|| "-".to_string(), |m| format!("{m:.0} m"));
        println!(
            "  {:>4} {:>5} {:>9} {:>7} {:>8} {:>8} {:>9} {:>9}",
            n.address, n.sent, n.delivered, n.aborted, n.attempts, n.received, n.rx_errors, range
        );
    }
    let ratio = report.delivery_ratio() * 100.0;
    let ratio = format!("{ratio:.1}%");
    let ratio = if report.delivery_ratio() >= 0.9 {
        ratio.green()
    } else if report.delivery_ratio() >= 0.5 {
        ratio.yellow()
    } else {
        ratio.red()
    };
    println!();
    println!("  delivery ratio: {}", ratio);
    println!("  mean attempts:  {:.2}", report.mean_attempts());
    println!("  goodput:        {:.1} bps over {:?}", report.goodput_bps(), report.elapsed);
    println!(
        "  channel:        {} frames carried, {} dropped",
        report.channel.frames_carried, report.channel.frames_dropped
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let scenario = args.scenario();
    let json = args.json;

    if !json {
        println!("{}", "SeaBridge Acoustic Channel Simulation".bright_blue().bold());
        println!("{}", "=====================================".bright_blue());
        println!();
    }

    let mut reports = Vec::new();
    for (name, config) in SimulationPresets::all() {
        if args.preset.is_some_and(|p| p.label() != name) {
            continue;
        }
        if !json {
            println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
            print_config(&config);
            println!();
        }

        let report = scenarios::cbr_exchange(config, &scenario).await?;
        if json {
            reports.push((name, report));
        } else {
            print_report(&report);
            println!("{}", "-".repeat(50));
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        println!("\n{}", "All simulations complete!".bright_green().bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn flags_shape_the_scenario() {
        let args = Args::try_parse_from(["seabridge_sim", "--nodes", "6", "-p", "2", "--preset", "poor", "--json"]).unwrap();
        let scenario = args.scenario();
        assert_eq!((scenario.nodes, scenario.packets_per_node), (6, 2));
        assert_eq!(scenario.payload_bytes, 16);
        assert!(!scenario.progress);
        assert_eq!(args.preset, Some(Preset::Poor));

        assert!(Args::try_parse_from(["seabridge_sim", "--preset", "stormy"]).is_err());
        assert!(Args::try_parse_from(["seabridge_sim", "--nodes", "many"]).is_err());
    }

    #[test]
    fn every_preset_names_a_simulation() {
        let names: Vec<_> = SimulationPresets::all().into_iter().map(|(name, _)| name).collect();
        for preset in Preset::value_variants() {
            assert!(names.contains(&preset.label()), "{preset:?}");
        }
    }
}
