//! Interpose CLI - run and inspect interception scenarios
//!
//! Commands:
//!   interpose run <scenario>      - Execute a scenario and print every step
//!   interpose inspect <scenario>  - Apply hooks only and print slot chains

use anyhow::Context;
use clap::{Parser, Subcommand};
use interpose::scenario::{Outcome, Scenario, ScenarioReport, ScenarioRunner, SlotReport};
use interpose::RegistryConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "interpose")]
#[command(about = "Run function and metamethod interception scenarios", long_about = None)]
struct Cli {
    /// Registry configuration (JSON)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a scenario and report each step
    Run {
        /// Path to the scenario file
        scenario: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply a scenario's declarations and hooks, then show every slot
    Inspect {
        /// Path to the scenario file
        scenario: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RegistryConfig::load(path)?,
        None => RegistryConfig::default(),
    };
    init_logging(&config.log_level);

    match cli.command {
        Commands::Run { scenario, json } => run_command(&scenario, config, json),
        Commands::Inspect { scenario, json } => inspect_command(&scenario, config, json),
    }
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Scenario::from_json(&source).with_context(|| format!("Failed to parse {}", path.display()))
}

fn run_command(path: &Path, config: RegistryConfig, json: bool) -> anyhow::Result<()> {
    let scenario = load_scenario(path)?;
    let report = ScenarioRunner::run(&scenario, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn inspect_command(path: &Path, config: RegistryConfig, json: bool) -> anyhow::Result<()> {
    let scenario = load_scenario(path)?;
    let slots = ScenarioRunner::dry_run(&scenario, config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&slots)?);
    } else {
        print_slots(&slots);
    }
    Ok(())
}

fn format_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Ok(value) => format!("ok {}", value),
        Outcome::Err(error) => format!("error: {}", error),
    }
}

fn print_report(report: &ScenarioReport) {
    for step in &report.steps {
        println!("[{}] {}: {}", step.index, step.op, format_outcome(&step.outcome));
        for line in &step.trace {
            let indent = "  ".repeat(line.depth + 1);
            let hooked = if line.hooked { " [hook]" } else { "" };
            let method = if line.method.is_empty() {
                String::new()
            } else {
                format!(" method={}", line.method)
            };
            println!(
                "{}{} -> {}{} caller={}{}: {}",
                indent,
                line.slot,
                line.callee,
                hooked,
                line.caller,
                method,
                format_outcome(&line.outcome)
            );
        }
    }

    if !report.slots.is_empty() {
        println!();
        print_slots(&report.slots);
    }
}

fn print_slots(slots: &[SlotReport]) {
    println!("slots:");
    for slot in slots {
        println!("  {}: active {}", slot.slot, slot.active);
        for binding in &slot.chain {
            println!(
                "    #{} hook {} (displaced {}, accessor {})",
                binding.installed_at, binding.hook, binding.original, binding.accessor
            );
        }
    }
}
