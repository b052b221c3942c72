//! # wifisim
//!
//! Command line entry point for the wifisim Wi-Fi PHY simulator.

use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wifi_ppdu::{Band, ModulationClass, WifiMode};
use wifisim_common::metric_defs::{self, MetricKind};
use wifisim_model::{load_model, load_models};
use wifisim_phy::channel::channel_table;
use wifisim_runner::metrics_export::{self, InMemoryRecorder};
use wifisim_runner::{run_model, RunnerError, SimTime};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration into seconds.
///
/// Accepts a plain number of seconds (`2.5`) or a number with one of the
/// suffixes `us`, `ms`, `s`, `m`.
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("Invalid duration '{}'", s))?;
    let scale = match unit {
        "" | "s" => 1.0,
        "ms" => 1e-3,
        "us" => 1e-6,
        "m" => 60.0,
        other => return Err(format!("Unknown duration unit '{}' in '{}'. Use us, ms, s or m.", other, s)),
    };
    let secs = value * scale;
    if secs <= 0.0 {
        return Err(format!("Duration must be positive: '{}'", s));
    }
    Ok(secs)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at end of simulation.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum MetricsOutputFormat {
    /// JSON format for programmatic consumption.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum BandArg {
    #[value(name = "2.4ghz")]
    Ghz2_4,
    #[value(name = "5ghz")]
    Ghz5,
    #[value(name = "6ghz")]
    Ghz6,
}

impl From<BandArg> for Band {
    fn from(arg: BandArg) -> Self {
        match arg {
            BandArg::Ghz2_4 => Band::Ghz2_4,
            BandArg::Ghz5 => Band::Ghz5,
            BandArg::Ghz6 => Band::Ghz6,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ClassArg {
    Ofdm,
    Ht,
    Vht,
    He,
}

impl From<ClassArg> for ModulationClass {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Ofdm => ModulationClass::Ofdm,
            ClassArg::Ht => ModulationClass::Ht,
            ClassArg::Vht => ModulationClass::Vht,
            ClassArg::He => ModulationClass::He,
        }
    }
}

/// wifisim - discrete-event Wi-Fi PHY simulator
#[derive(Parser, Debug)]
#[command(name = "wifisim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from one or more YAML model files
    Run(RunConfig),
    /// List the operating channel table
    Channels(ChannelsConfig),
    /// List modulation modes and their data rates
    Modes(ModesConfig),
    /// List all available metrics with descriptions and labels
    Metrics,
}

#[derive(Parser, Debug)]
pub struct RunConfig {
    /// Model files, merged in order (later files override earlier ones)
    #[arg(required = true)]
    pub models: Vec<PathBuf>,

    /// Random seed (overrides `simulation.seed`)
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Simulated duration, e.g. `2`, `500ms`, `1.5s` (overrides `simulation.duration_s`)
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Write the JSON trace of PHY activity to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Export metrics at the end of the run
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// File for the metrics export (stdout if not specified)
    #[arg(long, requires = "metrics_output")]
    pub metrics_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ChannelsConfig {
    /// Only list channels in this band
    #[arg(long, value_enum)]
    pub band: Option<BandArg>,

    /// Only list channels of this width in MHz
    #[arg(long)]
    pub width: Option<u16>,
}

#[derive(Parser, Debug)]
pub struct ModesConfig {
    /// Only list modes of this class
    #[arg(long, value_enum)]
    pub class: Option<ClassArg>,

    /// Channel width in MHz
    #[arg(long, default_value = "20")]
    pub width: u16,

    /// Guard interval in ns
    #[arg(long, default_value = "800")]
    pub gi: u16,

    /// Spatial streams (ignored by HT modes, whose index encodes them)
    #[arg(long, default_value = "1")]
    pub nss: u8,
}

// ============================================================================
// Commands
// ============================================================================

fn install_metrics_recorder() -> Option<InMemoryRecorder> {
    let recorder = InMemoryRecorder::new();
    if let Err(e) = metrics::set_global_recorder(recorder.clone()) {
        warn!("Failed to set metrics recorder: {}", e);
        return None;
    }
    for def in metric_defs::ALL {
        match def.kind {
            MetricKind::Counter => metrics::describe_counter!(def.name, def.description),
            MetricKind::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricKind::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
    Some(recorder)
}

fn run_command(config: RunConfig) -> Result<(), RunnerError> {
    let recorder = if config.metrics_output.is_some() {
        install_metrics_recorder()
    } else {
        None
    };

    let model = if config.models.len() == 1 {
        load_model(&config.models[0])?
    } else {
        let paths: Vec<&Path> = config.models.iter().map(PathBuf::as_path).collect();
        load_models(&paths)?
    };

    let trace_output: Option<Box<dyn Write>> = match &config.output {
        Some(path) => Some(Box::new(std::io::BufWriter::new(std::fs::File::create(path)?))),
        None => None,
    };
    let duration = config.duration.map(SimTime::from_secs);
    let stats = run_model(&model, config.seed, duration, trace_output)?;

    match (config.metrics_output, recorder) {
        (Some(format), Some(recorder)) => {
            let snapshot = recorder.snapshot(stats.simulation_time_us as f64 / 1e6);
            let mut writer: Box<dyn Write> = match &config.metrics_file {
                Some(path) => Box::new(std::fs::File::create(path)?),
                None => Box::new(std::io::stdout().lock()),
            };
            match format {
                MetricsOutputFormat::Json => metrics_export::export_json(&snapshot, &mut writer)?,
                MetricsOutputFormat::Prometheus => metrics_export::export_prometheus(&snapshot, &mut writer)?,
            }
            if config.metrics_file.is_some() {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        _ => println!("{}", serde_json::to_string_pretty(&stats)?),
    }
    Ok(())
}

fn channels_command(config: ChannelsConfig) {
    let band = config.band.map(Band::from);
    println!("{:>6} {:>10} {:>6}  {:<6} type", "number", "freq_mhz", "width", "band");
    for entry in channel_table() {
        if band.is_some_and(|b| b != entry.band) || config.width.is_some_and(|w| w != entry.width_mhz) {
            continue;
        }
        println!(
            "{:>6} {:>10} {:>6}  {:<6} {}",
            entry.number,
            entry.frequency_mhz,
            entry.width_mhz,
            entry.band.as_label(),
            entry.channel_type
        );
    }
}

fn modes_command(config: ModesConfig) {
    let classes: Vec<ModulationClass> = match config.class {
        Some(class) => vec![class.into()],
        None => ModulationClass::ALL.to_vec(),
    };
    println!("{:<16} {:<8} {:<6} {:>12}", "mode", "mod", "rate", "Mbit/s");
    for class in classes {
        for mode in WifiMode::all(class) {
            let rate = mode.data_rate(config.width, config.gi, config.nss);
            if rate == 0 {
                continue;
            }
            println!(
                "{:<16} {:<8} {:<6} {:>12.1}",
                mode.name(),
                mode.modulation().to_string(),
                mode.code_rate().to_string(),
                rate as f64 / 1e6
            );
        }
    }
}

fn metrics_command() {
    println!("wifisim Available Metrics");
    println!("=========================\n");
    println!("All metrics carry the labels:");
    println!("  - node: Node name from the model");
    println!("  - node_type: ap or sta for PHY metrics, the agent kind for agent metrics");
    println!();

    let categories = [
        ("PHY", "wifisim.phy."),
        ("Medium", "wifisim.medium."),
        ("Ping / Echo", "wifisim.ping."),
        ("Ping / Echo", "wifisim.echo."),
        ("UL OFDMA", "wifisim.trigger."),
        ("DL MU", "wifisim.dl_mu."),
        ("Simulation", "wifisim.sim."),
    ];
    let mut last_category = "";
    for (category, prefix) in categories {
        let defs: Vec<_> = metric_defs::ALL.iter().filter(|m| m.name.starts_with(prefix)).collect();
        if defs.is_empty() {
            continue;
        }
        if category != last_category {
            println!("## {}\n", category);
            last_category = category;
        }
        for metric in defs {
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            if !metric.unit_str().is_empty() {
                println!("    Unit: {}", metric.unit_str());
            }
            if !metric.description.is_empty() {
                println!("    Description: {}", metric.description);
            }
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }
}

fn main() -> Result<(), RunnerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => run_command(config)?,
        Commands::Channels(config) => channels_command(config),
        Commands::Modes(config) => modes_command(config),
        Commands::Metrics => metrics_command(),
    }
    Ok(())
}
