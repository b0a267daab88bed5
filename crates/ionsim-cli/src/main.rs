//! # ionsim CLI
//!
//! Command-line runner for the built-in cell models.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use ionsim_model::{models, CellModel, VariableCategory};
use ionsim_sim::{sweep, Apds, ProgressReporter, RunOutput, SimulationConfig};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "ionsim")]
#[command(version = "0.1.0")]
#[command(about = "Cellular electrophysiology simulation", long_about = None)]
struct Cli {
    /// Print debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List built-in models and their variables
    List {
        /// Only show this model
        model: Option<String>,
    },

    /// Run a simulation and write the log
    Run {
        /// Model name
        model: String,
        /// JSON simulation config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Duration (overrides the config)
        #[arg(short, long)]
        duration: Option<f64>,
        /// Periodic log interval (overrides the config)
        #[arg(long)]
        log_interval: Option<f64>,
        /// Output file (stdout summary only when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Output format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: OutputFormat,
        /// Cancel the run after this many seconds of wall-clock time
        #[arg(long)]
        max_seconds: Option<f64>,
    },

    /// Run one simulation per value of a constant, in parallel
    Sweep {
        /// Model name
        model: String,
        /// Literal or parameter to vary
        #[arg(short, long)]
        parameter: String,
        /// Comma-separated values
        #[arg(long, value_delimiter = ',', required = true)]
        values: Vec<f64>,
        /// JSON simulation config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Duration (overrides the config)
        #[arg(short, long)]
        duration: Option<f64>,
    },
}

/// Progress bar that cancels the run after a wall-clock deadline.
struct BarReporter {
    bar: ProgressBar,
    deadline: Option<Instant>,
}

impl BarReporter {
    fn new(max_seconds: Option<f64>) -> anyhow::Result<Self> {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.green/blue}] {percent}% | {elapsed} | {msg}")?
                .progress_chars("=> "),
        );
        let deadline = match max_seconds {
            Some(s) if s.is_finite() && s >= 0.0 => Some(Instant::now() + Duration::from_secs_f64(s)),
            Some(s) => bail!("--max-seconds must be non-negative, got {s}"),
            None => None,
        };
        Ok(Self { bar, deadline })
    }
}

impl ProgressReporter for BarReporter {
    fn enter(&mut self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn exit(&mut self) {
        self.bar.finish_and_clear();
    }

    fn update(&mut self, progress: f64) -> bool {
        self.bar.set_position((progress.clamp(0.0, 1.0) * 1000.0) as u64);
        self.deadline.map_or(true, |deadline| Instant::now() < deadline)
    }
}

fn find_model(name: &str) -> anyhow::Result<Arc<dyn CellModel>> {
    match models::by_name(name) {
        Some(model) => Ok(model),
        None => bail!(
            "Unknown model '{name}', expected one of: {}",
            models::BUILT_IN.join(", ")
        ),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SimulationConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            log::debug!("Loaded simulation config from {}", path.display());
            Ok(SimulationConfig::from_json(&text)?)
        }
        None => Ok(SimulationConfig::default()),
    }
}

fn print_model(model: &dyn CellModel) {
    let topology = model.topology();
    println!("{}", model.name().cyan().bold());
    for (label, category) in [
        ("states", VariableCategory::State),
        ("intermediary", VariableCategory::Intermediary),
        ("bound", VariableCategory::Bound),
    ] {
        let names: Vec<String> = topology
            .variables(category)
            .into_iter()
            .map(|v| topology.name_of(v))
            .collect();
        println!("  {:<14} {}", label.green(), names.join(", "));
    }
    for c in &topology.literals {
        println!("  {:<14} {} = {}", "literal".green(), c.name, c.value);
    }
    for c in &topology.parameters {
        println!("  {:<14} {} = {}", "parameter".green(), c.name, c.value);
    }
    let labels = topology.pace_labels();
    if !labels.is_empty() {
        println!("  {:<14} {}", "pacing".green(), labels.join(", "));
    }
    println!();
}

fn write_output(output: &RunOutput, path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let writer = BufWriter::new(file);
    match format {
        OutputFormat::Csv => output.log.write_csv(writer)?,
        OutputFormat::Json => serde_json::to_writer_pretty(writer, &output.log)?,
    }
    Ok(())
}

fn print_apds(apds: &Apds) {
    if apds.is_empty() {
        println!("  {}", "No action potentials detected".yellow());
    }
    for (start, duration) in apds.starts.iter().zip(&apds.durations) {
        println!("  APD at t = {start:.3}: {duration:.3}");
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::List { model } => {
            println!("{}", "Built-in models:".green().bold());
            println!();
            let names: Vec<&str> = match &model {
                Some(name) => vec![name.as_str()],
                None => models::BUILT_IN.to_vec(),
            };
            for name in names {
                print_model(find_model(name)?.as_ref());
            }
        }

        Commands::Run {
            model,
            config,
            duration,
            log_interval,
            output,
            format,
            max_seconds,
        } => {
            let definition = find_model(&model)?;
            let mut config = load_config(config.as_deref())?;
            if let Some(interval) = log_interval {
                config.log_interval = Some(interval);
                config.log_times = None;
            }
            let duration = duration.or(config.duration).unwrap_or(1000.0);
            let mut sim = config.build(definition)?;
            if let Some(pre) = config.pre {
                println!("{} {pre}", "Pre-pacing for".green().bold());
                sim.pre(pre)?;
            }

            println!("{} {model} for {duration}", "Running".green().bold());
            let mut reporter = BarReporter::new(max_seconds)?;
            let result = sim.run_with_progress(duration, config.run_options()?, &mut reporter)?;

            println!(
                "  {} points logged, {} steps, {} evaluations, {:.3} s",
                result.log.len(),
                result.stats.steps,
                result.evaluations,
                result.realtime
            );
            let state: Vec<String> = result.state.iter().map(|v| format!("{v:.6}")).collect();
            println!("  final state: [{}]", state.join(", "));
            if config.apd.is_some() {
                print_apds(&Apds::from_crossings(&result.crossings));
            }
            if let Some(path) = output {
                write_output(&result, &path, format)?;
                println!("{} {}", "Log written to".green().bold(), path.display());
            }
        }

        Commands::Sweep {
            model,
            parameter,
            values,
            config,
            duration,
        } => {
            let definition = find_model(&model)?;
            let config = load_config(config.as_deref())?;
            let duration = duration.or(config.duration).unwrap_or(1000.0);
            let mut sim = config.build(definition)?;
            if let Some(pre) = config.pre {
                sim.pre(pre)?;
            }

            println!(
                "{} {parameter} over {} values",
                "Sweeping".green().bold(),
                values.len()
            );
            let results = sweep(&sim, &parameter, &values, duration, &config.run_options()?);
            for (value, result) in values.iter().zip(results) {
                match result {
                    Ok(output) => {
                        let state: Vec<String> =
                            output.state.iter().map(|v| format!("{v:.6}")).collect();
                        println!("{} = {}: [{}]", parameter.cyan(), value, state.join(", "));
                        if config.apd.is_some() {
                            print_apds(&Apds::from_crossings(&output.crossings));
                        }
                    }
                    Err(failure) => {
                        println!("{} = {}: {}", parameter.cyan(), value, failure.to_string().red());
                    }
                }
            }
        }
    }

    Ok(())
}
