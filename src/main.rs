//! CLI entry point for transport_daq
//!
//! ```bash
//! transport_daq list
//! transport_daq preview config/procedures/gate_sweep.toml
//! transport_daq estimate config/procedures/hall_sweep.toml --set field_step_a=0.05
//! transport_daq run config/procedures/gate_then_hall.toml --output runs/B3
//! transport_daq --simulate sequence config/procedures/dwell_series.toml
//! ```
//!
//! Ctrl-C stops the running procedure; the sources are zeroed and switched
//! off before the program exits.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use transport_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use transport_daq::data::{CsvResultWriter, FanOut, ProgressLogger, ResultSink};
use transport_daq::hardware::registry::{create_simulated_registry, DeviceRegistry};
use transport_daq::procedures::{
    execute_procedure_safely, run_sequence, CancelHandle, ConfigOverride, EmergencyStopFlag,
    ProcedureConfig, ProcedureContext, ProcedureRegistry, SequenceConfig,
};
use transport_daq::telemetry::{self, TracingConfig};

/// Progress is logged every this many percent.
const PROGRESS_LOG_STEP: f64 = 10.0;

#[derive(Parser)]
#[command(name = "transport_daq")]
#[command(about = "Gate, IV and anomalous Hall sweeps on SCPI instruments", long_about = None)]
struct Cli {
    /// Application configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output directory (overrides storage.output_dir)
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Replace every configured instrument by a simulated one
    #[arg(long, global = true)]
    simulate: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a procedure file
    Run {
        procedure: PathBuf,
        /// Override a value, e.g. `--set params.dwell_time_s=10`
        #[arg(long = "set", value_name = "PATH=VALUE")]
        overrides: Vec<String>,
    },
    /// Print the estimated duration of a procedure file
    Estimate {
        procedure: PathBuf,
        #[arg(long = "set", value_name = "PATH=VALUE")]
        overrides: Vec<String>,
    },
    /// Print the setpoints a procedure file would visit
    Preview {
        procedure: PathBuf,
        #[arg(long = "set", value_name = "PATH=VALUE")]
        overrides: Vec<String>,
    },
    /// Run every step of a sequence file
    Sequence { sequence: PathBuf },
    /// List the procedure types
    List,
    /// Connect the configured instruments and list them
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate()?;
    if let Some(output) = &cli.output {
        config.storage.output_dir = output.clone();
    }

    telemetry::init(TracingConfig::from_app_config(&config)?.with_verbosity(cli.verbose))?;

    match cli.command {
        Commands::List => {
            list_procedures();
            Ok(())
        }
        Commands::Estimate {
            procedure,
            overrides,
        } => {
            let procedure_config = load_procedure(&procedure, &overrides)?;
            estimate(&procedure_config)
        }
        Commands::Preview {
            procedure,
            overrides,
        } => {
            let procedure_config = load_procedure(&procedure, &overrides)?;
            preview(&procedure_config)
        }
        Commands::Devices => {
            let devices = connect(&config, cli.simulate).await?;
            let registry = devices.read().await;
            for device in registry.list_devices() {
                println!(
                    "{:<12} {:<28} {:<24} {:?}",
                    device.id, device.name, device.driver_type, device.capabilities
                );
            }
            registry.shutdown_all().await;
            Ok(())
        }
        Commands::Run {
            procedure,
            overrides,
        } => {
            let procedure_config = load_procedure(&procedure, &overrides)?;
            let devices = connect(&config, cli.simulate).await?;
            let outcome = run_once(&config, &procedure_config, devices.clone()).await;
            devices.read().await.shutdown_all().await;
            outcome
        }
        Commands::Sequence { sequence } => {
            let sequence = SequenceConfig::from_file(&sequence)?;
            let devices = connect(&config, cli.simulate).await?;
            let outcome = run_steps(&config, &sequence, devices.clone()).await;
            devices.read().await.shutdown_all().await;
            outcome
        }
    }
}

fn load_procedure(path: &Path, overrides: &[String]) -> Result<ProcedureConfig> {
    let mut config = ProcedureConfig::from_file(path)?;
    let overrides = overrides
        .iter()
        .map(|o| ConfigOverride::parse(o))
        .collect::<Result<Vec<_>>>()?;
    config.apply_overrides(&overrides)?;
    Ok(config)
}

/// Registry for commands that do not touch hardware.
fn offline_procedures() -> ProcedureRegistry {
    ProcedureRegistry::new(Arc::new(RwLock::new(DeviceRegistry::new())))
}

fn list_procedures() {
    for info in offline_procedures().list_types() {
        println!("{} - {}", info.type_id, info.name);
        println!("    {}", info.description);
        for role in &info.roles {
            let optional = if role.optional { " (optional)" } else { "" };
            println!(
                "    role {}: {}{}",
                role.role_id, role.capability, optional
            );
        }
        for param in &info.parameters {
            println!(
                "    {} = {} {}",
                param.name,
                param.default.as_deref().unwrap_or("-"),
                param.units.as_deref().unwrap_or("")
            );
        }
    }
}

fn estimate(config: &ProcedureConfig) -> Result<()> {
    let procedure = offline_procedures().create_from_config(config)?;
    let estimate = procedure.estimate()?;
    let secs = estimate.duration.as_secs();
    println!(
        "{}: about {}h {:02}m {:02}s, finishing around {}",
        config.procedure_type,
        secs / 3600,
        secs % 3600 / 60,
        secs % 60,
        estimate.finished_at.format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

fn preview(config: &ProcedureConfig) -> Result<()> {
    let procedure = offline_procedures().create_from_config(config)?;
    for leg in procedure.preview() {
        let values: Vec<String> = leg.values.iter().map(|v| format!("{}", v)).collect();
        println!(
            "{} ({} points, {}): {}",
            leg.label,
            leg.values.len(),
            leg.unit,
            values.join(", ")
        );
    }
    Ok(())
}

async fn connect(config: &AppConfig, simulate: bool) -> Result<Arc<RwLock<DeviceRegistry>>> {
    let registry = if simulate && config.instruments.is_empty() {
        tracing::info!("No instruments configured; using the simulated bench");
        create_simulated_registry().await?
    } else {
        DeviceRegistry::from_definitions(&config.device_configs(), simulate).await
    };
    Ok(Arc::new(RwLock::new(registry)))
}

/// CSV file plus progress log lines.
fn result_sink(config: &AppConfig, prefix: &str) -> Box<dyn ResultSink> {
    Box::new(
        FanOut::new()
            .with(CsvResultWriter::new(&config.storage.output_dir, prefix))
            .with(ProgressLogger::new(PROGRESS_LOG_STEP)),
    )
}

fn file_prefix(config: &AppConfig, procedure: &ProcedureConfig) -> String {
    if config.storage.file_prefix.is_empty() {
        procedure.procedure_type.clone()
    } else {
        config.storage.file_prefix.clone()
    }
}

/// Cancel `handle` on Ctrl-C.
fn cancel_on_ctrl_c(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, stopping");
            handle.cancel();
        }
    });
}

async fn run_once(
    config: &AppConfig,
    procedure_config: &ProcedureConfig,
    devices: Arc<RwLock<DeviceRegistry>>,
) -> Result<()> {
    let procedures = ProcedureRegistry::new(devices.clone());
    let mut procedure = procedures.create_from_config(procedure_config)?;

    let sink = result_sink(config, &file_prefix(config, procedure_config));
    let (ctx, _progress) = ProcedureContext::new(
        uuid::Uuid::new_v4().to_string(),
        procedure_config.get_assignments(),
        devices,
        sink,
    );
    cancel_on_ctrl_c(ctx.cancel_handle());

    let result = execute_procedure_safely(procedure.as_mut(), ctx, EmergencyStopFlag::new()).await?;
    println!("{}", result.summary());
    Ok(())
}

async fn run_steps(
    config: &AppConfig,
    sequence: &SequenceConfig,
    devices: Arc<RwLock<DeviceRegistry>>,
) -> Result<()> {
    let procedures = ProcedureRegistry::new(devices);
    let cancel = CancelHandle::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = run_sequence(
        sequence,
        &procedures,
        cancel,
        EmergencyStopFlag::new(),
        |step, procedure| {
            let prefix = format!("{}_step{}", file_prefix(config, procedure), step);
            Ok(result_sink(config, &prefix))
        },
    )
    .await?;

    for (i, result) in report.results.iter().enumerate() {
        println!("step {}: {}", i + 1, result.summary());
    }
    if report.skipped > 0 {
        println!("{} step(s) not run", report.skipped);
    }
    if report.results.iter().any(|r| r.error.is_some()) {
        bail!("Sequence '{}' stopped on a failed step", sequence.name);
    }
    Ok(())
}
