//! Thin operator front-end: load a session configuration, run it, print
//! the records. All logic lives in the library; this binary only maps
//! commands onto core operations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use photon_daq::config::Settings;
use photon_daq::core::RunOutcome;
use photon_daq::devices::AdapterFactory;
use photon_daq::session::SessionController;

#[derive(Parser)]
#[command(name = "photon_daq", about = "Run a synchronized acquisition session")]
struct Cli {
    /// Path to the session configuration (default: config/default.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit records as JSON lines instead of the table view
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Execute the configured acquisition run (default)
    Run,
    /// Print the configured devices and exit
    ListDevices,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::ListDevices => {
            for device in &settings.devices {
                println!(
                    "{:<16} {:<14} unit={} endpoint={}",
                    device.name, device.class, device.unit, device.transport.endpoint
                );
            }
            Ok(())
        }
        Command::Run => run(settings, cli.json).await,
    }
}

async fn run(settings: Settings, json: bool) -> Result<()> {
    let config = settings
        .into_session_config()
        .context("invalid session configuration")?;

    let mut session = SessionController::new(AdapterFactory::new());
    let run_id = session.start(config).await.context("failed to start run")?;
    info!("run {} started", run_id);

    let report = session.wait().await.context("run task failed")?;

    for record in &report.result.records {
        if json {
            println!("{}", serde_json::to_string(record)?);
            continue;
        }
        println!("repeat {:>3} @ {}", record.repeat_index, record.timestamp);
        for (key, reading) in &record.readings {
            println!("  {:<24} {:>14.6} {}", key, reading.value, reading.unit);
        }
    }

    match report.outcome {
        RunOutcome::Completed => {
            println!(
                "run {} completed: {} record(s)",
                report.result.run_id,
                report.result.records.len()
            );
            Ok(())
        }
        RunOutcome::Aborted { error, partial } => {
            println!(
                "run {} aborted after {} record(s) ({} partial reading(s) discarded)",
                report.result.run_id,
                report.result.records.len(),
                partial.len()
            );
            Err(error).context("run aborted")
        }
    }
}
