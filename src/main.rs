use std::path::PathBuf;

use alchitry_loader::config::AppConfig;
use alchitry_loader::core::{AlertLevel, Board, JobEvent, JobReport, JobRequest, JobRunner};
use alchitry_loader::logging::{self, LogConfig};
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "alchitry-loader", version)]
#[command(about = "Program Alchitry boards through the loader tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./alchitry-loader.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    tools_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected boards
    List {
        #[arg(long)]
        json: bool,
    },
    /// Write the FTDI EEPROM of a board
    FlashEeprom(BoardArgs),
    /// Program a bin file into flash or RAM
    Program(ProgramArgs),
    /// Erase the flash of a board
    Erase(BoardArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args)]
struct BoardArgs {
    #[arg(long, value_enum, default_value_t = Board::Au)]
    board: Board,
}

#[derive(Args)]
struct ProgramArgs {
    #[arg(long, value_enum, default_value_t = Board::Au)]
    board: Board,

    /// Load into RAM instead of flash (Au only)
    #[arg(long)]
    ram: bool,

    bin: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))
        .context("Failed to load configuration")?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Config => print_config(&config),
        Commands::List { json } => list_devices(&config, json).await,
        Commands::FlashEeprom(args) => {
            run_job(&config, JobRequest::FlashEeprom { board: args.board }).await
        }
        Commands::Program(args) => {
            if !args.bin.is_file() {
                bail!("Bin file could not be opened! ({})", args.bin.display());
            }
            if args.ram && !args.board.supports_ram_programming() {
                bail!("{} can only be programmed to flash", args.board);
            }
            run_job(
                &config,
                JobRequest::Program {
                    bin: args.bin,
                    board: args.board,
                    use_flash: !args.ram,
                },
            )
            .await
        }
        Commands::Erase(args) => run_job(&config, JobRequest::Erase { board: args.board }).await,
    }
}

fn print_config(config: &AppConfig) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    print!("{content}");
    Ok(())
}

async fn run_job(config: &AppConfig, request: JobRequest) -> Result<()> {
    let (runner, mut events) = JobRunner::new(config.tools());
    runner.start(request)?;

    let report = supervise(&runner, &mut events).await?;
    check_report(report)
}

async fn list_devices(config: &AppConfig, json: bool) -> Result<()> {
    let (runner, mut events) = JobRunner::new(config.tools());
    runner.start_enumerate()?;

    let report = supervise(&runner, &mut events).await?;
    check_report(report)?;

    let devices = runner.devices();

    if json {
        #[derive(Serialize)]
        struct Device<'a> {
            index: usize,
            description: &'a str,
        }

        let devices: Vec<Device> = devices
            .iter()
            .enumerate()
            .map(|(index, description)| Device { index, description })
            .collect();
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else if devices.is_empty() {
        println!("No devices found.");
    } else {
        for (index, description) in devices.iter().enumerate() {
            println!("{index}: {description}");
        }
    }

    Ok(())
}

/// Print status changes and alerts until the job finishes. Ctrl+C stops the job.
async fn supervise(
    runner: &JobRunner,
    events: &mut mpsc::UnboundedReceiver<JobEvent>,
) -> Result<JobReport> {
    let mut last_status = String::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(JobEvent::Progress) => {
                    let status = runner.status();
                    if status != last_status {
                        println!("{status}");
                        last_status = status;
                    }
                }
                Some(JobEvent::Alert(alert)) => match alert.level {
                    AlertLevel::Info => println!("{}", alert.message),
                    AlertLevel::Error => eprintln!("Error: {}", alert.message),
                },
                Some(JobEvent::Finished(report)) => return Ok(report),
                None => bail!("Job runner stopped without reporting a result"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, stopping job");
                runner.stop();
            }
        }
    }
}

fn check_report(report: JobReport) -> Result<()> {
    info!(
        id = %report.id,
        kind = %report.kind,
        duration_ms = report.duration().as_millis() as u64,
        "Job report"
    );

    if !report.outcome.is_success() {
        bail!("{} job {}", report.kind, report.outcome);
    }
    Ok(())
}
