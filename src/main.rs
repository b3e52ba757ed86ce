//! gpupilot - Main entry point
//!
//! Parses the command line, wires the runner, detector and orchestrator
//! together and renders results as text or JSON.

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use gpupilot::cli::{Cli, Commands, TweakCommands};
use gpupilot::command_executor::{CommandRunner, DryRunRunner, ExecutionMode, SystemCommandRunner};
use gpupilot::config::PilotConfig;
use gpupilot::error::PilotError;
use gpupilot::orchestrator::{Orchestrator, ProgressEvent};
use gpupilot::process_guard::{self, CancelFlag};
use gpupilot::transaction::{TransactionReport, TransactionStatus};
use gpupilot::worker::TransactionWorker;
use gpupilot::{monitor, sanity, tweaks, versions};

/// Exit status when the host cannot run the requested operation
const EXIT_UNSUPPORTED: i32 = 2;

/// Initialize tracing: `info` by default, `debug` with `-v`, `RUST_LOG` wins
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli.command);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            match e.downcast_ref::<PilotError>() {
                Some(PilotError::EnvironmentUnsupported(_)) => EXIT_UNSUPPORTED,
                _ => 1,
            }
        }
    };
    std::process::exit(code);
}

fn build_runner(mode: ExecutionMode, dry_run: bool) -> Arc<dyn CommandRunner> {
    let system = SystemCommandRunner::new(mode);
    if dry_run {
        info!("Dry-run mode: privileged commands will be printed, not executed");
        Arc::new(DryRunRunner::new(system))
    } else {
        Arc::new(system)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

fn run(cli: Cli) -> Result<i32> {
    let config = PilotConfig::load_or_default(cli.config.as_deref())?;
    let mode = ExecutionMode::detect(cli.simulate || config.simulate);
    let runner = build_runner(mode, cli.dry_run);
    // Nothing is spawned, so the elevation helper need not exist
    let skip_helper_check = mode.is_simulated() || cli.dry_run;

    let cancel = CancelFlag::new();
    if let Err(e) = process_guard::init_signal_handlers(&cancel) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let mut orchestrator = Orchestrator::for_host(Arc::clone(&runner), config)
        .with_cancel_flag(cancel)
        .with_snapshot(cli.snapshot);

    match &cli.command {
        Commands::Detect { refresh, full } => {
            let detector = orchestrator.detector();
            if *full {
                if *refresh {
                    detector.detect(true);
                }
                let info = detector.get_full_system_info();
                if cli.json {
                    print_json(&info)?;
                } else {
                    for line in info.diagnostic_report() {
                        println!("{}", line);
                    }
                }
            } else {
                let snapshot = detector.detect(*refresh);
                if cli.json {
                    print_json(&snapshot)?;
                } else {
                    println!("{}", snapshot);
                }
            }
            Ok(0)
        }

        Commands::Versions => {
            let available =
                versions::available_versions(runner.as_ref(), orchestrator.package_manager());
            if cli.json {
                print_json(&available)?;
            } else {
                for version in &available.versions {
                    let marker = if available.recommended.as_deref() == Some(version.as_str()) {
                        " (recommended)"
                    } else {
                        ""
                    };
                    println!("{}{}", version, marker);
                }
            }
            Ok(0)
        }

        Commands::Stats => {
            #[derive(Serialize)]
            struct Stats {
                gpu: monitor::GpuStats,
                system: monitor::SystemStats,
            }
            let stats = Stats {
                gpu: monitor::gpu_stats(runner.as_ref()),
                system: monitor::system_stats(runner.as_ref()),
            };
            if cli.json {
                print_json(&stats)?;
            } else {
                println!(
                    "GPU: {}°C, {}% load, {}/{} MiB",
                    stats.gpu.temp, stats.gpu.load, stats.gpu.mem_used, stats.gpu.mem_total
                );
                println!(
                    "CPU: {}% load, {}°C | RAM: {}/{} MB ({}%)",
                    stats.system.cpu_load,
                    stats.system.cpu_temp,
                    stats.system.ram_used,
                    stats.system.ram_total,
                    stats.system.ram_percent
                );
            }
            Ok(0)
        }

        Commands::Tweak {
            tweak: TweakCommands::PrimeQuery,
        } => {
            match tweaks::prime_query(runner.as_ref()) {
                Ok(profile) => println!("{}", profile),
                Err(e) => {
                    warn!("PRIME query failed: {}", e);
                    println!("unknown");
                }
            }
            Ok(0)
        }

        Commands::Tweak { tweak } => {
            preflight(&orchestrator, runner.as_ref(), skip_helper_check)?;
            let Some(tweak) = tweak.to_tweak() else {
                return Ok(0);
            };
            let report = tweaks::apply(&mut orchestrator, tweak)?;
            if !cli.json {
                for line in &report.log {
                    println!("{}", line);
                }
            }
            render_report(&report, cli.json)
        }

        Commands::Reboot => {
            if tweaks::request_reboot(runner.as_ref()) {
                Ok(0)
            } else {
                Ok(1)
            }
        }

        command => {
            let op = command
                .to_operation()
                .context("Command does not map to a driver operation")?;
            preflight(&orchestrator, runner.as_ref(), skip_helper_check)?;

            let worker = TransactionWorker::new();
            let handle = worker.submit(orchestrator, op)?;
            let json = cli.json;
            let (report, _) = handle.wait_with(|event| match event {
                ProgressEvent::Log(line) if !json => println!("{}", line),
                ProgressEvent::Progress(pct) => debug!("Progress: {}%", pct),
                _ => {}
            })?;
            render_report(&report, cli.json)
        }
    }
}

fn preflight(orchestrator: &Orchestrator, runner: &dyn CommandRunner, skip_helper: bool) -> Result<()> {
    sanity::preflight(runner, orchestrator.config(), orchestrator.package_manager(), skip_helper)?;
    Ok(())
}

/// Print the report summary (or the JSON report) and map its status to an
/// exit code.
fn render_report(report: &TransactionReport, json: bool) -> Result<i32> {
    if json {
        print_json(report)?;
    } else {
        match report.status {
            TransactionStatus::Succeeded => println!("✓ {}", report.summary()),
            _ => eprintln!("✗ {}", report.summary()),
        }
    }
    Ok(report.status.exit_code())
}
