//! StateRunner CLI Entry Point
//!
//! Loads a state machine definition, runs it once and reports the result.
//!
//! # Usage
//!
//! ```bash
//! # Run a machine
//! staterunner deploy.yaml
//!
//! # Pass parameters (JSON values, plain strings otherwise)
//! staterunner deploy.yaml --param version=1.4.2 --param 'hosts=["web-1","web-2"]'
//!
//! # Use four workers and give up after ten minutes
//! staterunner deploy.yaml --workers 4 --timeout 600
//! ```

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use staterunner::execution::{ExecutionArgs, ExecutionStatus, StateMachineExecutor};
use staterunner::machine::{load_state_machine, quick_validate};
use staterunner::{EngineConfig, APP_NAME, VERSION};

/// Default run timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    machine_path: Option<String>,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
    params: BTreeMap<String, Value>,
    timeout_secs: Option<u64>,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("State Machine Execution Engine");
    println!();
}

fn print_usage() {
    println!("Usage: staterunner [OPTIONS] <MACHINE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <MACHINE_FILE>      Path to state machine YAML file");
    println!();
    println!("Options:");
    println!("  --config PATH       Engine config file (default: $STATERUNNER_CONFIG or staterunner.yaml)");
    println!("  --workers N         Worker threads (overrides the config file)");
    println!("  --param KEY=VALUE   Run parameter, repeatable");
    println!("  --timeout SECS      Give up waiting after SECS seconds (default: {})", DEFAULT_TIMEOUT_SECS);
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  staterunner deploy.yaml");
    println!("  staterunner deploy.yaml --param version=1.4.2 --workers 8");
}

/// Splits `key=value`; the value is read as JSON when it parses.
fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid parameter (expected KEY=VALUE): {}", raw))?;
    if key.trim().is_empty() {
        return Err(format!("Parameter name missing: {}", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: usize, option: &str) -> Result<&'a str, String> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--config" => {
                i += 1;
                config.config_path = Some(PathBuf::from(option_value(args, i, arg)?));
            }
            "--workers" => {
                i += 1;
                let value = option_value(args, i, arg)?;
                config.workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid workers value: {}", value))?,
                );
            }
            "--param" => {
                i += 1;
                let (key, value) = parse_param(option_value(args, i, arg)?)?;
                config.params.insert(key, value);
            }
            "--timeout" => {
                i += 1;
                let value = option_value(args, i, arg)?;
                config.timeout_secs = Some(
                    value
                        .parse()
                        .map_err(|_| format!("Invalid timeout value: {}", value))?,
                );
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.machine_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.machine_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

fn status_label(status: ExecutionStatus) -> String {
    let text = status.as_str();
    match status {
        ExecutionStatus::Success => text.green().to_string(),
        ExecutionStatus::Failed | ExecutionStatus::Error => text.red().to_string(),
        ExecutionStatus::Aborted => text.yellow().to_string(),
        _ => text.cyan().to_string(),
    }
}

/// Main application entry point.
fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(cli.verbose);
    print_banner();

    let Some(machine_path) = cli.machine_path else {
        print_usage();
        return Err("No state machine file given".into());
    };

    let mut engine_config = match &cli.config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };
    if let Some(workers) = cli.workers {
        engine_config = engine_config.with_worker_threads(workers);
    }
    info!("Worker threads: {}", engine_config.worker_threads);

    let machine = load_state_machine(&machine_path).map_err(|e| {
        error!("Failed to load state machine: {}", e);
        format!("Could not load state machine from '{}': {}", machine_path, e)
    })?;
    for warning in quick_validate(&machine) {
        warn!("{}", warning);
    }

    let executor = StateMachineExecutor::with_config(engine_config);
    let machine = executor.register_machine(machine)?;
    executor.start_workers()?;

    let args = ExecutionArgs {
        params: cli.params,
        ..ExecutionArgs::default()
    };
    let run = executor.execute(&machine.id, args)?;
    let timeout = Duration::from_secs(cli.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let finished = executor.wait_for_run(&run.id, timeout);
    executor.shutdown();
    let finished = finished?;

    println!();
    println!("States:");
    for instance in executor.instances(&run.id)? {
        let message = instance
            .error_message
            .as_deref()
            .map(|m| format!(" - {}", m))
            .unwrap_or_default();
        println!(
            "  {:24} {}{}",
            instance.label(),
            status_label(instance.status),
            message
        );
    }

    if let Some(timeline) = executor.timeline(&run.id) {
        print!("{}", timeline.gantt_chart());
    }

    println!();
    println!("Run {}: {}", finished.id, status_label(finished.status));

    Ok(if finished.status == ExecutionStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
