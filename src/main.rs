//! exectime CLI Entry Point
//!
//! Runs a pipeline with execution-time instrumentation attached.
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline, events to stdout
//! exectime pipeline.yaml
//!
//! # Write events to a file and address them to a subscriber
//! exectime pipeline.yaml --events-out events.jsonl --client-id ui-1
//!
//! # Exercise the deprecated dispatch signature
//! exectime pipeline.yaml --legacy-dispatch
//! ```

use std::env;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use colored::Colorize;
use log::{error, info};

use exectime::pipeline::{
    load_pipeline, DispatchSignature, EventSink, JsonLinesSink, PromptServer, Runner,
};
use exectime::{ExecutionTimeHook, ResourceSampler, APP_NAME, VERSION};

/// Default pipeline file used when none is specified.
const DEFAULT_PIPELINE: &str = "pipeline.yaml";

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    pipeline_path: Option<String>,
    run_id: Option<String>,
    client_id: Option<String>,
    events_out: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    legacy_dispatch: bool,
    no_report: bool,
    no_events: bool,
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
    eprintln!();
    eprintln!("{} v{}", APP_NAME.bold(), VERSION);
    eprintln!("Execution time instrumentation for task pipelines");
    eprintln!();
}

fn print_usage() {
    println!("Usage: exectime [OPTIONS] [PIPELINE_FILE]");
    println!();
    println!("Arguments:");
    println!("  [PIPELINE_FILE]     Pipeline YAML file (default: {})", DEFAULT_PIPELINE);
    println!();
    println!("Options:");
    println!("  --run-id ID         Identifier of this run (default: timestamp)");
    println!("  --client-id ID      Subscriber that receives per-task events");
    println!("  --events-out PATH   Write events as JSON lines to PATH (default: stdout)");
    println!("  --working-dir PATH  Directory task commands run in");
    println!("  --legacy-dispatch   Use the deprecated recursive dispatch signature");
    println!("  --no-report         Do not print per-task console lines");
    println!("  --no-events         Do not emit metric events");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
}

/// Takes the value following an option.
fn option_value(args: &[String], i: &mut usize, option: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{} requires an argument", option))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1;

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
            "--verbose" | "-v" => config.verbose = true,
            "--legacy-dispatch" => config.legacy_dispatch = true,
            "--no-report" => config.no_report = true,
            "--no-events" => config.no_events = true,
            "--run-id" => config.run_id = Some(option_value(args, &mut i, arg)?),
            "--client-id" => config.client_id = Some(option_value(args, &mut i, arg)?),
            "--events-out" => {
                config.events_out = Some(PathBuf::from(option_value(args, &mut i, arg)?))
            }
            "--working-dir" => {
                config.working_dir = Some(PathBuf::from(option_value(args, &mut i, arg)?))
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.pipeline_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.pipeline_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

fn validate_working_dir(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.is_dir() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }
    info!("Working directory: {}", dir.display());
    Ok(())
}

fn execute<S: EventSink>(
    runner: &Runner,
    server: PromptServer<S>,
    run_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = runner.run(&server, run_id)?;

    eprintln!();
    eprintln!(
        "{} {} tasks in {:.2}s",
        "Completed".green().bold(),
        report.tasks,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let pipeline_path = config
        .pipeline_path
        .unwrap_or_else(|| DEFAULT_PIPELINE.to_string());

    let pipeline = load_pipeline(&pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        e
    })?;

    let mut hook_config = pipeline.instrumentation.clone();
    if config.no_report {
        hook_config = hook_config.with_console_report(false);
    }
    if config.no_events {
        hook_config = hook_config.with_events(false);
    }

    let hook = Arc::new(ExecutionTimeHook::new(ResourceSampler::detect(), hook_config));

    let mut runner = Runner::new(pipeline);
    if config.legacy_dispatch {
        runner.set_dispatch_signature(DispatchSignature::Legacy);
    }
    if let Some(dir) = config.working_dir {
        validate_working_dir(&dir)?;
        runner.set_working_dir(dir);
    }

    let installation = runner.register_hook(hook);
    let points: Vec<String> = installation.points().map(|p| format!("{:?}", p)).collect();
    info!("Instrumentation attached to: {}", points.join(", "));

    let run_id = config
        .run_id
        .unwrap_or_else(|| format!("run-{}", Local::now().format("%Y%m%d-%H%M%S")));

    match config.events_out {
        Some(path) => {
            let file = File::create(&path)?;
            info!("Writing events to: {}", path.display());
            let mut server = PromptServer::new(JsonLinesSink::new(file));
            if let Some(client) = config.client_id {
                server = server.with_client_id(client);
            }
            execute(&runner, server, &run_id)
        }
        None => {
            let mut server = PromptServer::new(JsonLinesSink::new(io::stdout()));
            if let Some(client) = config.client_id {
                server = server.with_client_id(client);
            }
            execute(&runner, server, &run_id)?;
            io::stdout().flush()?;
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
