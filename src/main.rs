//! ReconFlow CLI Entry Point
//!
//! Runs a single module file from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Run a module with its defaults
//! reconflow modules/recon/subdomains.yml
//!
//! # Set module variables
//! reconflow modules/recon/ports.yml --set target=example.com --set service_scan=true
//!
//! # Write output into a project directory
//! reconflow ports.yml --project /data/acme --set target=example.com
//!
//! # Resolve sub-modules from a module library
//! reconflow full.yml --modules ./modules --global shodan_key=XXXX
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use reconflow::{EngineError, ModuleEngine, ModuleRegistry, RunContext, APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    module_path: Option<String>,
    options: Vec<(String, String)>,
    globals: Vec<(String, String)>,
    project_dir: Option<PathBuf>,
    modules_dir: Option<PathBuf>,
    background: bool,
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Module Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: reconflow [OPTIONS] <MODULE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <MODULE_FILE>        Path to module YAML file");
    println!();
    println!("Options:");
    println!("  --set NAME=VALUE     Set a module variable (repeatable)");
    println!("  --global KEY=VALUE   Add a global/secret template value (repeatable)");
    println!("  --project DIR        Project directory for output (default: system temp dir)");
    println!("  --modules DIR        Module library used to resolve sub-modules");
    println!("  --background         Disable the progress display");
    println!("  --verbose            Enable debug logging");
    println!("  --help               Show this help message");
    println!("  --version            Show version information");
    println!();
    println!("Examples:");
    println!("  reconflow ports.yml --set target=example.com");
    println!("  reconflow full.yml --project /data/acme --modules ./modules");
}

/// Splits `name=value`.
fn parse_key_value(flag: &str, text: &str) -> Result<(String, String), String> {
    match text.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("{} expects NAME=VALUE, got '{}'", flag, text)),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value_of = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

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
            "--background" => config.background = true,
            "--verbose" | "-v" => config.verbose = true,
            "--set" | "-s" => {
                i += 1;
                config.options.push(parse_key_value(arg, &value_of(i, arg)?)?);
            }
            "--global" | "-g" => {
                i += 1;
                config.globals.push(parse_key_value(arg, &value_of(i, arg)?)?);
            }
            "--project" => {
                i += 1;
                config.project_dir = Some(PathBuf::from(value_of(i, arg)?));
            }
            "--modules" => {
                i += 1;
                config.modules_dir = Some(PathBuf::from(value_of(i, arg)?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.module_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.module_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints one line per step.
fn print_summary(results: &std::collections::BTreeMap<String, reconflow::StepResult>) {
    println!();
    println!("{}", "Results".bold());
    for (name, result) in results {
        let status = if result.skipped {
            "skipped".yellow()
        } else if result.timed_out {
            "timed out".yellow()
        } else {
            "ok".green()
        };
        let output = result
            .output_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!("  {:<24} {:<10} {}", name, status, output);
    }
}

/// Prints the completed steps and the failures carried by a run error.
fn print_failures(err: &EngineError) {
    let failures = match err {
        EngineError::Deadlock {
            failures, blocked, ..
        } => {
            if !blocked.is_empty() {
                eprintln!("{} {}", "Blocked:".yellow(), blocked.join(", "));
            }
            failures
        }
        EngineError::StepsFailed { failures, .. } => failures,
        _ => return,
    };

    if let Some(results) = err.partial_results().filter(|r| !r.is_empty()) {
        print_summary(results);
        eprintln!();
    }

    for failure in failures {
        eprintln!("  {} {}", "✗".red(), failure);
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    let Some(module_path) = config.module_path.clone() else {
        print_usage();
        return Err("no module file given".into());
    };

    // Setup logging
    setup_logging(config.verbose);

    // Print banner
    if !config.background {
        print_banner();
    }

    // Load module
    let mut engine = ModuleEngine::load(&module_path).map_err(|e| {
        error!("Failed to load module: {}", e);
        format!("Could not load module from '{}': {}", module_path, e)
    })?;

    let info_block = &engine.definition().info;
    info!(
        "Module loaded: {} ({}), {} steps",
        info_block.name,
        info_block.id,
        engine.definition().len()
    );

    for (name, value) in &config.options {
        if !engine.update_option(name, value.as_str()) {
            warn!("Module has no variable named '{}'", name);
        }
    }

    let missing = engine.validate_options();
    if !missing.is_empty() {
        for name in &missing {
            eprintln!("  {} required variable '{}' is not set", "✗".red(), name);
        }
        return Err(format!("missing required variables: {}", missing.join(", ")).into());
    }

    // Build run context
    let mut context = RunContext::new();
    if let Some(dir) = &config.project_dir {
        context = context.with_project_path(dir);
    }
    for (key, value) in &config.globals {
        context = context.with_global(key.as_str(), value.as_str());
    }
    if let Some(dir) = &config.modules_dir {
        let mut registry = ModuleRegistry::new();
        registry.scan(dir)?;
        context = context.with_resolver(Arc::new(registry));
    }
    if config.background {
        context = context.in_background();
    }
    info!("Project directory: {}", context.project_path().display());

    // Execute module
    match engine.run(&context) {
        Ok(results) => {
            print_summary(&results);
            println!();
            println!("{}", "Execution completed successfully".green().bold());
            Ok(())
        }
        Err(e) => {
            print_failures(&e);
            Err(e.into())
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
