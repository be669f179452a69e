use covsuite_core::compiler::MachineModel;
use covsuite_core::config::{GoalSetting, SuiteConfig};
use covsuite_core::suite::SuiteExecutor;

use clap::Parser;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// The C program under measurement.
    #[clap(value_parser)]
    program: PathBuf,
    /// The zipped test suite to execute against the program.
    #[clap(value_parser)]
    suite: PathBuf,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Pointer width of the target, 32 or 64.
    #[clap(long, default_value_t = 64)]
    machine_model: u32,
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Stop as soon as the goal is covered or cumulative coverage is full.
    #[clap(long)]
    stop_on_success: bool,
    /// Seek coverage of one specific function instead of overall lines.
    #[clap(long)]
    goal_function: Option<String>,
    /// Write the full execution result as JSON to this path.
    #[clap(long)]
    json_report: Option<PathBuf>,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}");
            SuiteConfig::load_from_file(config_path)?
        }
        None => {
            // No config file specified via CLI, load default
            let default_config_path = PathBuf::from("covsuite.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                SuiteConfig::load_from_file(&default_config_path)?
            } else {
                println!(
                    "No config file specified and default 'covsuite.toml' not found, using built-in defaults."
                );
                SuiteConfig::default()
            }
        }
    };

    if let Some(timeout_ms) = cli.timeout_ms {
        config.execution.timeout_ms = timeout_ms;
    }
    if cli.stop_on_success {
        config.execution.stop_on_success = true;
    }
    if let Some(name) = cli.goal_function {
        config.coverage.goal = GoalSetting::Function { name };
    }

    let machine_model = match cli.machine_model {
        32 => MachineModel::Bits32,
        64 => MachineModel::Bits64,
        other => anyhow::bail!("Unsupported machine model '{other}', expected 32 or 64"),
    };

    println!("Effective configuration: {config:#?}");

    let start_time = Instant::now();
    let mut executor = SuiteExecutor::new(config)?;
    let outcome = executor.run(&cli.program, &cli.suite, machine_model)?;
    let elapsed = start_time.elapsed();

    println!("\nSuite finished in {elapsed:.2?}.");
    println!(
        "Tests executed: {}, successful: {}",
        outcome.results.len(),
        outcome.successful.len()
    );
    if outcome.total_coverage.total > 0 {
        println!(
            "Cumulative coverage: {}/{} ({:.2}%)",
            outcome.total_coverage.hits,
            outcome.total_coverage.total,
            outcome.total_coverage.percent()
        );
    }
    for (index, result) in outcome.results.iter().enumerate() {
        println!(
            "  {}: verdict={:?} exit={:?} wall={:.2?}",
            outcome.vectors[index].name, result.verdict, result.exit_code, result.wall_time
        );
    }
    if !outcome.successful.is_empty() {
        let names: Vec<&str> = outcome
            .successful_tests()
            .map(|vector| vector.name.as_str())
            .collect();
        println!("Successful tests: {}", names.join(", "));
    }

    if let Some(report_path) = cli.json_report {
        let report = serde_json::to_string_pretty(&outcome)?;
        std::fs::write(&report_path, report)?;
        println!("JSON report written to {report_path:?}");
    }

    Ok(())
}
