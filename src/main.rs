/*!
 * Bulwark CLI - inspect and exercise policy configuration files
 */

use bulwark::{
    config::{EngineConfig, LayerConfig, LogLevel, LoggingConfig},
    error::{BulwarkError, Result, EXIT_SUCCESS},
    logging, run_scenario, Scenario,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(version, about = "Validate and exercise resilience policy configuration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output (debug level)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Log level, overriding the config file
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevelArg>,

    /// Write JSON logs to this file instead of stdout
    #[arg(long = "log", value_name = "FILE", global = true)]
    log: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that every policy in a config file builds
    Validate {
        /// Policy configuration file (TOML)
        config: PathBuf,
    },

    /// Print the layers of each configured policy, outermost first
    Show {
        /// Policy configuration file (TOML)
        config: PathBuf,

        /// Emit the parsed policies as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a configured policy against a synthetic flaky operation
    Simulate {
        /// Policy configuration file (TOML)
        config: PathBuf,

        /// Name of the policy to run
        policy: String,

        /// Number of leading invocations that fail
        #[arg(long, default_value_t = 0)]
        failures: u32,

        /// Latency of each invocation in milliseconds
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,

        /// Number of sequential calls
        #[arg(long, default_value_t = 1)]
        calls: u32,

        /// Pause between calls in milliseconds
        #[arg(long, default_value_t = 0)]
        spacing_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Validate { config }
        | Commands::Show { config, .. }
        | Commands::Simulate { config, .. } => config,
    }
    .clone();
    let config = EngineConfig::from_file(&config_path)?;

    logging::init_logging(&logging_config(&cli, &config.logging))?;

    match cli.command {
        Commands::Validate { .. } => {
            config.validate()?;
            println!(
                "{}: {} valid {}",
                config_path.display(),
                config.policies.len(),
                if config.policies.len() == 1 { "policy" } else { "policies" }
            );
            Ok(())
        }
        Commands::Show { json: true, .. } => {
            let rendered = serde_json::to_string_pretty(&config.policies)
                .map_err(|e| BulwarkError::Config(e.to_string()))?;
            println!("{}", rendered);
            Ok(())
        }
        Commands::Show { json: false, .. } => {
            for (name, policy) in &config.policies {
                println!("{}", name);
                for layer in &policy.layers {
                    println!("  {}", describe_layer(layer));
                }
            }
            Ok(())
        }
        Commands::Simulate {
            policy,
            failures,
            latency_ms,
            calls,
            spacing_ms,
            ..
        } => {
            let registry = config.build_registry::<u32, String>()?;
            let policy = registry.get::<u32, String>(&policy)?;
            let scenario = Scenario {
                failures,
                latency: Duration::from_millis(latency_ms),
                calls,
                spacing: Duration::from_millis(spacing_ms),
            };

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            for report in runtime.block_on(run_scenario(policy, scenario)) {
                println!("{}", report.describe());
            }
            Ok(())
        }
    }
}

/// Command-line flags layered over the file's logging section
fn logging_config(cli: &Cli, file: &LoggingConfig) -> LoggingConfig {
    LoggingConfig {
        level: cli.log_level.map(LogLevel::from).unwrap_or(file.level),
        file: cli.log.clone().or_else(|| file.file.clone()),
        verbose: cli.verbose || file.verbose,
    }
}

fn describe_layer(layer: &LayerConfig) -> String {
    match layer {
        LayerConfig::Retry {
            max_retries,
            backoff,
            jitter_ms,
        } => format!(
            "retry: {} retries, backoff {:?}, jitter < {}ms",
            max_retries, backoff, jitter_ms
        ),
        LayerConfig::CircuitBreaker {
            failure_threshold,
            break_ms,
        } => format!(
            "circuit breaker: open after {} consecutive failures for {}ms",
            failure_threshold, break_ms
        ),
        LayerConfig::AdvancedCircuitBreaker {
            failure_rate,
            sampling_ms,
            minimum_throughput,
            break_ms,
        } => format!(
            "circuit breaker: open at {:.0}% failures over {}ms (min {} calls) for {}ms",
            failure_rate * 100.0,
            sampling_ms,
            minimum_throughput,
            break_ms
        ),
        LayerConfig::Timeout {
            timeout_ms,
            strategy,
        } => format!("timeout: {}ms ({})", timeout_ms, strategy),
        LayerConfig::Bulkhead {
            max_concurrency,
            max_queue,
        } => format!(
            "bulkhead: {} concurrent, {} queued",
            max_concurrency, max_queue
        ),
    }
}
