/*!
 * Conduit CLI - Command Line Interface
 */

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use conduit::{
    config::{ClientConfig, ContextMode, LogLevel},
    demo::{run_demo, DemoOptions, DemoReport},
    error::{ConduitError, EXIT_CALL_FAILED, EXIT_FATAL, EXIT_SUCCESS},
    logging, ClientHost,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version, about = "Client-side connection management for out-of-process API providers", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevelArg,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "FILE", global = true)]
    log: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Path to a TOML config file
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue calls against a loopback provider and report how they resolve
    Demo {
        /// Number of calls queued before the connection comes up
        #[arg(short = 'n', long, default_value_t = 3)]
        calls: usize,

        /// Provider reply delay in milliseconds
        #[arg(long, default_value_t = 10)]
        reply_delay_ms: u64,

        /// Reject the bind instead of accepting it
        #[arg(long)]
        reject_bind: bool,

        /// Drop the link afterwards and show the next call reconnecting
        #[arg(long)]
        drop_link: bool,

        /// Deliver callbacks on the producing thread instead of a dispatcher
        #[arg(long)]
        immediate_callbacks: bool,
    },

    /// Print the effective configuration, or write it to a file
    Config {
        /// Write the configuration here instead of printing it
        #[arg(long, value_name = "FILE")]
        write: Option<PathBuf>,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
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
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<ConduitError>()
                .map(ConduitError::exit_code)
                .unwrap_or(EXIT_FATAL)
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if cli.log_level != LogLevelArg::Info {
        config.log_level = cli.log_level.into();
    }
    if cli.log.is_some() {
        config.log_file = cli.log.clone();
    }
    config.verbose |= cli.verbose;

    match cli.command {
        Commands::Config { write } => {
            match write {
                Some(path) => {
                    config
                        .to_file(&path)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Configuration written to {}", path.display());
                }
                None => print!("{}", config.to_toml()?),
            }
            Ok(EXIT_SUCCESS)
        }
        Commands::Demo {
            calls,
            reply_delay_ms,
            reject_bind,
            drop_link,
            immediate_callbacks,
        } => {
            if immediate_callbacks {
                config.callback_context = ContextMode::Immediate;
            }
            logging::init_logging(&config)?;

            let host = ClientHost::new(config)?;
            let options = DemoOptions {
                calls,
                reply_delay_ms,
                reject_bind,
                drop_link,
            };
            let report = run_demo(&host, &options)?;
            host.shutdown();

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            Ok(if report.failures() == 0 {
                EXIT_SUCCESS
            } else {
                EXIT_CALL_FAILED
            })
        }
    }
}

fn print_report(report: &DemoReport) {
    println!("Connection: {}", report.connection);
    println!("Queued before connect: {}", report.queued_before_connect);
    println!("Bind attempts: {}", report.bind_attempts);
    if !report.posted_order.is_empty() {
        println!("Posted order: {}", report.posted_order.join(", "));
    }
    println!("Callback order: {}", report.callback_order.join(", "));
    for outcome in &report.outcomes {
        match outcome.reply {
            Some(ref reply) => println!("  {} -> {}", outcome.call, reply),
            None => println!("  {} -> {}", outcome.call, outcome.status),
        }
    }
    println!("Final state: {}", report.snapshot.state);
    if let Some(ref failure) = report.snapshot.last_failure {
        println!("Last failure: {}", failure);
    }

    if let Some(ref reconnect) = report.reconnect {
        println!();
        println!("Link dropped:");
        println!("  {} -> {}", reconnect.in_flight.call, reconnect.in_flight.status);
        println!("  state after drop: {}", reconnect.state_after_drop);
        match reconnect.retry.reply {
            Some(ref reply) => println!("  {} -> {}", reconnect.retry.call, reply),
            None => println!("  {} -> {}", reconnect.retry.call, reconnect.retry.status),
        }
        println!("  bind attempts: {}", reconnect.bind_attempts);
    }
}
