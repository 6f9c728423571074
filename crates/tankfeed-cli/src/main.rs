//! tankfeed CLI - tank-level ingestion and live broadcast.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tankfeed_core::config::LogFormat;
use tankfeed_core::{Config, Format};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, invalid source descriptor)
    ConfigError = 1,
    /// Source error (unreadable file, unparseable content, failed fetch)
    SourceError = 2,
    /// Server error (bind failure, listener error)
    ServerError = 3,
    /// Health check failure
    HealthCheckError = 6,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Convert an error to an exit code.
    ///
    /// Errors raised while loading configuration are config errors whatever
    /// caused them; otherwise the first core error in the chain decides.
    fn from_error(error: &anyhow::Error) -> Self {
        let error_str = error.to_string().to_lowercase();

        if error_str.contains("config") {
            return ExitCode::ConfigError;
        }

        let core = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<tankfeed_core::Error>());
        if let Some(core) = core {
            use tankfeed_core::Error;
            return match core {
                Error::Config(_) | Error::Validation(_) | Error::Serialization(_) => {
                    ExitCode::ConfigError
                }
                Error::Io(_)
                | Error::Parse { .. }
                | Error::FormatDetection(_)
                | Error::Mapping(_)
                | Error::Http { .. } => ExitCode::SourceError,
                Error::Connection(_) => ExitCode::ServerError,
            };
        }

        if error_str.contains("bind") || error_str.contains("server") {
            ExitCode::ServerError
        } else if error_str.contains("health") {
            ExitCode::HealthCheckError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "tankfeed")]
#[command(about = "Tank-level ingestion and live broadcast service", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured sources and serve the live channel
    Serve {
        /// Override the live channel port
        #[arg(long)]
        port: Option<u16>,

        /// Override the health port
        #[arg(long)]
        health_port: Option<u16>,

        /// Override the metrics port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Show status and health of a running instance
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Validate configuration file
    Validate,

    /// Detect, parse and suggest a field mapping for a local file
    Inspect {
        /// File to inspect
        path: PathBuf,

        /// Force a format instead of detecting it
        #[arg(long)]
        format: Option<Format>,

        /// Force a delimiter for delimited content
        #[arg(long)]
        delimiter: Option<char>,

        /// Treat the first line as data rather than column names
        #[arg(long)]
        no_header: bool,

        /// Text encoding of the file
        #[arg(long, default_value = "utf-8")]
        encoding: String,

        /// Rows to include in the sample
        #[arg(long, default_value_t = 5)]
        sample: usize,
    },
}

fn main() {
    let exit_code = run_cli();
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging settings come from the config file when it parses; falls back to JSON
    let monitoring = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring)
        .unwrap_or_default();

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(monitoring.log_level.as_str()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::RuntimeError;
        }
    };

    match runtime.block_on(execute_command(cli)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Serve {
            port,
            health_port,
            metrics_port,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(port) = health_port {
                config.monitoring.health_port = port;
            }
            if let Some(port) = metrics_port {
                config.monitoring.metrics_port = port;
            }
            let interrupted = commands::serve::run(config).await?;
            if interrupted {
                return Ok(ExitCode::SignalInterrupt);
            }
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            println!(
                "Configuration is valid ({} source{})",
                config.sources.len(),
                if config.sources.len() == 1 { "" } else { "s" }
            );
        }

        Commands::Inspect {
            path,
            format,
            delimiter,
            no_header,
            encoding,
            sample,
        } => {
            let request = commands::inspect::InspectRequest {
                path,
                format,
                delimiter,
                header: !no_header,
                encoding,
                sample,
            };
            commands::inspect::run(&request)?;
        }
    }

    Ok(ExitCode::Success)
}

/// Load and validate the configuration file.
fn load_config(path: &Option<PathBuf>) -> Result<Config> {
    use anyhow::Context;

    let path = path.clone().unwrap_or_else(|| PathBuf::from("config.toml"));
    Config::from_file(&path)
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}
