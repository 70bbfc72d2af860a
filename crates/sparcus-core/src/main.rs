//! sparcusd: telemetry sink daemon.
//!
//! The entry point handles:
//! - Configuration resolution (flags, environment, file, defaults)
//! - Logging setup
//! - Serving the HTTP surface until SIGINT/SIGTERM
//! - Inspection commands (`check-config`, `handlers`, `version`)

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use sparcus_core::config::{load_config, ConfigError, ConfigOptions, ConfigOverrides, ResolvedConfig};
use sparcus_core::daemon::Daemon;
use sparcus_core::exit_codes::ExitCode;
use sparcus_core::handlers::HandlerResolver;
use sparcus_core::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use sparcus_core::server::HttpServer;
use sparcus_core::signals;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SIGNAL_POLL: Duration = Duration::from_millis(200);

/// Sparcus: windowed reading store with handler triggers and forwarding
#[derive(Parser)]
#[command(name = "sparcusd")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Config file path
    #[arg(long, global = true, env = "SPARCUS_CONFIG")]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(long, global = true, env = "SPARCUS_PORT")]
    port: Option<u16>,

    /// Listen address
    #[arg(long, global = true, env = "SPARCUS_BIND")]
    bind: Option<String>,

    /// Root directory of handler executables
    #[arg(long, global = true, env = "SPARCUS_HANDLERS_PATH")]
    handlers_path: Option<PathBuf>,

    /// State file written at shutdown and read at startup
    #[arg(long, global = true, env = "SPARCUS_DATA_FILE")]
    data_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log format (human, jsonl)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

impl GlobalOpts {
    fn config_options(&self) -> ConfigOptions {
        ConfigOptions {
            config_path: self.config.clone(),
            overrides: ConfigOverrides {
                bind: self.bind.clone(),
                port: self.port,
                handlers_path: self.handlers_path.clone(),
                data_file: self.data_file.clone(),
            },
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service (default)
    Serve,
    /// Load and validate the configuration, then print it (secrets redacted)
    CheckConfig,
    /// List handler executables and their descriptions
    Handlers,
    /// Print version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env(
        LogLevel::from_flags(cli.global.verbose, cli.global.quiet),
        cli.global.log_format,
    );
    init_logging(&log_config);

    let exit_code = match cli.command {
        None | Some(Commands::Serve) => with_config(&cli.global, run_serve),
        Some(Commands::CheckConfig) => with_config(&cli.global, run_check_config),
        Some(Commands::Handlers) => with_config(&cli.global, run_handlers),
        Some(Commands::Version) => print_version(),
    };

    std::process::exit(exit_code.as_i32());
}

fn with_config(global: &GlobalOpts, run: fn(ResolvedConfig) -> ExitCode) -> ExitCode {
    match load_config(&global.config_options()) {
        Ok(resolved) => run(resolved),
        Err(e) => output_config_error(&e),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn run_serve(resolved: ResolvedConfig) -> ExitCode {
    let ResolvedConfig { config, source } = resolved;
    match &source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("using built-in configuration defaults"),
    }

    if let Err(e) = signals::install() {
        warn!(error = %e, "failed to install signal handlers");
    }

    let addr = config.listen_addr();
    let grace = config.shutdown_grace();

    let daemon = match Daemon::from_config(config) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::InternalError;
        }
    };
    daemon.restore();

    let server = match HttpServer::start(&addr, daemon.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start http server");
            return ExitCode::BindError;
        }
    };

    while !signals::shutdown_requested() {
        if signals::take_flush_request() {
            if let Err(e) = daemon.snapshot() {
                error!(error = %e, "state snapshot failed");
            }
        }
        thread::sleep(SIGNAL_POLL);
    }

    info!("shutdown requested");
    server.shutdown();

    let snapshot_daemon = daemon.clone();
    let saved = run_bounded("sparcus-snapshot", grace, move || snapshot_daemon.snapshot());
    let exit_code = match saved {
        Some(Ok(())) => ExitCode::Clean,
        Some(Err(e)) => {
            error!(error = %e, "failed to save state");
            ExitCode::IoError
        }
        None => {
            error!(grace_ms = grace.as_millis() as u64, "state save abandoned after grace period");
            ExitCode::IoError
        }
    };

    match Arc::try_unwrap(daemon) {
        Ok(daemon) => {
            if run_bounded("sparcus-drain", grace, move || daemon.close()).is_none() {
                warn!("forward queue not drained within grace period");
            }
        }
        Err(_) => debug!("requests still in flight, skipping forward drain"),
    }

    exit_code
}

/// Run `task` on a helper thread and wait at most `grace` for it.
fn run_bounded<T, F>(name: &str, grace: Duration, task: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let _ = tx.send(task());
    });
    if let Err(e) = spawned {
        error!(error = %e, thread = name, "failed to spawn helper thread");
        return None;
    }
    rx.recv_timeout(grace).ok()
}

fn run_check_config(resolved: ResolvedConfig) -> ExitCode {
    let response = serde_json::json!({
        "status": "valid",
        "source": resolved.source.as_ref().map(|p| p.display().to_string()),
        "config": resolved.config.redacted(),
    });
    print_json(&response)
}

fn run_handlers(resolved: ResolvedConfig) -> ExitCode {
    let resolver = HandlerResolver::new(&resolved.config.handlers_path);
    match resolver.describe() {
        Ok(handlers) => print_json(&handlers),
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::IoError
        }
    }
}

fn print_version() -> ExitCode {
    let version_info = serde_json::json!({
        "sparcusd_version": env!("CARGO_PKG_VERSION"),
        "rust_version": env!("CARGO_PKG_RUST_VERSION"),
    });
    print_json(&version_info)
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::Clean
        }
        Err(e) => {
            eprintln!("Error encoding JSON: {}", e);
            ExitCode::InternalError
        }
    }
}

/// Report a config error on stderr and pick the exit code.
fn output_config_error(error: &ConfigError) -> ExitCode {
    let exit_code = match error {
        ConfigError::NotFound { .. } | ConfigError::ParseError { .. } | ConfigError::Invalid { .. } => {
            ExitCode::ConfigError
        }
        ConfigError::IoError { .. } => ExitCode::IoError,
    };

    let response = serde_json::json!({
        "status": "error",
        "error": {
            "code": exit_code.code_name(),
            "message": error.to_string(),
        }
    });
    match serde_json::to_string_pretty(&response) {
        Ok(text) => eprintln!("{}", text),
        Err(_) => eprintln!("Error: {}", error),
    }

    exit_code
}
