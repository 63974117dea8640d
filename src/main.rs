use agent_lifecycle::config::{self, LifecycleConfig};
use agent_lifecycle::host;
use agent_lifecycle::SignalError;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Runs a governance voting agent under coordinated graceful shutdown:
/// on SIGTERM/SIGINT stop the agent, drain in-flight votes, save service
/// state and record how the process exited.
#[derive(Parser, Debug)]
#[command(name = "agent-lifecycle", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "lifecycle.toml")]
    config: PathBuf,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Overall shutdown deadline in seconds (overrides config)
    #[arg(long)]
    timeout: Option<f64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (per-vote and per-tick detail)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Print the last shutdown record and recovery verdict, then exit
    #[arg(long)]
    status: bool,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_TIMEOUT: u8 = 124;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "agent_lifecycle=debug"
    } else if cli.quiet {
        "agent_lifecycle=warn"
    } else {
        "agent_lifecycle=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match resolve_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.dry_run {
        println!("agent-lifecycle v{}", env!("CARGO_PKG_VERSION"));
        println!("Config file: {}", cli.config.display());
        println!("Shutdown record: {}", config.state_path().display());
        println!("{config:#?}");
        return ExitCode::SUCCESS;
    }

    if cli.status {
        print!("{}", host::status(&config));
        return ExitCode::SUCCESS;
    }

    let booted = match host::bootstrap(&config, Vec::new()) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    if let Some(record) = &booted.recovered {
        tracing::warn!(
            reason = %record.reason,
            timestamp = %record.timestamp,
            "previous run did not exit cleanly"
        );
    }

    match host::run(booted).await {
        Ok(summary) if summary.callbacks_failed == 0 => {
            tracing::info!(trigger = %summary.trigger, "shutdown complete");
            ExitCode::SUCCESS
        }
        Ok(summary) => {
            tracing::error!(
                trigger = %summary.trigger,
                failed = summary.callbacks_failed,
                "shutdown finished with errors"
            );
            ExitCode::from(EXIT_FAILURE)
        }
        Err(SignalError::Timeout { after }) => {
            tracing::error!(?after, "forcing exit");
            // A hung callback may still occupy a worker; don't wait on runtime teardown.
            std::process::exit(i32::from(EXIT_TIMEOUT))
        }
        Err(e) => {
            tracing::error!(error = %e, "shutdown failed");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Load the config file and apply CLI overrides.
fn resolve_config(cli: &Cli) -> Result<LifecycleConfig, config::ConfigError> {
    let mut config = config::load(&cli.config)?;
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(secs) = cli.timeout {
        config.shutdown.timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}
