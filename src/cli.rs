//! Command-line surface and startup sequence.
use crate::config::{self, Config, ConfigError, LogLevel};
use crate::logging::Logger;
use crate::signals::{parse_signal, SignalHandler};
use crate::supervisor::{Supervisor, EXIT_CONFIG_ERROR, EXIT_OK, EXIT_PARSE_FLAGS_ERROR};
use crate::worker::Heartbeat;
use clap::error::ErrorKind;
use clap::Parser;
use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::instrument::WithSubscriber;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A daemon shell: supervises one background worker, reloading it on the
/// reload signal and shutting down cleanly on the kill signal.
#[derive(Parser, Debug)]
#[command(name = "shepherd", about, disable_version_flag = true)]
pub struct Args {
    /// Config file layered under the command line (repeatable, later files win)
    #[arg(long, value_name = "PATH")]
    config: Vec<PathBuf>,

    /// Signal to listen to gracefully terminate the process
    #[arg(long, value_name = "SIGNAL", value_parser = parse_signal)]
    kill_signal: Option<Signal>,

    /// Logging level: debug, info, warn or error
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Path on disk to write the PID of the process (empty disables it)
    #[arg(long, value_name = "PATH")]
    pid_file: Option<String>,

    /// Signal to listen to reload configuration
    #[arg(long, value_name = "SIGNAL", value_parser = parse_signal)]
    reload_signal: Option<Signal>,

    /// Print the version of this daemon
    #[arg(short = 'v', long)]
    version: bool,
}

pub fn human_version() -> String {
    format!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Parse `args` (program name first) into the command-line configuration
/// layer and whether the version was requested.
///
/// Only fields given on the command line are set, so the result can be merged
/// over defaults and config files.
pub fn parse_flags(args: Vec<OsString>) -> Result<(Config, bool), clap::Error> {
    let args = Args::try_parse_from(normalize_args(args))?;
    let config = Config {
        log_level: args.log_level,
        pid_file: args.pid_file.map(PathBuf::from),
        reload_signal: args.reload_signal,
        kill_signal: args.kill_signal,
        config_paths: args.config,
    };
    Ok((config, args.version))
}

/// Accept Go-style single-dash long flags (`-pid-file=x`) by rewriting them
/// to `--pid-file=x`. Single-letter flags and everything after `--` are left
/// alone.
fn normalize_args(args: Vec<OsString>) -> Vec<OsString> {
    let mut passthrough = false;
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            if i == 0 || passthrough {
                return arg;
            }
            match arg.to_str() {
                Some("--") => {
                    passthrough = true;
                    arg
                }
                Some(s) if is_single_dash_long(s) => OsString::from(format!("-{s}")),
                _ => arg,
            }
        })
        .collect()
}

fn is_single_dash_long(arg: &str) -> bool {
    match arg.strip_prefix('-') {
        Some(rest) if !rest.starts_with('-') => {
            let name = rest.split('=').next().unwrap_or_default();
            name.chars().count() > 1
        }
        _ => false,
    }
}

/// Resolve the startup configuration with `logger` already in place, then
/// move the logger to the resolved level.
fn load(base: &Config, logger: &Logger) -> Result<Config, ConfigError> {
    let config = tracing::dispatcher::with_default(logger.dispatch(), || config::resolve(base))?;
    logger
        .set_level(config.log_level())
        .map_err(|e| ConfigError::Logging { source: e })?;
    Ok(config)
}

/// Run the daemon and return the process exit status.
pub async fn run(args: Vec<OsString>, out: &mut dyn Write, err: &mut dyn Write) -> i32 {
    let (base, version) = match parse_flags(args) {
        Ok(parsed) => parsed,
        Err(e) => {
            let _ = write!(err, "{}", e.render());
            return match e.kind() {
                ErrorKind::DisplayHelp => EXIT_OK,
                _ => EXIT_PARSE_FLAGS_ERROR,
            };
        }
    };

    if version {
        let _ = writeln!(out, "{}", human_version());
        return EXIT_OK;
    }

    let logger = Logger::new(Config::with_env_defaults().merge(&base).log_level());
    // `base` stays untouched: every reload resolves from it again.
    let config = match load(&base, &logger) {
        Ok(config) => config,
        Err(e) => {
            let _ = writeln!(err, "{}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let supervisor = Supervisor::new(logger.clone(), SignalHandler::new(), |_: &Config| {
        Heartbeat::new(HEARTBEAT_INTERVAL)
    });

    async move {
        tracing::info!(version = %human_version(), "starting");
        supervisor.run(base, config).await
    }
    .with_subscriber(logger.dispatch().clone())
    .await
}
