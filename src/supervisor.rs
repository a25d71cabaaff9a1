//! The supervisor control loop.
//!
//! Waits on three sources at once: the current runner's outcome, OS signals,
//! and an internal stop request. A reload signal swaps in a new runner
//! generation built from the original command-line snapshot; everything else
//! ends the loop with an exit status.
use crate::config::{self, Config, ConfigError};
use crate::logging::Logger;
use crate::runner::{Outcome, Runner, RunnerError};
use crate::signals::{SignalHandler, ALWAYS_WATCHED};
use crate::worker::Worker;
use nix::sys::signal::Signal;
use tokio::sync::mpsc;

pub const EXIT_OK: i32 = 0;
pub const EXIT_INTERRUPT: i32 = 1;
pub const EXIT_PARSE_FLAGS_ERROR: i32 = 2;
pub const EXIT_RUNNER_ERROR: i32 = 3;
pub const EXIT_CONFIG_ERROR: i32 = 4;

/// Requests a clean shutdown of a running supervisor.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<()>,
}

impl StopHandle {
    #[allow(dead_code)]
    pub fn stop(&self) {
        let _ = self.tx.try_send(());
    }
}

enum Event {
    Runner(Outcome),
    Signal(Signal),
    Stop,
}

pub struct Supervisor<F> {
    logger: Logger,
    signals: SignalHandler,
    make_worker: F,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
    generation: u64,
}

impl<F, W> Supervisor<F>
where
    F: FnMut(&Config) -> W,
    W: Worker,
{
    /// `make_worker` builds the worker for each runner generation from that
    /// generation's finalized configuration.
    pub fn new(logger: Logger, signals: SignalHandler, make_worker: F) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            logger,
            signals,
            make_worker,
            stop_tx,
            stop_rx,
            generation: 0,
        }
    }

    #[allow(dead_code)]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Run until a terminal event and return the process exit status.
    ///
    /// `base` is the pre-finalize command-line snapshot every reload is
    /// resolved from; `config` is the already resolved configuration for the
    /// first generation.
    pub async fn run(mut self, base: Config, config: Config) -> i32 {
        let mut config = config;

        if let Err(e) = self.watch_signals(&config) {
            return log_error(&e, EXIT_CONFIG_ERROR);
        }

        let mut runner = match self.spawn_runner(&config) {
            Ok(runner) => runner,
            Err(e) => return log_error(&e, EXIT_RUNNER_ERROR),
        };

        loop {
            let event = tokio::select! {
                outcome = runner.outcome() => Event::Runner(outcome),
                Some(signal) = self.signals.recv() => Event::Signal(signal),
                Some(()) = self.stop_rx.recv() => Event::Stop,
            };

            match event {
                Event::Runner(Outcome::Failed(err)) => {
                    let code = err.exit_status().unwrap_or(EXIT_RUNNER_ERROR);
                    return log_error(&err, code);
                }
                Event::Runner(Outcome::Done) => {
                    tracing::info!(generation = runner.generation(), "received finish");
                    runner.stop();
                    return EXIT_OK;
                }
                Event::Signal(signal) if signal == config.reload_signal() => {
                    tracing::info!(signal = signal.as_str(), "reloading configuration");
                    runner.stop();

                    config = match self.reload(&base) {
                        Ok(config) => config,
                        Err(e) => return log_error(&e, EXIT_CONFIG_ERROR),
                    };

                    runner = match self.spawn_runner(&config) {
                        Ok(runner) => runner,
                        Err(e) => return log_error(&e, EXIT_RUNNER_ERROR),
                    };
                }
                Event::Signal(signal) if signal == config.kill_signal() => {
                    tracing::warn!(signal = signal.as_str(), "cleaning up");
                    runner.stop();
                    return EXIT_INTERRUPT;
                }
                Event::Signal(signal) => {
                    tracing::warn!(
                        signal = signal.as_str(),
                        "unexpected signal, shutting down"
                    );
                    runner.stop();
                    return EXIT_INTERRUPT;
                }
                Event::Stop => {
                    tracing::info!("stop requested");
                    runner.stop();
                    return EXIT_OK;
                }
            }
        }
    }

    fn spawn_runner(&mut self, config: &Config) -> Result<Runner, RunnerError> {
        self.generation += 1;
        let runner = Runner::new(config, &self.logger, self.generation)?;
        let worker = (self.make_worker)(runner.config());
        runner.start(worker);
        Ok(runner)
    }

    /// Re-resolve the configuration from `base` and re-apply logging and
    /// signal setup.
    fn reload(&mut self, base: &Config) -> Result<Config, ConfigError> {
        let config = config::resolve(base)?;
        self.logger
            .set_level(config.log_level())
            .map_err(|e| ConfigError::Logging { source: e })?;
        self.watch_signals(&config)?;
        Ok(config)
    }

    fn watch_signals(&mut self, config: &Config) -> Result<(), ConfigError> {
        self.signals
            .watch_all(ALWAYS_WATCHED)
            .and_then(|()| {
                self.signals
                    .watch_all(&[config.reload_signal(), config.kill_signal()])
            })
            .map_err(|e| ConfigError::Signals { source: e })
    }
}

fn log_error(err: &dyn std::fmt::Display, code: i32) -> i32 {
    tracing::error!(error = %err, exit_code = code, "supervisor exiting");
    code
}
