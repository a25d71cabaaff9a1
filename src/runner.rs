//! One generation of supervised work.
//!
//! A [`Runner`] owns a finalized configuration, the PID file, and the two
//! channels its worker's outcome travels back on: `errors` and `done`. The
//! worker is driven on its own task; the supervisor only ever hears about it
//! through [`Runner::outcome`].
//!
//! Lifecycle: `Created → Starting → Running → Stopped`. The PID file is
//! written once, on the way from `Starting` to `Running`, under the same lock
//! that [`RunnerHandle::stop`] takes, so a stopped runner never creates it.
use crate::config::Config;
use crate::logging::Logger;
use crate::pidfile::{PidFile, PidFileError};
use crate::worker::{Step, Worker, WorkerError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::instrument::WithSubscriber;
use tracing::Instrument;

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Starting,
    Running,
    Stopped,
}

/// How a runner generation ended, as seen by the supervisor.
#[derive(Debug)]
pub enum Outcome {
    Failed(RunnerError),
    /// The worker completed, or the runner was stopped and no run will complete.
    Done,
}

/// Errors a runner reports.
#[derive(Debug)]
pub enum RunnerError {
    /// The PID file could not be written; the worker was never started.
    PidFile(PidFileError),
    /// The worker failed.
    Worker(WorkerError),
    /// The finalized configuration could not be rendered.
    Config { source: serde_json::Error },
}

impl RunnerError {
    /// Exit status requested by the worker, if any.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            RunnerError::Worker(err) => err.exit_status,
            _ => None,
        }
    }
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::PidFile(err) => write!(f, "runner: {}", err),
            RunnerError::Worker(err) => write!(f, "worker failed: {}", err),
            RunnerError::Config { source } => {
                write!(f, "runner: could not render config: {}", source)
            }
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::PidFile(err) => Some(err),
            RunnerError::Worker(err) => Some(err),
            RunnerError::Config { source } => Some(source),
        }
    }
}

impl From<PidFileError> for RunnerError {
    fn from(err: PidFileError) -> Self {
        RunnerError::PidFile(err)
    }
}

impl From<WorkerError> for RunnerError {
    fn from(err: WorkerError) -> Self {
        RunnerError::Worker(err)
    }
}

struct Shared {
    config: Config,
    generation: u64,
    pid_file: Option<PidFile>,
    state: Mutex<RunnerState>,
    errors: mpsc::Sender<RunnerError>,
    /// Taken (and so closed) by the first stop.
    done: Mutex<Option<mpsc::Sender<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stopped(&self) -> bool {
        *self.state() == RunnerState::Stopped
    }

    fn fail(&self, err: RunnerError) {
        tracing::error!(error = %err, "runner received error");
        // Capacity 1 and at most one outcome per generation, so this only
        // fails when nobody is listening any more.
        let _ = self.errors.try_send(err);
    }

    fn finish(&self) {
        tracing::info!("runner received finish");
        let done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = done.as_ref() {
            let _ = tx.try_send(());
        }
    }
}

/// Cloneable handle that can stop a runner from anywhere.
#[derive(Clone)]
pub struct RunnerHandle {
    shared: Arc<Shared>,
}

impl RunnerHandle {
    /// Tear the runner down: remove the PID file (best effort) and close the
    /// done channel. Only the first call does anything; it returns `true`.
    pub fn stop(&self) -> bool {
        let shared = &self.shared;
        let mut state = shared.state();
        if *state == RunnerState::Stopped {
            return false;
        }

        tracing::info!(generation = shared.generation, "runner stopping");

        if let Some(pid_file) = &shared.pid_file {
            if let Err(e) = pid_file.remove() {
                tracing::warn!(
                    error = %e,
                    path = %pid_file.path().display(),
                    "could not remove pid file"
                );
            }
        }

        *state = RunnerState::Stopped;
        shared
            .done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        true
    }

    #[allow(dead_code)]
    pub fn state(&self) -> RunnerState {
        *self.shared.state()
    }
}

pub struct Runner {
    handle: RunnerHandle,
    logger: Logger,
    errors: mpsc::Receiver<RunnerError>,
    done: mpsc::Receiver<()>,
}

impl Runner {
    /// Build a runner for `config`, repairing any unset field with its
    /// default. Nothing touches the filesystem until [`Runner::start`].
    pub fn new(config: &Config, logger: &Logger, generation: u64) -> Result<Self, RunnerError> {
        let mut config = Config::with_env_defaults().merge(config);
        config.finalize();

        let rendered =
            serde_json::to_string(&config).map_err(|e| RunnerError::Config { source: e })?;
        tracing::info!(generation, "creating new runner");
        tracing::debug!(generation, config = %rendered, "final config");

        let pid_file = config.pid_file().map(PidFile::new);
        let (errors_tx, errors) = mpsc::channel(1);
        let (done_tx, done) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            config,
            generation,
            pid_file,
            state: Mutex::new(RunnerState::Created),
            errors: errors_tx,
            done: Mutex::new(Some(done_tx)),
        });

        Ok(Self {
            handle: RunnerHandle { shared },
            logger: logger.clone(),
            errors,
            done,
        })
    }

    /// The finalized configuration this runner was built with.
    pub fn config(&self) -> &Config {
        &self.handle.shared.config
    }

    pub fn generation(&self) -> u64 {
        self.handle.shared.generation
    }

    #[allow(dead_code)]
    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    #[allow(dead_code)]
    pub fn state(&self) -> RunnerState {
        self.handle.state()
    }

    /// Spawn the task that drives `worker`. Returns immediately; outcomes
    /// arrive through [`Runner::outcome`]. Only the first call starts anything.
    pub fn start<W: Worker>(&self, worker: W) {
        {
            let mut state = self.handle.shared.state();
            match *state {
                RunnerState::Created => {}
                RunnerState::Stopped => {
                    tracing::warn!("runner stopped before start, not starting");
                    return;
                }
                _ => {
                    tracing::warn!(state = ?*state, "runner already started");
                    return;
                }
            }
            *state = RunnerState::Starting;
        }

        let shared = Arc::clone(&self.handle.shared);
        let dispatch = self.logger.dispatch().clone();
        let span = tracing::dispatcher::with_default(&dispatch, || {
            tracing::info_span!("runner", generation = shared.generation)
        });
        tokio::spawn(drive(shared, worker).instrument(span).with_subscriber(dispatch));
    }

    /// Stop the runner. See [`RunnerHandle::stop`].
    pub fn stop(&self) -> bool {
        self.handle.stop()
    }

    /// Wait for the worker to fail or complete.
    pub async fn outcome(&mut self) -> Outcome {
        tokio::select! {
            Some(err) = self.errors.recv() => Outcome::Failed(err),
            _ = self.done.recv() => Outcome::Done,
        }
    }
}

async fn drive<W: Worker>(shared: Arc<Shared>, mut worker: W) {
    tracing::info!("runner starting");

    {
        let mut state = shared.state();
        if *state == RunnerState::Stopped {
            tracing::debug!("runner stopped before it started");
            return;
        }
        if let Some(pid_file) = &shared.pid_file {
            if let Err(e) = pid_file.create() {
                drop(state);
                shared.fail(e.into());
                return;
            }
        }
        *state = RunnerState::Running;
    }

    loop {
        if shared.is_stopped() {
            tracing::debug!("runner stopped, no further steps");
            return;
        }

        match worker.step().await {
            Ok(Step::Continue) => tokio::task::yield_now().await,
            Ok(Step::Done) => {
                shared.finish();
                return;
            }
            Err(e) => {
                shared.fail(e.into());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;
    use crate::logging::testing::capture;
    use crate::worker::testing::{CompleteAfter, FailWith, Idle};
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn logger() -> Logger {
        Logger::for_tests(LogLevel::Debug)
    }

    fn config_with_pid(path: &Path) -> Config {
        Config {
            pid_file: Some(path.to_path_buf()),
            ..Default::default()
        }
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_new_finalizes_config() {
        let runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        let config = runner.config();
        assert!(config.log_level.is_some());
        assert!(config.pid_file.is_some());
        assert!(config.reload_signal.is_some());
        assert!(config.kill_signal.is_some());
        assert_eq!(runner.state(), RunnerState::Created);
        assert_eq!(runner.generation(), 1);
    }

    #[tokio::test]
    async fn test_new_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lazy.pid");
        let _runner = Runner::new(&config_with_pid(&path), &logger(), 1).unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_done_is_forwarded() {
        let mut runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        let worker = CompleteAfter::new(3);
        let steps = worker.steps.clone();
        runner.start(worker);

        assert!(matches!(runner.outcome().await, Outcome::Done));
        assert_eq!(steps.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_worker_error_is_forwarded_with_status() {
        let mut runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        runner.start(FailWith {
            error: WorkerError::new("disk full").with_exit_status(17),
        });

        match runner.outcome().await {
            Outcome::Failed(err) => {
                assert_eq!(err.exit_status(), Some(17));
                assert!(err.to_string().contains("disk full"));
            }
            Outcome::Done => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_worker_error_without_status() {
        let mut runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        runner.start(FailWith {
            error: WorkerError::new("nope"),
        });

        match runner.outcome().await {
            Outcome::Failed(err) => assert_eq!(err.exit_status(), None),
            Outcome::Done => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn test_pid_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.pid");
        let runner = Runner::new(&config_with_pid(&path), &logger(), 1).unwrap();
        runner.start(Idle::new());

        wait_for(|| runner.state() == RunnerState::Running).await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        assert!(runner.stop());
        assert!(!path.exists());
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn test_pid_file_failure_skips_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("runner.pid");
        let mut runner = Runner::new(&config_with_pid(&path), &logger(), 1).unwrap();
        let worker = CompleteAfter::new(1);
        let steps = worker.steps.clone();
        runner.start(worker);

        match runner.outcome().await {
            Outcome::Failed(err) => {
                assert!(matches!(err, RunnerError::PidFile(PidFileError::Create { .. })));
                assert_eq!(err.exit_status(), None);
            }
            Outcome::Done => panic!("expected pid file failure"),
        }
        assert_eq!(steps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("once.pid");
        let mut runner = Runner::new(&config_with_pid(&path), &logger(), 1).unwrap();
        runner.start(Idle::new());
        wait_for(|| path.exists()).await;

        assert!(runner.stop());
        assert!(!runner.stop());
        assert!(!runner.handle().stop());

        // The done channel is closed exactly once and stays closed.
        assert!(matches!(runner.outcome().await, Outcome::Done));
        assert!(matches!(runner.outcome().await, Outcome::Done));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stop_tears_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.pid");
        let runner = Runner::new(&config_with_pid(&path), &logger(), 1).unwrap();
        runner.start(Idle::new());
        wait_for(|| runner.state() == RunnerState::Running).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let handle = runner.handle();
                std::thread::spawn(move || handle.stop())
            })
            .collect();
        let performed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|performed| *performed)
            .count();

        assert_eq!(performed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stop_before_task_runs_never_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("early.pid");
        let runner = Runner::new(&config_with_pid(&path), &logger(), 1).unwrap();
        let worker = Idle::new();
        let steps = worker.steps.clone();

        // Current-thread runtime: the spawned task cannot run before we yield.
        runner.start(worker);
        runner.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!path.exists());
        assert_eq!(steps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_halts_stepping() {
        let runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        let worker = Idle::new();
        let steps = worker.steps.clone();
        runner.start(worker);
        wait_for(|| steps.load(Ordering::SeqCst) >= 2).await;

        runner.stop();
        // Allow an in-flight step to return.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let after_stop = steps.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(steps.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_second_start_is_ignored() {
        let mut runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        let first = CompleteAfter::new(1);
        let second = CompleteAfter::new(1);
        let second_steps = second.steps.clone();

        runner.start(first);
        runner.start(second);

        assert!(matches!(runner.outcome().await, Outcome::Done));
        assert_eq!(second_steps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_after_stop_is_refused() {
        let (capture, buffer) = capture(LogLevel::Warn);
        let runner = Runner::new(&Config::default(), &logger(), 1).unwrap();
        let worker = Idle::new();
        let steps = worker.steps.clone();

        runner.stop();
        tracing::dispatcher::with_default(capture.dispatch(), || runner.start(worker));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(runner.state(), RunnerState::Stopped);
        assert_eq!(steps.load(Ordering::SeqCst), 0);
        let out = buffer.contents();
        assert!(out.contains("runner stopped before start"));
        assert!(!out.contains("already started"));
    }

    #[tokio::test]
    async fn test_second_start_warns_already_started() {
        let (capture, buffer) = capture(LogLevel::Warn);
        let runner = Runner::new(&Config::default(), &logger(), 1).unwrap();

        runner.start(Idle::new());
        tracing::dispatcher::with_default(capture.dispatch(), || runner.start(Idle::new()));
        runner.stop();

        assert!(buffer.contents().contains("runner already started"));
    }
}
