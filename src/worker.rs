//! The unit of work a runner drives.
//!
//! A worker is stepped repeatedly; each step does one bounded increment of
//! work and reports whether to keep going, that it is done, or that it failed.
//! Nothing interrupts a step once it has started, so steps should return
//! promptly.
use std::future::Future;
use std::time::Duration;

/// Result of one successful worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More work remains; step again.
    Continue,
    /// The worker finished; no further steps.
    Done,
}

/// A worker failure, optionally carrying the exit status the process should
/// terminate with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerError {
    pub message: String,
    pub exit_status: Option<i32>,
}

#[allow(dead_code)]
impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exit_status: None,
        }
    }

    pub fn with_exit_status(mut self, status: i32) -> Self {
        self.exit_status = Some(status);
        self
    }
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_status {
            Some(status) => write!(f, "{} (exit status {})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for WorkerError {}

pub trait Worker: Send + 'static {
    /// Perform one bounded increment of work.
    fn step(&mut self) -> impl Future<Output = Result<Step, WorkerError>> + Send;
}

/// Placeholder worker: beats once per interval, forever.
pub struct Heartbeat {
    interval: Duration,
    beats: u64,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self { interval, beats: 0 }
    }
}

impl Worker for Heartbeat {
    async fn step(&mut self) -> Result<Step, WorkerError> {
        tokio::time::sleep(self.interval).await;
        self.beats += 1;
        tracing::debug!(beats = self.beats, "heartbeat");
        Ok(Step::Continue)
    }
}
