//! OS signal handling for the supervisor.
//!
//! Every watched signal gets its own tokio stream; a forwarder task per stream
//! pushes the delivered signal into one channel so the control loop can wait on
//! a single receiver. The same channel can be fed directly through
//! [`SignalHandler::sender`].
use nix::sys::signal::Signal;
use std::str::FromStr;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;

/// Signals watched regardless of configuration: every catchable signal whose
/// default action terminates the process, so none of them can kill it without
/// going through the control loop.
///
/// Signals whose default action is to ignore (`SIGPIPE` under the Rust
/// runtime, `SIGCHLD`, `SIGWINCH`, `SIGURG`) or to stop/continue the process
/// (`SIGTSTP`, `SIGTTIN`, `SIGTTOU`, `SIGCONT`) are left alone. They can still
/// be configured as the reload or kill signal.
pub const ALWAYS_WATCHED: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGALRM,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGSYS,
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGIO,
    #[cfg(target_os = "linux")]
    Signal::SIGPWR,
    #[cfg(all(
        target_os = "linux",
        not(any(
            target_arch = "mips",
            target_arch = "mips32r6",
            target_arch = "mips64",
            target_arch = "mips64r6",
            target_arch = "sparc64"
        ))
    ))]
    Signal::SIGSTKFLT,
];

/// Signals tokio refuses to register a handler for.
const FORBIDDEN: [Signal; 5] = [
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

/// A signal name that could not be turned into a catchable signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalParseError {
    Unknown { name: String },
    Uncatchable { signal: Signal },
}

impl std::fmt::Display for SignalParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalParseError::Unknown { name } => write!(f, "unknown signal {:?}", name),
            SignalParseError::Uncatchable { signal } => {
                write!(f, "signal {} cannot be handled", signal.as_str())
            }
        }
    }
}

impl std::error::Error for SignalParseError {}

/// Parse a signal name such as `HUP`, `sighup` or `SIGHUP`.
pub fn parse_signal(raw: &str) -> Result<Signal, SignalParseError> {
    let upper = raw.trim().to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };

    let signal = Signal::from_str(&name).map_err(|_| SignalParseError::Unknown {
        name: raw.to_string(),
    })?;

    if FORBIDDEN.contains(&signal) {
        return Err(SignalParseError::Uncatchable { signal });
    }
    Ok(signal)
}

/// Funnels OS signal delivery into a single receiver.
pub struct SignalHandler {
    tx: mpsc::Sender<Signal>,
    rx: mpsc::Receiver<Signal>,
    watched: Vec<Signal>,
}

impl SignalHandler {
    /// Create a handler with no OS registrations yet.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            tx,
            rx,
            watched: Vec::new(),
        }
    }

    /// Start receiving `signal` from the OS. Watching an already watched
    /// signal is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(&mut self, signal: Signal) -> std::io::Result<()> {
        if self.watched.contains(&signal) {
            return Ok(());
        }

        let mut stream = signal_stream(signal)?;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
        });

        tracing::debug!(signal = signal.as_str(), "watching signal");
        self.watched.push(signal);
        Ok(())
    }

    /// Watch every signal in `signals`.
    pub fn watch_all(&mut self, signals: &[Signal]) -> std::io::Result<()> {
        for signal in signals {
            self.watch(*signal)?;
        }
        Ok(())
    }

    /// Whether `signal` is registered with the OS.
    #[allow(dead_code)]
    pub fn is_watched(&self, signal: Signal) -> bool {
        self.watched.contains(&signal)
    }

    /// A sender feeding the same channel as OS delivery.
    #[allow(dead_code)]
    pub fn sender(&self) -> mpsc::Sender<Signal> {
        self.tx.clone()
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.rx.recv().await
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_stream(signal: Signal) -> std::io::Result<tokio::signal::unix::Signal> {
    tokio::signal::unix::signal(SignalKind::from_raw(signal as i32))
}
