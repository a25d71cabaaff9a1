//! Logger construction.
//!
//! The logger is an explicit [`Dispatch`], not a global subscriber: the
//! supervisor and every runner task are polled inside it with
//! [`tracing::instrument::WithSubscriber`]. The level filter sits behind a
//! reload layer so a configuration reload can change verbosity in place.
use crate::config::LogLevel;
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle to the process logger. Cheap to clone.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    filter: reload::Handle<EnvFilter, Registry>,
}

impl Logger {
    /// JSON records on stderr at `level`.
    pub fn new(level: LogLevel) -> Self {
        Self::with_writer(level, std::io::stderr)
    }

    pub fn with_writer<W>(level: LogLevel, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let (filter, handle) = reload::Layer::new(filter_for(level));
        let subscriber = Registry::default().with(filter).with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer),
        );

        Self {
            dispatch: Dispatch::new(subscriber),
            filter: handle,
        }
    }

    /// Logger for unit tests; output is captured by the test harness.
    #[cfg(test)]
    pub fn for_tests(level: LogLevel) -> Self {
        Self::with_writer(level, fmt::TestWriter::new)
    }

    /// Swap the level filter.
    pub fn set_level(&self, level: LogLevel) -> Result<(), reload::Error> {
        self.filter.reload(filter_for(level))
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

fn filter_for(level: LogLevel) -> EnvFilter {
    let directive = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    EnvFilter::new(directive)
}
