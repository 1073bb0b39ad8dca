use std::fmt;
use std::io;

/// One setting that failed to convert during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigIssue {
    pub field: String,
    pub message: String,
}

impl ConfigIssue {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self { field: field.to_owned(), message: message.into() }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[ConfigIssue]) -> String {
    issues.iter().map(|i| i.to_string()).collect::<Vec<String>>().join("; ")
}

/// Errors surfaced by the run lifecycle.
///
/// Hardware failures never escape a run as `Err`; the sequencer folds them into a
/// [`crate::sequencer::RunResult`]. The variants here are what `start`, the validation
/// stage and the store hand back to a caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// One or more settings failed to parse before any hardware was touched
    #[error("invalid settings: {}", join_issues(.0))]
    Configuration(Vec<ConfigIssue>),

    /// An instrument could not be opened during setup
    #[error("could not connect to {instrument} on {port}: {source}")]
    Connection {
        instrument: String,
        port: String,
        #[source]
        source: io::Error,
    },

    /// A hardware call failed while the run was in progress
    #[error("{instrument} failed during {operation}: {source}")]
    Instrument {
        instrument: String,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// The acquired current was zero so no resistance can be derived
    #[error("zero current at t={timestamp:.3}s on {channel_tag}, resistance undefined")]
    DivisionByZero { timestamp: f64, channel_tag: String },

    /// The instrument returned values that give no finite resistance
    #[error("unusable reading at t={timestamp:.3}s on {channel_tag}: {detail}")]
    InvalidReading { timestamp: f64, channel_tag: String, detail: String },

    /// `start` was called while another run was active
    #[error("a run is already active")]
    AlreadyRunning,

    /// The background thread ended without reporting a result
    #[error("run thread panicked")]
    ThreadPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_cbor::Error),

    #[error("malformed table: {0}")]
    Table(String),
}

/// Fieldless classification of [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connection,
    Instrument,
    DivisionByZero,
    AlreadyRunning,
    Store,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Instrument { .. } | Error::InvalidReading { .. } | Error::ThreadPanicked => ErrorKind::Instrument,
            Error::DivisionByZero { .. } => ErrorKind::DivisionByZero,
            Error::AlreadyRunning => ErrorKind::AlreadyRunning,
            Error::Io(_) | Error::Encoding(_) | Error::Table(_) => ErrorKind::Store,
        }
    }

    pub(crate) fn instrument(instrument: &str, operation: &'static str, source: io::Error) -> Self {
        Error::Instrument { instrument: instrument.to_owned(), operation, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_message_lists_every_field() {
        let e = Error::Configuration(vec![
            ConfigIssue::new("sb_port", "expected an integer"),
            ConfigIssue::new("loop_count", "expected an integer"),
        ]);
        let msg = e.to_string();
        assert!(msg.contains("sb_port: expected an integer"));
        assert!(msg.contains("loop_count"));
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn io_errors_classify_as_store() {
        let e: Error = io::Error::new(io::ErrorKind::Other, "disk full").into();
        assert_eq!(e.kind(), ErrorKind::Store);
    }
}
