//! Custom error types for the crate.
//!
//! This module defines the primary error type, `Cn0503Error`, shared by the transport,
//! the protocol layer and the session. Using the `thiserror` crate, it provides a single
//! place where every failure mode of a CN0503 session is named.
//!
//! ## Error Taxonomy
//!
//! Every variant maps onto one [`ErrorKind`]:
//!
//! - **`Transport`**: the serial link is unavailable or failed mid-session. The transport
//!   closes itself and the caller must `connect` again.
//! - **`Protocol`**: an inbound line could not be understood (no space, bad number, unknown
//!   token). The dispatcher reports it and moves on to the next line.
//! - **`Validation`**: a command was rejected before it reached the wire (unknown name,
//!   help-colliding raw text, ratio index out of range).
//! - **`SampleIntegrity`**: a streaming frame did not have the established column count and
//!   was dropped as a whole.
//! - **`Configuration`**: settings could not be loaded or failed validation.
//!
//! None of these are fatal to the process. `is_recoverable()` tells a caller whether the
//! session can simply carry on.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, Cn0503Error>;

/// Coarse classification of a [`Cn0503Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Link unavailable or I/O fault.
    Transport,
    /// Malformed inbound line.
    Protocol,
    /// Command rejected before transmission.
    Validation,
    /// Streaming frame dropped.
    SampleIntegrity,
    /// Settings load or validation failure.
    Configuration,
    /// Anything else (timeouts, calibration input, local files).
    Other,
}

/// Every failure a CN0503 session can report.
#[derive(Error, Debug)]
pub enum Cn0503Error {
    /// Settings file or environment could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings parsed but hold unusable values
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The serial device could not be opened
    #[error("Error opening the serial device '{port}': {reason}")]
    Connection {
        /// Port name as given
        port: String,
        /// OS or driver message
        reason: String,
    },

    /// No link is open
    #[error("Not connected to a serial device")]
    NotConnected,

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Built without the named cargo feature
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// A command was refused before it reached the wire
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// An inbound line could not be understood
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A ratio index at or past the number of ratios
    #[error("Ratio index {index} is out of range (must be less than {count})")]
    RatioIndexOutOfRange {
        /// Index as received or requested
        index: usize,
        /// Number of ratios on the board
        count: usize,
    },

    /// A frame did not have the established column count
    #[error("Wrong amount of data items ({actual}, expected {expected}). Sample skipped")]
    SampleWidthMismatch {
        /// Established width
        expected: usize,
        /// Width of the dropped frame
        actual: usize,
    },

    /// Waiting for the named thing took too long
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Calibration input cannot produce a fit
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// Writing samples or configuration files failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A configuration file line that maps to no device command
    #[error("Unsupported config line {line}: {text}")]
    UnsupportedConfigLine {
        /// 1-based line number
        line: usize,
        /// The line as read
        text: String,
    },
}

impl From<figment::Error> for Cn0503Error {
    fn from(value: figment::Error) -> Self {
        Cn0503Error::Config(Box::new(value))
    }
}

impl Cn0503Error {
    /// Map this error onto the session error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Cn0503Error::Config(_) | Cn0503Error::Configuration(_) => ErrorKind::Configuration,
            Cn0503Error::Io(_)
            | Cn0503Error::Connection { .. }
            | Cn0503Error::NotConnected
            | Cn0503Error::SerialFeatureDisabled => ErrorKind::Transport,
            Cn0503Error::MalformedPacket(_) => ErrorKind::Protocol,
            Cn0503Error::InvalidCommand(_)
            | Cn0503Error::RatioIndexOutOfRange { .. }
            | Cn0503Error::UnsupportedConfigLine { .. } => ErrorKind::Validation,
            Cn0503Error::SampleWidthMismatch { .. } => ErrorKind::SampleIntegrity,
            Cn0503Error::FeatureNotEnabled(_)
            | Cn0503Error::Timeout(_)
            | Cn0503Error::Calibration(_)
            | Cn0503Error::Storage(_) => ErrorKind::Other,
        }
    }

    /// Whether the session can keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Cn0503Error::Config(_)
                | Cn0503Error::Configuration(_)
                | Cn0503Error::SerialFeatureDisabled
                | Cn0503Error::FeatureNotEnabled(_)
        )
    }
}
