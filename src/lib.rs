//! # CN0503 Host Library
//!
//! Host-side control of the CN0503 optical liquid measurement board over its ASCII serial
//! protocol. The board streams ratio data and answers configuration queries; this crate
//! keeps a model of the device in sync with those replies.
//!
//! ## Crate Structure
//!
//! - **`session`**: The `Session` object. Owns the link, the device model and the
//!   dispatcher thread, and exposes every device operation. Start here.
//! - **`transport`**: Serial link with reader and writer threads, bounded queues and a
//!   `SerialConnector` seam (real ports via `serialport`, or an in-memory mock).
//! - **`protocol`**: Command encoding, reply tokenizing and configuration file parsing.
//! - **`dispatcher`**: Applies parsed replies to the model and streaming buffers.
//! - **`model`**: Device, channel and streaming buffer state.
//! - **`calibration`**: Polynomial fitting and baseline statistics.
//! - **`config`**: Settings loaded from TOML and environment variables.
//! - **`error`**: The `Cn0503Error` enum and `AppResult` alias.
//! - **`diagnostics`**: In-memory log of reported errors and device notices.
//! - **`tracing_init`**: Logging setup.

pub mod calibration;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod protocol;
pub mod session;
pub mod tracing_init;
pub mod transport;

pub use error::{AppResult, Cn0503Error};
pub use session::Session;
