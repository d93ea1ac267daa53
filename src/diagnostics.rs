//! In-memory diagnostic sink.
//!
//! Protocol and validation errors are never fatal to a session. Besides being logged,
//! each reported error lands here so a UI (or a test) can show what the device or the
//! caller got wrong without scraping log output.

use crate::error::Cn0503Error;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

const MAX_DIAGNOSTIC_ENTRIES: usize = 1000;

/// How serious a diagnostic entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational echo from the device.
    Info,
    /// A reported, non-fatal error.
    Error,
}

/// Represents a single diagnostic entry.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Local time the entry was recorded
    pub timestamp: DateTime<Local>,
    /// Error or note
    pub severity: Severity,
    /// Human-readable text
    pub message: String,
}

/// A thread-safe, fixed-capacity diagnostic buffer.
///
/// Clones share the same buffer.
#[derive(Clone)]
pub struct DiagnosticLog(Arc<Mutex<VecDeque<Diagnostic>>>);

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticLog {
    /// Empty log.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(
            MAX_DIAGNOSTIC_ENTRIES,
        ))))
    }

    /// Log and record a non-fatal error.
    pub fn report(&self, err: &Cn0503Error) {
        warn!(kind = ?err.kind(), "{}", err);
        self.push(Severity::Error, err.to_string());
    }

    /// Log and record an informational message.
    pub fn note(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.push(Severity::Info, message);
    }

    fn push(&self, severity: Severity, message: String) {
        let mut entries = self.0.lock();
        if entries.len() == MAX_DIAGNOSTIC_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(Diagnostic {
            timestamp: Local::now(),
            severity,
            message,
        });
    }

    /// Copy of every entry currently held.
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.0.lock().iter().cloned().collect()
    }

    /// Copy of the reported errors only.
    pub fn errors(&self) -> Vec<Diagnostic> {
        self.0
            .lock()
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .cloned()
            .collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Diagnostic> {
        self.0.lock().drain(..).collect()
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}
