//! Diagnostics sink injected into the upstream core.
//!
//! Channels, servers and the manager never log directly; they report
//! through a [`Diagnostics`] handle so embedders decide where messages go.

use std::sync::{Arc, Mutex};

/// Severity of a diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Error,
}

/// Leveled text sink.
pub trait Diagnostics: Send + Sync + std::fmt::Debug {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "upstream_proxy::upstream", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "upstream_proxy::upstream", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "upstream_proxy::upstream", "{message}");
    }
}

/// Keeps every message in memory.
///
/// Used by tests to assert on what the core reported, and by embedders that
/// want to surface startup problems after the fact.
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    entries: Mutex<Vec<(Level, String)>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all recorded messages, oldest first.
    pub fn entries(&self) -> Vec<(Level, String)> {
        self.lock().clone()
    }

    /// Messages recorded at `level`.
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(Level::Error)
    }

    fn push(&self, level: Level, message: &str) {
        self.lock().push((level, message.to_string()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Level, String)>> {
        // Poisoning is ignored; the log stays readable.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn debug(&self, message: &str) {
        self.push(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_keeps_order_and_levels() {
        let diag = RecordingDiagnostics::new();
        diag.info("starting");
        diag.error("collision");
        diag.debug("line");

        let entries = diag.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (Level::Info, "starting".to_string()));
        assert_eq!(diag.errors(), vec!["collision".to_string()]);
        assert_eq!(diag.messages(Level::Debug), vec!["line".to_string()]);
    }
}
