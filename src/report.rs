//! Error reporting for background consumer failures.
//!
//! Handler failures are never surfaced to the operation that triggered the
//! publish; they go to an [`ErrorReporter`] and the message stays pending
//! for retry.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::error;

/// Sink for failures that happen on the delivery path, out of band of any
/// caller.
pub trait ErrorReporter: Send + Sync {
    /// Report a failure with a short subject and formatted context
    /// (typically the channel and payload involved).
    fn report(&self, err: &dyn fmt::Display, subject: &str, context: &str);
}

/// Reporter that writes through `tracing`.
#[derive(Default)]
pub struct LogReporter;

impl LogReporter {
    pub fn new() -> Self {
        LogReporter
    }
}

impl ErrorReporter for LogReporter {
    fn report(&self, err: &dyn fmt::Display, subject: &str, context: &str) {
        error!(subject, context, "consumer failure: {}", err);
    }
}

/// Reporter that collects formatted reports into a shared buffer.
///
/// Useful in tests to assert that a failure was reported without parsing
/// log output.
pub struct BufferReporter {
    buffer: Arc<Mutex<Vec<String>>>,
}

impl BufferReporter {
    pub fn new(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        BufferReporter { buffer }
    }
}

impl ErrorReporter for BufferReporter {
    fn report(&self, err: &dyn fmt::Display, subject: &str, context: &str) {
        let line = format!("[{}] {} ({})", subject, err, context);
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_reporter_collects() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let reporter = BufferReporter::new(buffer.clone());

        reporter.report(&"handler blew up", "channel run/new", "payload {}");

        let reports = buffer.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].contains("run/new"));
        assert!(reports[0].contains("handler blew up"));
    }
}
