//! Build log records and the writer actions emit them through.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cds_plugin::{PluginStatus, ProgressEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Value carried by the terminal record of a failed build.
pub const FAILURE_MARKER: &str = "status: Fail";

/// Outcome of an action, a stage, or a whole build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Fail,
    Warning,
}

impl Status {
    /// Combine two outcomes: `Fail` beats `Warning` beats `Success`.
    pub fn worst(self, other: Status) -> Status {
        match (self, other) {
            (Status::Fail, _) | (_, Status::Fail) => Status::Fail,
            (Status::Warning, _) | (_, Status::Warning) => Status::Warning,
            _ => Status::Success,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::Fail => "Fail",
            Status::Warning => "Warning",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PluginStatus> for Status {
    fn from(s: PluginStatus) -> Self {
        match s {
            PluginStatus::Success => Status::Success,
            PluginStatus::Fail => Status::Fail,
            PluginStatus::Warning => Status::Warning,
        }
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// One line of build output.
///
/// Step lines have `id != 0`. A record with `id == 0` is a terminal signal;
/// when its value contains [`FAILURE_MARKER`] the build failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub step: String,
    pub value: String,
}

impl LogRecord {
    pub fn new(id: u64, step: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            step: step.into(),
            value: value.into(),
        }
    }

    /// Terminal record closing a build stream.
    pub fn terminal(status: Status) -> Self {
        Self::new(0, "", format!("status: {status}"))
    }

    pub fn is_failure_marker(&self) -> bool {
        self.id == 0 && self.value.contains(FAILURE_MARKER)
    }
}

// ---------------------------------------------------------------------------
// LogWriter
// ---------------------------------------------------------------------------

/// Cloneable sink for step lines of one build. Ids are shared across clones
/// so lines stay numbered in emission order.
#[derive(Debug, Clone)]
pub struct LogWriter {
    tx: mpsc::UnboundedSender<LogRecord>,
    next_id: Arc<AtomicU64>,
}

impl LogWriter {
    pub fn new(tx: mpsc::UnboundedSender<LogRecord>) -> Self {
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Writer plus the receiving end of a fresh channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn line(&self, step: &str, value: impl Into<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // A closed receiver means nobody is reading; the build keeps going.
        let _ = self.tx.send(LogRecord::new(id, step, value));
    }

    /// One line per key/value pair of a plugin progress entry.
    pub fn progress(&self, entry: &ProgressEntry) {
        for (key, value) in &entry.entries {
            self.line(&entry.step, format!("{key}: {value}"));
        }
    }

    pub fn terminal(&self, status: Status) {
        let _ = self.tx.send(LogRecord::terminal(status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn worst_status() {
        assert_eq!(Status::Success.worst(Status::Warning), Status::Warning);
        assert_eq!(Status::Warning.worst(Status::Fail), Status::Fail);
        assert_eq!(Status::Success.worst(Status::Success), Status::Success);
    }

    #[test]
    fn failure_marker_needs_id_zero() {
        assert!(LogRecord::terminal(Status::Fail).is_failure_marker());
        assert!(!LogRecord::terminal(Status::Success).is_failure_marker());
        assert!(!LogRecord::new(4, "build", "status: Fail").is_failure_marker());
    }

    #[test]
    fn writer_numbers_lines_across_clones() {
        let (writer, mut rx) = LogWriter::channel();
        let other = writer.clone();
        writer.line("a", "one");
        other.line("b", "two");
        let mut entries = BTreeMap::new();
        entries.insert("k".to_string(), "v".to_string());
        writer.progress(&ProgressEntry {
            step: "p".into(),
            entries,
        });
        writer.terminal(Status::Success);

        let ids: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 0]);
    }
}
