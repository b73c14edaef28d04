//! Indexing progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts. The
//! human format is one line per event; the JSON format is one object per
//! line.

use std::io::Write;
use std::sync::Arc;

use crate::ingest::IndexState;

/// A single progress event emitted by the indexing pipeline.
#[derive(Clone, Debug)]
pub enum IndexProgressEvent {
    /// Walking the tree; total unknown.
    Scanning { root: String, found: u64 },
    /// A stage finished part of the work.
    Processing {
        state: IndexState,
        done: u64,
        total: u64,
    },
    Finished {
        updated: u64,
        unchanged: u64,
        removed: u64,
        failed: u64,
    },
}

pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// "index  embedding  120 / 1,500 documents"
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Scanning { root, found } => {
                format!("index {}  scanning  {} files\n", root, format_number(*found))
            }
            IndexProgressEvent::Processing { state, done, total } => format!(
                "index  {}  {} / {} documents\n",
                state.as_str(),
                format_number(*done),
                format_number(*total)
            ),
            IndexProgressEvent::Finished {
                updated,
                unchanged,
                removed,
                failed,
            } => format!(
                "index  done  {} updated, {} unchanged, {} removed, {} failed\n",
                format_number(*updated),
                format_number(*unchanged),
                format_number(*removed),
                format_number(*failed)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        let obj = match &event {
            IndexProgressEvent::Scanning { root, found } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "root": root,
                "found": found
            }),
            IndexProgressEvent::Processing { state, done, total } => serde_json::json!({
                "event": "progress",
                "phase": state.as_str(),
                "n": done,
                "total": total
            }),
            IndexProgressEvent::Finished {
                updated,
                unchanged,
                removed,
                failed,
            } => serde_json::json!({
                "event": "finished",
                "updated": updated,
                "unchanged": unchanged,
                "removed": removed,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
