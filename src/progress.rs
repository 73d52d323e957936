//! Sync progress reporting.
//!
//! Reports observable progress during `chaos sync` so users see which items
//! are being compared and fetched, and how many are left. Progress goes to
//! **stderr** so stdout stays parseable for scripts.

use std::io::Write;

/// A single progress event for a mirror run.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Fetching the remote manifest. Total unknown.
    Discovering { remote: String },
    /// `n` manifest entries processed out of `total`.
    Mirroring {
        remote: String,
        n: u64,
        total: u64,
    },
    /// Local items absent remotely are being removed.
    Pruning { remote: String, count: u64 },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync https://host  mirroring  12 / 340 items".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { remote } => {
                format!("sync {}  reading manifest...\n", remote)
            }
            SyncProgressEvent::Mirroring { remote, n, total } => format!(
                "sync {}  mirroring  {} / {} items\n",
                remote,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Pruning { remote, count } => {
                format!("sync {}  pruning  {} items\n", remote, format_number(*count))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { remote } => serde_json::json!({
                "event": "progress",
                "remote": remote,
                "phase": "discovering"
            }),
            SyncProgressEvent::Mirroring { remote, n, total } => serde_json::json!({
                "event": "progress",
                "remote": remote,
                "phase": "mirroring",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Pruning { remote, count } => serde_json::json!({
                "event": "progress",
                "remote": remote,
                "phase": "pruning",
                "count": count
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
