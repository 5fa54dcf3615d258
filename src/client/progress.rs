//! Throttled progress output for compression and upload phases.

use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MIN_INTERVAL: Duration = Duration::from_millis(250);

/// Prints `label: done/total (pct%)` lines to stderr, at most a few times a
/// second. The final update always prints.
pub struct Progress {
    label: String,
    last_emit: Mutex<Option<Instant>>,
}

impl Progress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            last_emit: Mutex::new(None),
        }
    }

    pub fn update(&self, done: usize, total: usize) {
        let mut last = self.last_emit.lock().unwrap();
        let now = Instant::now();
        let due = match *last {
            Some(at) => now.duration_since(at) >= MIN_INTERVAL,
            None => true,
        };
        if !due && done < total {
            return;
        }
        *last = Some(now);

        let pct = if total == 0 {
            100
        } else {
            done * 100 / total
        };
        eprint!("\r{}: {}/{} ({}%)", self.label, done, total, pct);
        let _ = std::io::stderr().flush();
    }

    pub fn finish(&self, message: &str) {
        eprintln!("\r{}: {}", self.label, message);
    }
}
