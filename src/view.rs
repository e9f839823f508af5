//! View sink: the only coupling between the core and any UI.
//!
//! Every component logs through a [`View`]. Without the terminal UI the sink
//! writes straight to stderr; with `MONDAY_ENABLE_UI` set, lines land in a
//! bounded buffer the UI layer drains, dropping the oldest on overflow so a
//! slow UI can never stall the core.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write as _;
use std::sync::Arc;

pub type SharedView = Arc<dyn View>;

/// Sink for user-facing output. Writes must never block the caller.
pub trait View: Send + Sync {
    /// Write raw bytes.
    fn write(&self, bytes: &[u8]);

    /// Write a formatted line.
    fn writef(&self, args: fmt::Arguments<'_>) {
        let mut line = args.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write(line.as_bytes());
    }
}

/// Direct stderr sink, used when the terminal UI is disabled.
#[derive(Debug, Default)]
pub struct StderrView;

impl View for StderrView {
    fn write(&self, bytes: &[u8]) {
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(bytes);
    }
}

/// Bounded line buffer drained by the UI layer.
#[derive(Debug)]
pub struct BufferedView {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl BufferedView {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Take every buffered line, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.lines.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl View for BufferedView {
    fn write(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut lines = self.lines.lock();
        for line in text.lines() {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }
}

/// Sink that discards everything. Test helper.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct NullView;

#[cfg(test)]
impl View for NullView {
    fn write(&self, _bytes: &[u8]) {}
}
