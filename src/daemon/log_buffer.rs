use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const DEFAULT_MAX_LINES: usize = 10_000;

/// Output captured from worker processes, one bounded ring per plugin instance.
///
/// Lines survive a worker restart so the output of a crashed process can
/// still be read through `fleet logs`.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    pub fn push(&self, instance: &str, line: String) {
        let mut logs = self.logs.write().expect("LogBuffer lock poisoned");
        let ring = logs.entry(instance.to_string()).or_default();
        if ring.len() == self.max_lines {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    /// Last `n` lines of `instance`, oldest first.
    pub fn tail(&self, instance: &str, n: usize) -> Vec<String> {
        let logs = self.logs.read().expect("LogBuffer lock poisoned");
        let Some(ring) = logs.get(instance) else {
            return Vec::new();
        };
        ring.iter().skip(ring.len().saturating_sub(n)).cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
