//! Session cache (component E).
//!
//! The small amount of derived state a session accumulates: the
//! breakpoint registry and the last `stopped` event. The orchestrator
//! is the sole writer; everything else only reads.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;

#[derive(Debug, Default)]
pub struct SessionCache {
    /// Canonicalized source path -> sorted, deduplicated line numbers.
    breakpoints: HashMap<PathBuf, Vec<i64>>,
    last_stopped: Option<Value>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful `setBreakpoints` reply for `path`. An empty
    /// `lines` removes the entry entirely.
    pub fn record_breakpoints(&mut self, path: PathBuf, mut lines: Vec<i64>) {
        if lines.is_empty() {
            self.breakpoints.remove(&path);
            return;
        }
        lines.sort_unstable();
        lines.dedup();
        self.breakpoints.insert(path, lines);
    }

    pub fn breakpoints(&self) -> &HashMap<PathBuf, Vec<i64>> {
        &self.breakpoints
    }

    pub fn record_stopped(&mut self, event: Value) {
        self.last_stopped = Some(event);
    }

    pub fn last_stopped(&self) -> Option<&Value> {
        self.last_stopped.as_ref()
    }

    pub fn last_stopped_thread_id(&self) -> Option<i64> {
        self.last_stopped
            .as_ref()
            .and_then(|ev| ev.get("body"))
            .and_then(|b| b.get("threadId"))
            .and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_sorted_deduplicated_lines() {
        let mut cache = SessionCache::new();
        cache.record_breakpoints(PathBuf::from("/a.py"), vec![10, 5, 5, 8]);
        assert_eq!(
            cache.breakpoints().get(&PathBuf::from("/a.py")),
            Some(&vec![5, 8, 10])
        );
    }

    #[test]
    fn empty_lines_removes_the_entry() {
        let mut cache = SessionCache::new();
        cache.record_breakpoints(PathBuf::from("/a.py"), vec![1]);
        cache.record_breakpoints(PathBuf::from("/a.py"), vec![]);
        assert!(cache.breakpoints().get(&PathBuf::from("/a.py")).is_none());
    }

    #[test]
    fn last_stopped_thread_id_reads_through_body() {
        let mut cache = SessionCache::new();
        cache.record_stopped(json!({"event": "stopped", "body": {"threadId": 2}}));
        assert_eq!(cache.last_stopped_thread_id(), Some(2));
    }
}
