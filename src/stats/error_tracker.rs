//! Error grouping for run statistics
//!
//! Errors are grouped by a composite key of (code location, error kind,
//! generic message). The generic message replaces variable spans (numbers and
//! hex literals) with a wildcard so `"timeout 12 ms"` and `"timeout 400 ms"`
//! land in the same group.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

/// Wildcard substituted for variable spans in error messages.
const WILDCARD: &str = "_";

static VARIABLE_SPAN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"0[xX][0-9a-fA-F]+|\d+(?:\.\d+)?").unwrap_or_else(|e| {
        unreachable!("static regex must compile: {e}");
    })
});

/// Which dimensions participate in the grouping key.
#[derive(Debug, Clone)]
pub struct ErrorTrackerOptions {
    pub show_stack_location: bool,
    pub show_error_kind: bool,
    pub show_error_message: bool,
}

impl Default for ErrorTrackerOptions {
    fn default() -> Self {
        Self {
            show_stack_location: true,
            show_error_kind: true,
            show_error_message: true,
        }
    }
}

/// One group of similar errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorGroup {
    pub location: Option<String>,
    pub kind: Option<String>,
    pub message: Option<String>,
    pub count: u64,
}

/// Tracks and groups errors observed during a run.
#[derive(Debug, Default)]
pub struct ErrorTracker {
    options: ErrorTrackerOptions,
    groups: Mutex<HashMap<String, ErrorGroup>>,
    total: Mutex<u64>,
}

impl ErrorTracker {
    #[must_use]
    pub fn new(options: ErrorTrackerOptions) -> Self {
        Self {
            options,
            groups: Mutex::new(HashMap::new()),
            total: Mutex::new(0),
        }
    }

    /// Record one error occurrence.
    ///
    /// Without an explicit `location` the caller's file and line are used, so
    /// errors recorded from the same spot group together.
    #[track_caller]
    pub fn add(&self, kind: &str, message: &str, location: Option<&str>) {
        let caller = std::panic::Location::caller();
        let location = self.options.show_stack_location.then(|| {
            location
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}:{}", caller.file(), caller.line()))
        });
        let kind = self.options.show_error_kind.then(|| kind.to_string());
        let message = self
            .options
            .show_error_message
            .then(|| generic_message(message));

        let key = format!(
            "{}|{}|{}",
            location.as_deref().unwrap_or(""),
            kind.as_deref().unwrap_or(""),
            message.as_deref().unwrap_or("")
        );

        let mut groups = self.groups.lock();
        groups
            .entry(key)
            .and_modify(|group| group.count += 1)
            .or_insert(ErrorGroup {
                location,
                kind,
                message,
                count: 1,
            });
        *self.total.lock() += 1;
    }

    /// Total number of recorded errors.
    #[must_use]
    pub fn total(&self) -> u64 {
        *self.total.lock()
    }

    /// Number of distinct error groups.
    #[must_use]
    pub fn unique_error_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// The `n` most frequent error groups, most popular first.
    #[must_use]
    pub fn most_common_errors(&self, n: usize) -> Vec<ErrorGroup> {
        let mut groups: Vec<ErrorGroup> = self.groups.lock().values().cloned().collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count));
        groups.truncate(n);
        groups
    }
}

/// Replace numbers and hex literals with a wildcard token.
#[must_use]
pub fn generic_message(message: &str) -> String {
    VARIABLE_SPAN.replace_all(message, WILDCARD).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_collapses_numbers() {
        assert_eq!(generic_message("timeout 12 ms"), "timeout _ ms");
        assert_eq!(generic_message("timeout 400 ms"), "timeout _ ms");
        assert_eq!(generic_message("at 0xDEADbeef in frame 3"), "at _ in frame _");
        assert_eq!(generic_message("ratio 0.75 exceeded"), "ratio _ exceeded");
    }

    #[test]
    fn similar_messages_group_together() {
        let tracker = ErrorTracker::default();
        tracker.add("TimeoutError", "timeout 12 ms", Some("fetch.rs:10"));
        tracker.add("TimeoutError", "timeout 400 ms", Some("fetch.rs:10"));
        assert_eq!(tracker.total(), 2);
        assert_eq!(tracker.unique_error_count(), 1);

        let top = tracker.most_common_errors(5);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].count, 2);
        assert_eq!(top[0].message.as_deref(), Some("timeout _ ms"));
    }

    #[test]
    fn different_kinds_split_groups() {
        let tracker = ErrorTracker::default();
        tracker.add("TimeoutError", "boom", Some("a.rs:1"));
        tracker.add("ValueError", "boom", Some("a.rs:1"));
        assert_eq!(tracker.unique_error_count(), 2);
    }

    #[test]
    fn most_common_is_sorted_by_count() {
        let tracker = ErrorTracker::default();
        tracker.add("A", "rare", Some("x:1"));
        tracker.add("B", "common", Some("y:2"));
        tracker.add("B", "common", Some("y:2"));
        let top = tracker.most_common_errors(1);
        assert_eq!(top[0].kind.as_deref(), Some("B"));
        assert_eq!(top[0].count, 2);
    }

    #[test]
    fn disabled_dimensions_collapse_groups() {
        let tracker = ErrorTracker::new(ErrorTrackerOptions {
            show_stack_location: false,
            show_error_kind: false,
            show_error_message: true,
        });
        tracker.add("A", "same 1", Some("x:1"));
        tracker.add("B", "same 2", Some("y:2"));
        assert_eq!(tracker.unique_error_count(), 1);
        assert_eq!(tracker.most_common_errors(1)[0].count, 2);
    }

    #[test]
    fn caller_location_is_captured_when_missing() {
        let tracker = ErrorTracker::default();
        tracker.add("A", "boom", None);
        let top = tracker.most_common_errors(1);
        let location = top[0].location.as_deref().unwrap_or("");
        assert!(location.contains("error_tracker.rs"));
    }
}
