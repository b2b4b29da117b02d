//! Passive progress sink.
//!
//! The original C/C++ core registers process-wide callbacks; here the sink
//! is an explicit parameter threaded through the upgrader, with a silent
//! default so callers that don't care about progress don't have to do
//! anything.

use std::sync::Mutex;

/// Verbs a long-running phase can report through. Mirrors the four-verb
/// surface from the original output module (`rpmostree-output`), plus an
/// optional sub-message for inner items (e.g. "importing git-2.40...").
pub trait ProgressSink: Send + Sync {
    /// A one-off informational message (e.g. "Freed: 12.3 MB (pkgcache branches: 2)").
    fn message(&self, msg: &str) {
        let _ = msg;
    }

    /// Begin a task with `total` known steps (`None` if indeterminate).
    /// Returns a task handle used for subsequent updates.
    fn begin_task(&self, name: &str, total: Option<u64>) -> TaskId {
        let _ = (name, total);
        TaskId(0)
    }

    /// Report progress against a task started with [`begin_task`].
    fn progress_update(&self, task: TaskId, current: u64) {
        let _ = (task, current);
    }

    /// Update the sub-message of an in-progress task (e.g. the current
    /// package name while importing).
    fn set_sub_message(&self, task: TaskId, msg: &str) {
        let _ = (task, msg);
    }

    /// Mark a task as finished.
    fn end_task(&self, task: TaskId) {
        let _ = task;
    }
}

/// Opaque handle to an in-progress task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u64);

/// Default sink: drops everything. Used whenever a caller passes no sink.
#[derive(Default)]
pub struct SilentSink;

impl ProgressSink for SilentSink {}

/// A sink that records every call, useful in tests that want to assert on
/// the sequence of progress events without depending on terminal output.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn message(&self, msg: &str) {
        self.events.lock().unwrap().push(format!("message: {msg}"));
    }

    fn begin_task(&self, name: &str, total: Option<u64>) -> TaskId {
        self.events
            .lock()
            .unwrap()
            .push(format!("begin: {name} ({total:?})"));
        TaskId(0)
    }

    fn progress_update(&self, task: TaskId, current: u64) {
        self.events
            .lock()
            .unwrap()
            .push(format!("progress: {}/{current}", task.0));
    }

    fn set_sub_message(&self, task: TaskId, msg: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("submsg: {}/{msg}", task.0));
    }

    fn end_task(&self, task: TaskId) {
        self.events.lock().unwrap().push(format!("end: {}", task.0));
    }
}

/// A terminal-rendering sink built on `indicatif`, for an interactive CLI
/// experience. Kept independent of any specific CLI crate so it can be
/// reused by any host application.
pub struct TerminalSink {
    bar: Mutex<Option<indicatif::ProgressBar>>,
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl ProgressSink for TerminalSink {
    fn message(&self, msg: &str) {
        println!("{msg}");
    }

    fn begin_task(&self, name: &str, total: Option<u64>) -> TaskId {
        let bar = match total {
            Some(t) => indicatif::ProgressBar::new(t),
            None => indicatif::ProgressBar::new_spinner(),
        };
        bar.set_message(name.to_string());
        *self.bar.lock().unwrap() = Some(bar);
        TaskId(0)
    }

    fn progress_update(&self, _task: TaskId, current: u64) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.set_position(current);
        }
    }

    fn set_sub_message(&self, _task: TaskId, msg: &str) {
        if let Some(bar) = self.bar.lock().unwrap().as_ref() {
            bar.set_message(msg.to_string());
        }
    }

    fn end_task(&self, _task: TaskId) {
        if let Some(bar) = self.bar.lock().unwrap().take() {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recording_sink_captures_sequence() {
        let sink = RecordingSink::default();
        let t = sink.begin_task("import", Some(10));
        sink.progress_update(t, 5);
        sink.end_task(t);
        assert_eq!(
            sink.events(),
            vec![
                "begin: import (Some(10))".to_string(),
                "progress: 0/5".to_string(),
                "end: 0".to_string(),
            ]
        );
    }

    #[test]
    fn silent_sink_does_nothing_observable() {
        let sink = SilentSink;
        let t = sink.begin_task("x", None);
        sink.progress_update(t, 1);
        sink.end_task(t);
    }
}
