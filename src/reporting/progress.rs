//! # Progress Reporting Module / 进度报告模块
//!
//! The sink controllers and hosts report into. A single shared
//! [`ProgressReporter`] serialises events from all controllers, keeps the
//! ordered event stream for the run report, and forwards every event to the
//! configured presenters.
//!
//! 控制器和宿主报告进度的接收端。单个共享的 [`ProgressReporter`]
//! 将所有控制器的事件串行化，为运行报告保留有序的事件流，
//! 并将每个事件转发给已配置的展示器。

use colored::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::core::models::{NodeId, ProgressEvent};
use crate::core::protocol::HostEvent;

/// Presents progress as it happens.
/// 实时展示进度。
pub trait ProgressPresenter: Send + Sync {
    fn task_changed(&self, source: &NodeId, name: &str);
    fn progress(&self, source: &NodeId, completed: u64, total: u64);
    fn log(&self, source: &NodeId, channel: &str, text: &str);
}

/// Writes a log message each time the task name of a source changes.
#[derive(Debug, Default)]
pub struct TracingPresenter;

impl ProgressPresenter for TracingPresenter {
    fn task_changed(&self, source: &NodeId, name: &str) {
        info!(source = %source, task = name, "task changed");
    }

    fn progress(&self, _source: &NodeId, _completed: u64, _total: u64) {}

    fn log(&self, source: &NodeId, channel: &str, text: &str) {
        info!(source = %source, channel, "{}", text.trim_end());
    }
}

/// Coloured terminal lines for interactive runs.
#[derive(Debug, Default)]
pub struct ConsolePresenter {
    /// Also print log events (command output).
    pub verbose: bool,
}

impl ProgressPresenter for ConsolePresenter {
    fn task_changed(&self, source: &NodeId, name: &str) {
        println!("{} {} {}", "▶".blue(), format!("[{source}]").cyan(), name);
    }

    fn progress(&self, source: &NodeId, completed: u64, total: u64) {
        println!(
            "  {} {}",
            format!("[{source}]").cyan(),
            format!("{completed}/{total}").dimmed()
        );
    }

    fn log(&self, source: &NodeId, channel: &str, text: &str) {
        if !self.verbose {
            return;
        }
        for line in text.lines() {
            println!("  {} {} {}", format!("[{source}]").dimmed(), channel.dimmed(), line);
        }
    }
}

#[derive(Default)]
struct ReporterState {
    events: Vec<ProgressEvent>,
    /// Current task name and counters per source.
    current: HashMap<NodeId, (String, u64, u64)>,
}

struct ReporterInner {
    state: Mutex<ReporterState>,
    presenters: Vec<Box<dyn ProgressPresenter>>,
}

/// Shared progress sink for a run.
/// 一次运行共享的进度接收端。
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// A reporter that only records events.
    pub fn new() -> Self {
        Self::with_presenters(Vec::new())
    }

    pub fn with_presenters(presenters: Vec<Box<dyn ProgressPresenter>>) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                state: Mutex::new(ReporterState::default()),
                presenters,
            }),
        }
    }

    /// A handle that reports on behalf of `source`.
    pub fn handle(&self, source: NodeId) -> ProgressHandle {
        ProgressHandle {
            reporter: self.clone(),
            source,
        }
    }

    /// The events recorded so far, in the order they were reported.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().events.clone()
    }

    /// Drains the recorded events.
    pub fn take_events(&self) -> Vec<ProgressEvent> {
        let mut state = self.lock();
        state.current.clear();
        std::mem::take(&mut state.events)
    }

    // A presenter that panicked must not silence every later report.
    fn lock(&self) -> MutexGuard<'_, ReporterState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task_changed(&self, source: &NodeId, name: String) {
        let mut state = self.lock();
        state
            .current
            .insert(source.clone(), (name.clone(), 0, 0));
        state.events.push(ProgressEvent {
            source: source.clone(),
            task_name: name.clone(),
            completed_units: 0,
            total_units: 0,
        });
        for presenter in &self.inner.presenters {
            presenter.task_changed(source, &name);
        }
    }

    fn progress(&self, source: &NodeId, completed: u64, total: u64) {
        let mut state = self.lock();
        let entry = state
            .current
            .entry(source.clone())
            .or_insert_with(|| (String::new(), 0, 0));
        entry.1 = completed;
        entry.2 = total;
        let task_name = entry.0.clone();
        state.events.push(ProgressEvent {
            source: source.clone(),
            task_name,
            completed_units: completed,
            total_units: total,
        });
        for presenter in &self.inner.presenters {
            presenter.progress(source, completed, total);
        }
    }

    fn log(&self, source: &NodeId, channel: &str, text: &str) {
        // Held so log lines interleave with the other events in report order.
        let _state = self.lock();
        for presenter in &self.inner.presenters {
            presenter.log(source, channel, text);
        }
    }
}

/// Reports progress for one source. Every call is fire-and-forget.
/// 为单个来源报告进度。每次调用都是即发即弃的。
#[derive(Clone)]
pub struct ProgressHandle {
    reporter: ProgressReporter,
    source: NodeId,
}

impl ProgressHandle {
    pub fn source(&self) -> &NodeId {
        &self.source
    }

    pub fn report_task_changed(&self, name: impl Into<String>) {
        self.reporter.task_changed(&self.source, name.into());
    }

    pub fn report_progress(&self, completed: u64, total: u64) {
        self.reporter.progress(&self.source, completed, total);
    }

    pub fn report_log(&self, channel: &str, text: &str) {
        self.reporter.log(&self.source, channel, text);
    }

    /// A handle for another source on the same reporter.
    pub fn for_source(&self, source: NodeId) -> ProgressHandle {
        self.reporter.handle(source)
    }

    /// Forwards an event received from an isolated host.
    pub fn apply(&self, event: HostEvent) {
        match event {
            HostEvent::TaskChanged { name } => self.report_task_changed(name),
            HostEvent::Progress { completed, total } => self.report_progress(completed, total),
            HostEvent::Log { channel, text } => self.report_log(&channel, &text),
        }
    }
}
