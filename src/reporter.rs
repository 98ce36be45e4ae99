//! Run reporting
//!
//! The dispatcher forwards lifecycle events to a [`Reporter`]. The default
//! implementation logs through `tracing`; tests use the collecting one.

#![allow(dead_code)]

use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::TestError;
use crate::ipc::{StepBeginPayload, StepEndPayload};
use crate::suite::{RunStatus, TestResult, TestStatus};

/// Receives run lifecycle events in delivery order
///
/// All methods default to no-ops so implementations only override what
/// they render.
pub trait Reporter: Send + Sync {
    fn on_begin(&self, _total_tests: usize) {}
    fn on_test_begin(&self, _result: &TestResult) {}
    fn on_test_end(&self, _result: &TestResult) {}
    fn on_step_begin(&self, _step: &StepBeginPayload) {}
    fn on_step_end(&self, _step: &StepEndPayload) {}
    fn on_std_out(&self, _test_id: Option<&str>, _text: &str) {}
    fn on_std_err(&self, _test_id: Option<&str>, _text: &str) {}
    /// An error not attributable to a single test.
    fn on_error(&self, _error: &TestError) {}
    fn on_end(&self, _status: RunStatus) {}
}

/// Install the global tracing subscriber, filtered through `RUST_LOG`.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Reporter that logs through `tracing`
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn on_begin(&self, total_tests: usize) {
        info!(total_tests, "run started");
    }

    fn on_test_begin(&self, result: &TestResult) {
        info!(test = %result.test_id, retry = result.retry, "test started");
    }

    fn on_test_end(&self, result: &TestResult) {
        match result.status {
            TestStatus::Passed | TestStatus::Skipped => {
                info!(test = %result.test_id, status = %result.status, "test finished");
            }
            _ => {
                warn!(
                    test = %result.test_id,
                    status = %result.status,
                    retry = result.retry,
                    "test finished"
                );
            }
        }
    }

    fn on_error(&self, error: &TestError) {
        error!(%error, "run error");
    }

    fn on_end(&self, status: RunStatus) {
        info!(%status, "run finished");
    }
}

/// Everything a [`CollectingReporter`] saw, in order
#[derive(Clone, Debug)]
pub enum ReporterEvent {
    Begin { total_tests: usize },
    TestBegin { test_id: String, retry: u32 },
    TestEnd { test_id: String, retry: u32, status: TestStatus },
    StdOut { test_id: Option<String>, text: String },
    StdErr { test_id: Option<String>, text: String },
    Error { message: String },
    End { status: RunStatus },
}

/// Records events for assertions
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<ReporterEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ReporterEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, event: ReporterEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

impl Reporter for CollectingReporter {
    fn on_begin(&self, total_tests: usize) {
        self.push(ReporterEvent::Begin { total_tests });
    }

    fn on_test_begin(&self, result: &TestResult) {
        self.push(ReporterEvent::TestBegin {
            test_id: result.test_id.clone(),
            retry: result.retry,
        });
    }

    fn on_test_end(&self, result: &TestResult) {
        self.push(ReporterEvent::TestEnd {
            test_id: result.test_id.clone(),
            retry: result.retry,
            status: result.status,
        });
    }

    fn on_std_out(&self, test_id: Option<&str>, text: &str) {
        self.push(ReporterEvent::StdOut {
            test_id: test_id.map(str::to_string),
            text: text.to_string(),
        });
    }

    fn on_std_err(&self, test_id: Option<&str>, text: &str) {
        self.push(ReporterEvent::StdErr {
            test_id: test_id.map(str::to_string),
            text: text.to_string(),
        });
    }

    fn on_error(&self, error: &TestError) {
        self.push(ReporterEvent::Error {
            message: error.message.clone(),
        });
    }

    fn on_end(&self, status: RunStatus) {
        self.push(ReporterEvent::End { status });
    }
}
