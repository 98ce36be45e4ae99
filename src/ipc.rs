//! Controller/worker message protocol
//!
//! Every message is plain serializable data so the channel transport could
//! be swapped for a process boundary without touching either side.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};

use crate::error::TestError;
use crate::suite::{TestId, TestStatus, TestStep};

/// Per-worker options fixed at spawn time
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerOptions {
    pub default_timeout_ms: u64,
}

/// Identity of a worker, sent once before any job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerInitParams {
    /// Unique across the whole run, never reused after a worker dies.
    pub worker_index: usize,
    /// Dense slot index in `0..workers`, reused across worker generations.
    pub parallel_index: usize,
    pub repeat_each_index: usize,
    pub project_index: usize,
    pub options: WorkerOptions,
}

/// One test of a job, with the attempt number it runs as
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEntry {
    pub test_id: TestId,
    pub retry: u32,
}

/// A job: an ordered slice of tests from one file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunPayload {
    pub require_file: String,
    pub entries: Vec<RunEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestBeginPayload {
    pub test_id: TestId,
    pub retry: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestEndPayload {
    pub test_id: TestId,
    pub retry: u32,
    pub status: TestStatus,
    pub expected_status: TestStatus,
    pub duration_ms: u64,
    pub errors: Vec<TestError>,
    pub steps: Vec<TestStep>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepBeginPayload {
    pub test_id: TestId,
    pub step_id: String,
    pub title: String,
    pub category: String,
    /// Filled by the dispatcher from its per-test step stack.
    pub parent_step_id: Option<String>,
    /// Top-level phases (Before Hooks, After Hooks) never nest.
    pub force_no_parent: bool,
    pub location: Option<crate::error::Location>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepEndPayload {
    pub test_id: TestId,
    pub step_id: String,
    pub duration_ms: u64,
    pub error: Option<TestError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputPayload {
    pub text: String,
}

/// Worker's account of how a job ended
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DonePayload {
    /// Errors not attributable to a single test (beforeAll failures,
    /// broken worker fixtures). A non-empty list poisons the worker.
    pub fatal_errors: Vec<TestError>,
    /// Tests the worker decided to skip after an earlier failure in their
    /// suite.
    pub skip_tests_due_to_setup_failure: Vec<TestId>,
}

/// Controller to worker
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ControllerMessage {
    Init(WorkerInitParams),
    Run(RunPayload),
    Stop,
}

/// Worker to controller
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum WorkerMessage {
    Ready,
    TestBegin(TestBeginPayload),
    TestEnd(TestEndPayload),
    StepBegin(StepBeginPayload),
    StepEnd(StepEndPayload),
    StdOut(OutputPayload),
    StdErr(OutputPayload),
    Done(DonePayload),
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_through_json() {
        let message = ControllerMessage::Init(WorkerInitParams {
            worker_index: 3,
            parallel_index: 1,
            repeat_each_index: 0,
            project_index: 0,
            options: WorkerOptions {
                default_timeout_ms: 30_000,
            },
        });
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"method\":\"init\""));
        let back: ControllerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ControllerMessage::Init(params) => assert_eq!(params.worker_index, 3),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn done_payload_defaults_to_clean() {
        let done = DonePayload::default();
        assert!(done.fatal_errors.is_empty());
        assert!(done.skip_tests_due_to_setup_failure.is_empty());
    }
}
