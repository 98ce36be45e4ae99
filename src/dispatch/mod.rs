//! Dispatcher and worker pool
//!
//! Owns the worker slots, assigns test groups to compatible workers,
//! interprets worker events and drives retries, serial-suite skipping and
//! the max-failure cutoff.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TestError;
use crate::grouping::TestGroup;
use crate::ipc::{DonePayload, RunEntry, RunPayload, WorkerInitParams, WorkerMessage, WorkerOptions};
use crate::reporter::Reporter;
use crate::suite::{
    has_skip_annotation, static_annotations, RunStatus, RunSummary, Suite, TestId, TestResult,
    TestStatus,
};
use crate::worker::{StopSignal, WorkerHost};

/// Knobs for one run
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub workers: usize,
    /// Unexpected outcomes tolerated before the run stops; 0 = unlimited.
    pub max_failures: usize,
    pub repeat_each_index: usize,
    pub project_index: usize,
    pub default_timeout: Duration,
}

impl RunConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            max_failures: 0,
            repeat_each_index: 0,
            project_index: 0,
            default_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_failures(mut self, max_failures: usize) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Monotonic count of unexpected outcomes
pub struct FailureTracker {
    max_failures: usize,
    failures: AtomicUsize,
}

impl FailureTracker {
    pub fn new(max_failures: usize) -> Self {
        Self {
            max_failures,
            failures: AtomicUsize::new(0),
        }
    }

    /// Skipped and expected outcomes never count.
    pub fn record(&self, result: &TestResult) {
        if !result.is_expected() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn record_worker_error(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn reached_max(&self) -> bool {
        self.max_failures > 0 && self.count() >= self.max_failures
    }
}

/// Per-test attempt history, appended as workers report
#[derive(Default)]
pub struct ResultTable {
    results: Mutex<HashMap<TestId, Vec<TestResult>>>,
}

impl ResultTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TestId, Vec<TestResult>>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, result: TestResult) {
        self.lock()
            .entry(result.test_id.clone())
            .or_default()
            .push(result);
    }

    pub fn attempts(&self, test_id: &str) -> usize {
        self.lock().get(test_id).map(Vec::len).unwrap_or(0)
    }

    /// Mutate the newest attempt and return a copy of it.
    pub fn update_last(
        &self,
        test_id: &str,
        update: impl FnOnce(&mut TestResult),
    ) -> Option<TestResult> {
        let mut map = self.lock();
        let result = map.get_mut(test_id)?.last_mut()?;
        update(result);
        Some(result.clone())
    }

    pub fn snapshot(&self) -> HashMap<TestId, Vec<TestResult>> {
        self.lock().clone()
    }
}

/// Lets the caller interrupt a run from outside
#[derive(Clone)]
pub struct StopHandle(Arc<StopSignal>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.request();
    }
}

/// One dispatch of a group to a worker
#[derive(Clone, Debug)]
struct Job {
    group: TestGroup,
    entries: Vec<RunEntry>,
}

impl Job {
    fn fresh(group: TestGroup) -> Self {
        let entries = group
            .tests
            .iter()
            .map(|test_id| RunEntry {
                test_id: test_id.clone(),
                retry: 0,
            })
            .collect();
        Self { group, entries }
    }
}

struct Slot {
    busy: bool,
    worker: Option<WorkerHost>,
}

enum LoopEvent {
    JobDone {
        slot: usize,
        worker: Option<WorkerHost>,
        new_job: Option<Job>,
    },
}

#[derive(Clone)]
struct Shared {
    suite: Arc<Suite>,
    reporter: Arc<dyn Reporter>,
    results: Arc<ResultTable>,
    failures: Arc<FailureTracker>,
    /// Stop signals of live workers, for global draining.
    stop_signals: Arc<Mutex<HashMap<usize, Arc<StopSignal>>>>,
    run_stop: Arc<StopSignal>,
    worker_ids: Arc<AtomicUsize>,
    config: RunConfig,
}

impl Shared {
    fn drain_workers(&self) {
        let signals = self
            .stop_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for signal in signals.values() {
            signal.request();
        }
    }

    fn register(&self, worker: &WorkerHost) {
        self.stop_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker.worker_index, worker.stop_signal());
    }

    fn unregister(&self, worker_index: usize) {
        self.stop_signals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&worker_index);
    }
}

/// Runs test groups over a pool of worker slots
pub struct Dispatcher {
    suite: Arc<Suite>,
    config: RunConfig,
    reporter: Arc<dyn Reporter>,
    run_stop: Arc<StopSignal>,
}

impl Dispatcher {
    pub fn new(suite: Arc<Suite>, config: RunConfig, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            suite,
            config,
            reporter,
            run_stop: Arc::new(StopSignal::new()),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.run_stop.clone())
    }

    /// Drive all groups to completion and collect the verdict.
    pub async fn run(&self, groups: Vec<TestGroup>) -> RunSummary {
        let shared = Shared {
            suite: self.suite.clone(),
            reporter: self.reporter.clone(),
            results: Arc::new(ResultTable::default()),
            failures: Arc::new(FailureTracker::new(self.config.max_failures)),
            stop_signals: Arc::new(Mutex::new(HashMap::new())),
            run_stop: self.run_stop.clone(),
            worker_ids: Arc::new(AtomicUsize::new(0)),
            config: self.config.clone(),
        };
        let total: usize = groups.iter().map(TestGroup::len).sum();
        self.reporter.on_begin(total);
        info!(total, groups = groups.len(), workers = self.config.workers, "dispatching");

        let mut queue: VecDeque<Job> = groups.into_iter().map(Job::fresh).collect();
        let mut slots: Vec<Slot> = (0..self.config.workers)
            .map(|_| Slot {
                busy: false,
                worker: None,
            })
            .collect();
        let (tx, mut rx) = mpsc::channel::<LoopEvent>(slots.len().max(1));
        let mut pending_shutdowns: Vec<JoinHandle<()>> = Vec::new();
        let mut stopped = false;
        let mut interrupted = false;

        loop {
            if shared.run_stop.is_requested() && !stopped {
                stopped = true;
                interrupted = true;
                queue.clear();
                shared.drain_workers();
            }
            if shared.failures.reached_max() && !stopped {
                debug!("max failures reached, draining");
                stopped = true;
                queue.clear();
                shared.drain_workers();
            }
            if !stopped {
                Self::schedule(&mut queue, &mut slots, &shared, &tx);
            }
            let all_idle = slots.iter().all(|slot| !slot.busy);
            if all_idle && (queue.is_empty() || stopped) {
                break;
            }

            tokio::select! {
                event = rx.recv() => {
                    let Some(LoopEvent::JobDone { slot, worker, new_job }) = event else {
                        break;
                    };
                    slots[slot].busy = false;
                    slots[slot].worker = worker;
                    if let Some(job) = new_job {
                        if !stopped {
                            queue.push_front(job);
                        }
                    }
                    if let Some(released) =
                        Self::release_if_redundant(&mut slots[slot], &queue, &shared)
                    {
                        pending_shutdowns.push(released);
                    }
                }
                _ = shared.run_stop.requested(), if !stopped => {}
            }
        }

        for slot in slots {
            if let Some(worker) = slot.worker {
                shared.unregister(worker.worker_index);
                worker.shutdown().await;
            }
        }
        // Released workers may still be tearing down fixtures; the run is
        // not over until they are.
        for released in pending_shutdowns {
            if released.await.is_err() {
                warn!("released worker teardown task panicked");
            }
        }

        let status = if interrupted {
            RunStatus::Interrupted
        } else if shared.failures.count() > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
        self.reporter.on_end(status);
        RunSummary {
            status,
            results: shared.results.snapshot(),
        }
    }

    /// Pop the queue head whenever a slot is available, preferring a free
    /// slot whose bound worker already matches the job's hash.
    fn schedule(
        queue: &mut VecDeque<Job>,
        slots: &mut [Slot],
        shared: &Shared,
        tx: &mpsc::Sender<LoopEvent>,
    ) {
        while let Some(head) = queue.front() {
            let hash = head.group.worker_hash.clone();
            let matching = slots.iter().position(|slot| {
                !slot.busy
                    && slot
                        .worker
                        .as_ref()
                        .map(|w| w.hash == hash && !w.did_send_stop())
                        .unwrap_or(false)
            });
            let Some(index) = matching.or_else(|| slots.iter().position(|slot| !slot.busy))
            else {
                break;
            };
            let Some(job) = queue.pop_front() else { break };
            let slot = &mut slots[index];
            slot.busy = true;
            let existing = slot.worker.take();
            let shared = shared.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let event = run_job_task(shared, index, existing, job).await;
                let _ = tx.send(event).await;
            });
        }
    }

    /// A freed worker whose hash no longer appears in the queue is stopped
    /// eagerly so its slot can host a compatible one. The returned handle
    /// completes once the worker's teardown has finished.
    fn release_if_redundant(
        slot: &mut Slot,
        queue: &VecDeque<Job>,
        shared: &Shared,
    ) -> Option<JoinHandle<()>> {
        let redundant = slot
            .worker
            .as_ref()
            .map(|w| !queue.is_empty() && !queue.iter().any(|j| j.group.worker_hash == w.hash))
            .unwrap_or(false);
        if !redundant {
            return None;
        }
        let worker = slot.worker.take()?;
        debug!(worker = worker.worker_index, "releasing redundant worker");
        shared.unregister(worker.worker_index);
        Some(tokio::spawn(worker.shutdown()))
    }
}

/// Run one job on a (possibly reused) worker and classify the outcome.
async fn run_job_task(
    shared: Shared,
    slot: usize,
    existing: Option<WorkerHost>,
    job: Job,
) -> LoopEvent {
    if shared.run_stop.is_requested() {
        if let Some(worker) = existing {
            shared.unregister(worker.worker_index);
            worker.shutdown().await;
        }
        return LoopEvent::JobDone {
            slot,
            worker: None,
            new_job: None,
        };
    }

    // A job whose every test is statically skipped never needs a worker.
    if job_is_statically_skipped(&shared.suite, &job) {
        let run = JobRun::new(&shared, &job);
        for entry in &job.entries {
            run.report_skipped(entry);
        }
        return LoopEvent::JobDone {
            slot,
            worker: existing,
            new_job: None,
        };
    }

    let worker = match existing {
        Some(worker) if worker.hash == job.group.worker_hash && !worker.did_send_stop() => {
            Some(worker)
        }
        Some(worker) => {
            shared.unregister(worker.worker_index);
            worker.shutdown().await;
            None
        }
        None => None,
    };
    let mut worker = match worker {
        Some(worker) => worker,
        None => match spawn_worker(&shared, slot, &job).await {
            Ok(worker) => worker,
            Err(error) => {
                warn!(%error, "failed to start worker");
                let mut run = JobRun::new(&shared, &job);
                run.handle_done(DonePayload {
                    fatal_errors: vec![TestError::new(format!("failed to start worker: {error:#}"))],
                    skip_tests_due_to_setup_failure: Vec::new(),
                });
                let new_job = run.next_job();
                return LoopEvent::JobDone {
                    slot,
                    worker: None,
                    new_job,
                };
            }
        },
    };

    let mut run = JobRun::new(&shared, &job);
    if let Err(error) = worker.run_job(RunPayload {
        require_file: job.group.require_file.clone(),
        entries: job.entries.clone(),
    })
    .await
    {
        warn!(%error, "worker rejected job");
        run.handle_done(synthetic_exit());
        shared.unregister(worker.worker_index);
        worker.shutdown().await;
        let new_job = run.next_job();
        return LoopEvent::JobDone {
            slot,
            worker: None,
            new_job,
        };
    }

    let clean = run.drive(&mut worker).await;
    let new_job = run.next_job();
    if clean {
        LoopEvent::JobDone {
            slot,
            worker: Some(worker),
            new_job,
        }
    } else {
        // Any failure recycles the process so the next job starts clean.
        shared.unregister(worker.worker_index);
        worker.shutdown().await;
        LoopEvent::JobDone {
            slot,
            worker: None,
            new_job,
        }
    }
}

async fn spawn_worker(shared: &Shared, slot: usize, job: &Job) -> anyhow::Result<WorkerHost> {
    let params = WorkerInitParams {
        worker_index: shared.worker_ids.fetch_add(1, Ordering::SeqCst),
        parallel_index: slot,
        repeat_each_index: job.group.repeat_each_index,
        project_index: job.group.project_index,
        options: WorkerOptions {
            default_timeout_ms: shared.config.default_timeout.as_millis() as u64,
        },
    };
    let worker = WorkerHost::start(
        params,
        shared.suite.clone(),
        job.group.worker_hash.clone(),
    )
    .await?;
    shared.register(&worker);
    Ok(worker)
}

fn synthetic_exit() -> DonePayload {
    DonePayload {
        fatal_errors: vec![TestError::new("worker process exited unexpectedly")],
        skip_tests_due_to_setup_failure: Vec::new(),
    }
}

fn job_is_statically_skipped(suite: &Suite, job: &Job) -> bool {
    let chains = suite.tests_with_chain();
    job.entries.iter().all(|entry| {
        chains
            .iter()
            .find(|(_, test)| test.id == entry.test_id)
            .map(|(chain, test)| has_skip_annotation(&static_annotations(chain, test)))
            .unwrap_or(false)
    })
}

/// Event-loop state for one job
struct JobRun<'a> {
    shared: &'a Shared,
    job: &'a Job,
    remaining: Vec<RunEntry>,
    failed: HashSet<TestId>,
    currently_running: Option<TestId>,
    step_stacks: HashMap<TestId, Vec<String>>,
    fatal: bool,
}

impl<'a> JobRun<'a> {
    fn new(shared: &'a Shared, job: &'a Job) -> Self {
        Self {
            shared,
            job,
            remaining: job.entries.clone(),
            failed: HashSet::new(),
            currently_running: None,
            step_stacks: HashMap::new(),
            fatal: false,
        }
    }

    /// Pump worker events until the job's `done`. Returns whether the
    /// worker may be reused.
    async fn drive(&mut self, worker: &mut WorkerHost) -> bool {
        loop {
            let Some(message) = worker.recv().await else {
                warn!(worker = worker.worker_index, "worker channel closed mid-job");
                self.handle_done(synthetic_exit());
                return false;
            };
            match message {
                WorkerMessage::TestBegin(begin) => {
                    let result =
                        TestResult::started(begin.test_id.clone(), begin.retry, worker.worker_index);
                    if !self.shared.failures.reached_max() {
                        self.shared.reporter.on_test_begin(&result);
                    }
                    self.shared.results.append(result);
                    self.currently_running = Some(begin.test_id);
                }
                WorkerMessage::TestEnd(end) => {
                    self.remaining.retain(|entry| entry.test_id != end.test_id);
                    self.currently_running = None;
                    self.step_stacks.remove(&end.test_id);
                    let was_reached = self.shared.failures.reached_max();
                    let updated = self.shared.results.update_last(&end.test_id, |result| {
                        result.status = end.status;
                        result.expected_status = end.expected_status;
                        result.duration_ms = end.duration_ms;
                        result.errors = end.errors.clone();
                        result.steps = end.steps.clone();
                    });
                    if let Some(result) = updated {
                        self.shared.failures.record(&result);
                        if !result.is_expected() {
                            self.failed.insert(result.test_id.clone());
                        }
                        if !was_reached {
                            self.shared.reporter.on_test_end(&result);
                        }
                        if self.shared.failures.reached_max() && !was_reached {
                            self.shared.drain_workers();
                        }
                    }
                }
                WorkerMessage::StepBegin(mut step) => {
                    let stack = self.step_stacks.entry(step.test_id.clone()).or_default();
                    if !step.force_no_parent && step.parent_step_id.is_none() {
                        step.parent_step_id = stack.last().cloned();
                    }
                    stack.push(step.step_id.clone());
                    self.shared.reporter.on_step_begin(&step);
                }
                WorkerMessage::StepEnd(step) => {
                    if let Some(stack) = self.step_stacks.get_mut(&step.test_id) {
                        stack.retain(|id| *id != step.step_id);
                    }
                    self.shared.reporter.on_step_end(&step);
                }
                WorkerMessage::StdOut(output) => {
                    self.attribute_output(&output.text, false);
                }
                WorkerMessage::StdErr(output) => {
                    self.attribute_output(&output.text, true);
                }
                WorkerMessage::Done(done) => {
                    let had_failures = !done.fatal_errors.is_empty();
                    self.handle_done(done);
                    return !self.fatal
                        && !had_failures
                        && self.failed.is_empty()
                        && self.remaining.is_empty()
                        && !worker.did_send_stop();
                }
                WorkerMessage::Ready | WorkerMessage::Exit => {}
            }
        }
    }

    fn attribute_output(&self, text: &str, is_err: bool) {
        let test_id = self.currently_running.clone();
        if let Some(test_id) = &test_id {
            self.shared.results.update_last(test_id, |result| {
                if is_err {
                    result.stderr.push(text.to_string());
                } else {
                    result.stdout.push(text.to_string());
                }
            });
        }
        if is_err {
            self.shared.reporter.on_std_err(test_id.as_deref(), text);
        } else {
            self.shared.reporter.on_std_out(test_id.as_deref(), text);
        }
    }

    fn report_skipped(&self, entry: &RunEntry) {
        let result = TestResult::unstarted(entry.test_id.clone(), entry.retry, TestStatus::Skipped);
        if !self.shared.failures.reached_max() {
            self.shared.reporter.on_test_begin(&result);
            self.shared.reporter.on_test_end(&result);
        }
        self.shared.results.append(result);
    }

    /// End-of-job bookkeeping: fatal attribution, setup-failure skips and
    /// serial-suite propagation.
    fn handle_done(&mut self, done: DonePayload) {
        if !done.fatal_errors.is_empty() {
            self.fatal = true;
            let mut unfinished = std::mem::take(&mut self.remaining).into_iter();
            match unfinished.next() {
                Some(first) if !self.expects_failure(&first.test_id) => {
                    self.fail_unfinished(&first, done.fatal_errors.clone());
                }
                // A test declared as expected-to-fail must not absorb a
                // worker error (a "failed" result would read as expected
                // and burn its retry budget); escalate to the run instead.
                Some(first) => {
                    for error in &done.fatal_errors {
                        self.shared.reporter.on_error(error);
                    }
                    self.shared.failures.record_worker_error();
                    self.report_skipped(&first);
                }
                None => {
                    for error in &done.fatal_errors {
                        self.shared.reporter.on_error(error);
                    }
                    self.shared.failures.record_worker_error();
                }
            }
            for entry in unfinished {
                self.report_skipped(&entry);
            }
            return;
        }

        for test_id in &done.skip_tests_due_to_setup_failure {
            if let Some(position) = self.remaining.iter().position(|e| &e.test_id == test_id) {
                let entry = self.remaining.remove(position);
                self.report_skipped(&entry);
            }
        }

        // A failure inside a serial suite skips the suite's queued tests;
        // they rejoin as retry candidates.
        let serial = self.shared.suite.tests_in_failed_serial_suites(&self.failed);
        let skipped: Vec<RunEntry> = self
            .remaining
            .iter()
            .filter(|entry| serial.contains(&entry.test_id))
            .cloned()
            .collect();
        self.remaining.retain(|entry| !serial.contains(&entry.test_id));
        for entry in &skipped {
            self.report_skipped(entry);
        }
    }

    fn expects_failure(&self, test_id: &str) -> bool {
        self.shared
            .suite
            .find_test(test_id)
            .map(|test| test.expected_status == TestStatus::Failed)
            .unwrap_or(false)
    }

    /// Attribute a worker-level failure to the first unfinished test.
    fn fail_unfinished(&mut self, entry: &RunEntry, errors: Vec<TestError>) {
        let was_reached = self.shared.failures.reached_max();
        let began = self.currently_running.as_deref() == Some(entry.test_id.as_str());
        let result = if began {
            self.shared.results.update_last(&entry.test_id, |result| {
                result.status = TestStatus::Failed;
                result.errors = errors.clone();
            })
        } else {
            let mut result =
                TestResult::unstarted(entry.test_id.clone(), entry.retry, TestStatus::Failed);
            result.errors = errors;
            self.shared.results.append(result.clone());
            Some(result)
        };
        if let Some(result) = result {
            self.shared.failures.record(&result);
            self.failed.insert(result.test_id.clone());
            if !was_reached {
                self.shared.reporter.on_test_end(&result);
            }
        }
        self.currently_running = None;
    }

    /// Retry candidates within budget plus unfinished entries, requeued at
    /// the front of the queue.
    fn next_job(self) -> Option<Job> {
        let serial = self.shared.suite.tests_in_failed_serial_suites(&self.failed);
        let mut entries: Vec<RunEntry> = Vec::new();
        for test_id in &self.job.group.tests {
            if !self.failed.contains(test_id) && !serial.contains(test_id) {
                continue;
            }
            let retries = self
                .shared
                .suite
                .find_test(test_id)
                .map(|test| test.retries)
                .unwrap_or(0);
            let attempts = self.shared.results.attempts(test_id) as u32;
            if attempts < retries + 1 {
                entries.push(RunEntry {
                    test_id: test_id.clone(),
                    retry: attempts,
                });
            }
        }
        for entry in &self.remaining {
            if !entries.iter().any(|e| e.test_id == entry.test_id) {
                entries.push(entry.clone());
            }
        }
        if entries.is_empty() {
            return None;
        }
        let mut group = self.job.group.clone();
        group.tests = entries.iter().map(|e| e.test_id.clone()).collect();
        Some(Job { group, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;
    use crate::fixtures::{
        FixtureDecl, FixtureOptions, FixturePool, FixtureScope, RegistrationIds,
    };
    use crate::grouping::{create_test_groups, worker_hash};
    use crate::reporter::{CollectingReporter, ReporterEvent};
    use crate::suite::{Modifier, ModifierKind, TestCase};
    use std::sync::atomic::AtomicBool;

    fn loc(line: u32) -> Location {
        Location::new("spec.rs", line, 1)
    }

    fn empty_pool() -> Arc<FixturePool> {
        let mut ids = RegistrationIds::new();
        Arc::new(FixturePool::build(&[], &mut ids, None, false).unwrap())
    }

    fn passing(id: &str, file: &str, pool: &Arc<FixturePool>) -> TestCase {
        TestCase::new(id, id, loc(1), pool.clone(), file, &[], |_p| async { Ok(()) })
    }

    fn failing(id: &str, file: &str, pool: &Arc<FixturePool>) -> TestCase {
        TestCase::new(id, id, loc(2), pool.clone(), file, &[], |_p| async {
            Err(anyhow::anyhow!("boom"))
        })
    }

    async fn run_with(
        suite: Suite,
        config: RunConfig,
    ) -> (RunSummary, Arc<CollectingReporter>) {
        let suite = Arc::new(suite);
        let reporter = Arc::new(CollectingReporter::new());
        let groups = create_test_groups(
            &suite,
            config.workers,
            config.repeat_each_index,
            config.project_index,
        );
        let dispatcher = Dispatcher::new(suite, config, reporter.clone());
        let summary = dispatcher.run(groups).await;
        (summary, reporter)
    }

    #[tokio::test]
    async fn all_passing_run_resolves_passed() {
        let pool = empty_pool();
        let suite = Suite::new("")
            .add_test(passing("a", "a.rs", &pool))
            .add_test(passing("b", "a.rs", &pool));
        let (summary, _) = run_with(suite, RunConfig::new(2)).await;
        assert_eq!(summary.status, RunStatus::Passed);
        assert_eq!(summary.attempts("a").len(), 1);
        assert_eq!(summary.last_status("b"), Some(TestStatus::Passed));
    }

    #[tokio::test]
    async fn retry_budget_yields_exactly_retries_plus_one_attempts() {
        let pool = empty_pool();
        let suite =
            Suite::new("").add_test(failing("flaky", "a.rs", &pool).with_retries(2));
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        assert_eq!(summary.status, RunStatus::Failed);
        let attempts = summary.attempts("flaky");
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|r| r.status == TestStatus::Failed));
        assert_eq!(attempts.last().map(|r| r.retry), Some(2));
    }

    #[tokio::test]
    async fn serial_suite_skips_followers_after_a_failure() {
        let pool = empty_pool();
        let suite = Suite::new("").add_suite(
            Suite::new("serial")
                .serial()
                .at(loc(5))
                .add_test(failing("first", "a.rs", &pool))
                .add_test(passing("second", "a.rs", &pool)),
        );
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        assert_eq!(summary.last_status("first"), Some(TestStatus::Failed));
        assert_eq!(summary.last_status("second"), Some(TestStatus::Skipped));
    }

    #[tokio::test]
    async fn serial_suite_restarts_whole_suite_on_retry() {
        let pool = empty_pool();
        let suite = Suite::new("").add_suite(
            Suite::new("serial")
                .serial()
                .at(loc(5))
                .add_test(failing("first", "a.rs", &pool).with_retries(1))
                .add_test(passing("second", "a.rs", &pool).with_retries(1)),
        );
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        // Both tests got a second attempt after the serial failure.
        assert_eq!(summary.attempts("first").len(), 2);
        assert_eq!(summary.attempts("second").len(), 2);
        assert_eq!(summary.last_status("second"), Some(TestStatus::Skipped));
    }

    #[tokio::test]
    async fn ten_parallel_tests_on_three_workers_report_once_each() {
        let pool = empty_pool();
        let mut par = Suite::new("par").parallel();
        for index in 0..10 {
            par = par.add_test(passing(&format!("t{index}"), "a.rs", &pool));
        }
        let (summary, reporter) = run_with(Suite::new("").add_suite(par), RunConfig::new(3)).await;
        assert_eq!(summary.status, RunStatus::Passed);

        let mut in_flight = 0usize;
        let mut max_in_flight = 0usize;
        let mut ends = 0usize;
        for event in reporter.events() {
            match event {
                ReporterEvent::TestBegin { .. } => {
                    in_flight += 1;
                    max_in_flight = max_in_flight.max(in_flight);
                }
                ReporterEvent::TestEnd { .. } => {
                    in_flight -= 1;
                    ends += 1;
                }
                _ => {}
            }
        }
        assert_eq!(ends, 10);
        assert!(max_in_flight <= 3, "{max_in_flight} jobs in flight");
        for index in 0..10 {
            assert_eq!(summary.attempts(&format!("t{index}")).len(), 1);
        }
    }

    #[tokio::test]
    async fn max_failures_stops_reporting_and_scheduling() {
        let pool = empty_pool();
        let mut suite = Suite::new("");
        for index in 0..5 {
            // One file per test keeps the jobs independent.
            suite = suite.add_test(failing(&format!("t{index}"), &format!("f{index}.rs"), &pool));
        }
        let (summary, reporter) =
            run_with(suite, RunConfig::new(1).with_max_failures(2)).await;
        assert_eq!(summary.status, RunStatus::Failed);
        let begins = reporter
            .events()
            .iter()
            .filter(|e| matches!(e, ReporterEvent::TestBegin { .. }))
            .count();
        assert_eq!(begins, 2);
    }

    #[tokio::test]
    async fn before_all_failure_fails_trigger_and_skips_suite_siblings() {
        let pool = empty_pool();
        let broken = crate::suite::Hook::new(
            crate::suite::HookKind::BeforeAll,
            &[],
            loc(7),
            |_p| async { Err(anyhow::anyhow!("db down")) },
        );
        let suite = Suite::new("").add_suite(
            Suite::new("s")
                .at(loc(6))
                .add_hook(broken)
                .add_test(passing("a", "a.rs", &pool))
                .add_test(passing("b", "a.rs", &pool)),
        );
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.last_status("a"), Some(TestStatus::Failed));
        assert_eq!(summary.last_status("b"), Some(TestStatus::Skipped));
        let errors = &summary.attempts("a")[0].errors;
        assert!(errors.iter().any(|e| e.message.contains("db down")));
    }

    #[tokio::test]
    async fn fully_skipped_job_never_needs_a_worker() {
        let pool = empty_pool();
        let suite = Suite::new("").add_suite(
            Suite::new("s")
                .at(loc(8))
                .add_modifier(Modifier::unconditional(ModifierKind::Skip, loc(9)))
                .add_test(passing("a", "a.rs", &pool))
                .add_test(passing("b", "a.rs", &pool)),
        );
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        assert_eq!(summary.status, RunStatus::Passed);
        assert_eq!(summary.last_status("a"), Some(TestStatus::Skipped));
        assert_eq!(summary.last_status("b"), Some(TestStatus::Skipped));
        // Skipped without a worker attached.
        assert_eq!(summary.attempts("a")[0].worker_index, None);
    }

    #[tokio::test]
    async fn workers_are_reused_for_matching_hashes() {
        let pool = empty_pool();
        let suite = Suite::new("")
            .add_test(passing("a", "a.rs", &pool))
            .add_test(passing("b", "b.rs", &pool));
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        // Same digest, same file-agnostic hash: one worker serves both.
        assert_eq!(
            summary.attempts("a")[0].worker_index,
            summary.attempts("b")[0].worker_index
        );
    }

    #[tokio::test]
    async fn stop_mid_run_interrupts_the_in_flight_test() {
        let pool = empty_pool();
        let (started_tx, mut started_rx) = mpsc::channel::<()>(1);
        let hanging = TestCase::new(
            "hang",
            "hang",
            loc(3),
            pool.clone(),
            "a.rs",
            &[],
            move |_p| {
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(()).await;
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            },
        );
        let suite = Arc::new(Suite::new("").add_test(hanging));
        let reporter = Arc::new(CollectingReporter::new());
        let groups = create_test_groups(&suite, 1, 0, 0);
        let dispatcher = Dispatcher::new(suite, RunConfig::new(1), reporter.clone());
        let handle = dispatcher.stop_handle();
        let run = tokio::spawn(async move { dispatcher.run(groups).await });

        started_rx.recv().await.expect("test never started");
        handle.stop();
        // Stopping again must be a no-op.
        handle.stop();

        let summary = run.await.expect("run task");
        assert_eq!(summary.status, RunStatus::Interrupted);
        assert_eq!(summary.last_status("hang"), Some(TestStatus::Interrupted));
        assert_eq!(summary.attempts("hang").len(), 1);
    }

    #[tokio::test]
    async fn worker_error_on_expected_failure_escalates_instead_of_attributing() {
        let pool = empty_pool();
        let suite = Arc::new(Suite::new("").add_test(
            passing("wants-failure", "a.rs", &pool).with_expected_status(TestStatus::Failed),
        ));
        // An entry the worker cannot resolve forces a worker-level error
        // before any test runs.
        let group = TestGroup {
            worker_hash: worker_hash(0, 0, &pool.digest),
            require_file: "a.rs".to_string(),
            repeat_each_index: 0,
            project_index: 0,
            tests: vec!["wants-failure".to_string(), "ghost".to_string()],
        };
        let reporter = Arc::new(CollectingReporter::new());
        let dispatcher = Dispatcher::new(suite, RunConfig::new(1), reporter.clone());
        let summary = dispatcher.run(vec![group]).await;

        assert_eq!(summary.status, RunStatus::Failed);
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, ReporterEvent::Error { .. })));
        // The expected-failure test is skipped, not marked failed, and
        // burns no retry budget on the worker error.
        assert_eq!(
            summary.last_status("wants-failure"),
            Some(TestStatus::Skipped)
        );
        assert_eq!(summary.attempts("wants-failure").len(), 1);
    }

    #[tokio::test]
    async fn released_worker_finishes_teardown_before_run_returns() {
        let torn_down = Arc::new(AtomicBool::new(false));
        let decl = {
            let torn_down = torn_down.clone();
            FixtureDecl::factory("flag", &[], loc(1), move |_p, mut h| {
                let torn_down = torn_down.clone();
                async move {
                    h.provide(()).await?;
                    torn_down.store(true, Ordering::SeqCst);
                    Ok(())
                }
            })
            .with_options(FixtureOptions::new().scope(FixtureScope::Worker))
        };
        let mut ids = RegistrationIds::new();
        let pool_a = Arc::new(FixturePool::build(&[vec![decl]], &mut ids, None, false).unwrap());
        let pool_b = empty_pool();
        // Different digests: the first worker is redundant once its only
        // job is done and gets released while the second job runs.
        let suite = Suite::new("")
            .add_test(TestCase::new(
                "a",
                "a",
                loc(1),
                pool_a.clone(),
                "a.rs",
                &["flag"],
                |_p| async { Ok(()) },
            ))
            .add_test(passing("b", "b.rs", &pool_b));
        let (summary, _) = run_with(suite, RunConfig::new(1)).await;
        assert_eq!(summary.status, RunStatus::Passed);
        assert!(torn_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn output_is_attributed_to_the_running_test() {
        let pool = empty_pool();
        let suite = Arc::new(Suite::new("").add_test(passing("t", "a.rs", &pool)));
        let reporter = Arc::new(CollectingReporter::new());
        let shared = Shared {
            suite,
            reporter: reporter.clone(),
            results: Arc::new(ResultTable::default()),
            failures: Arc::new(FailureTracker::new(0)),
            stop_signals: Arc::new(Mutex::new(HashMap::new())),
            run_stop: Arc::new(StopSignal::new()),
            worker_ids: Arc::new(AtomicUsize::new(0)),
            config: RunConfig::new(1),
        };
        let group = TestGroup {
            worker_hash: "h".to_string(),
            require_file: "a.rs".to_string(),
            repeat_each_index: 0,
            project_index: 0,
            tests: vec!["t".to_string()],
        };
        let job = Job::fresh(group);
        let mut run = JobRun::new(&shared, &job);

        shared.results.append(TestResult::started("t", 0, 0));
        run.currently_running = Some("t".to_string());
        run.attribute_output("hello", false);
        run.currently_running = None;
        run.attribute_output("stray", true);

        let results = shared.results.snapshot();
        assert_eq!(results["t"][0].stdout, vec!["hello".to_string()]);
        assert!(results["t"][0].stderr.is_empty());
        let events = reporter.events();
        assert!(events.iter().any(
            |e| matches!(e, ReporterEvent::StdOut { test_id: Some(id), .. } if id == "t")
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, ReporterEvent::StdErr { test_id: None, .. })));
    }

    #[tokio::test]
    async fn stop_handle_interrupts_before_anything_runs() {
        let pool = empty_pool();
        let suite = Arc::new(Suite::new("").add_test(passing("a", "a.rs", &pool)));
        let reporter = Arc::new(CollectingReporter::new());
        let groups = create_test_groups(&suite, 1, 0, 0);
        let dispatcher = Dispatcher::new(suite, RunConfig::new(1), reporter.clone());
        dispatcher.stop_handle().stop();
        let summary = dispatcher.run(groups).await;
        assert_eq!(summary.status, RunStatus::Interrupted);
        assert!(summary.attempts("a").is_empty());
    }
}
