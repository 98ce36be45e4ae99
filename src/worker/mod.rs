//! Worker-side test execution
//!
//! Runs one job (an ordered slice of tests from one file) inside a worker:
//! depth-first suite traversal, hook ordering, annotation handling and
//! fatal-error classification.

#![allow(dead_code)]

pub mod host;

use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Location, TestError};
use crate::fixtures::{FixtureContext, FixtureRunner, FixtureScope};
use crate::ipc::{
    DonePayload, RunPayload, StepBeginPayload, StepEndPayload, TestBeginPayload, TestEndPayload,
    WorkerInitParams, WorkerMessage,
};
use crate::suite::{
    has_skip_annotation, static_annotations, Annotation, Hook, HookKind, Modifier, ModifierKind,
    Suite, TestCase, TestFn, TestStatus, TestStep,
};
use crate::timeout::{
    shared_slot, RunnableDescription, RunnableKind, SharedSlot, TimeoutManager,
};

pub use host::{StopSignal, WorkerHost};

/// Why a stage did not run to completion
enum Halt {
    Skipped,
    Failure(TestError),
    Timeout(TestError),
    Interrupted,
}

/// A suite whose beforeAll hooks have run and whose afterAll hooks are
/// still owed
struct ActiveSuite<'a> {
    suite: &'a Suite,
    /// Annotations inherited by every test under this suite, own
    /// unconditional and already-evaluated modifiers included.
    annotations: Vec<Annotation>,
    /// Conditional modifiers needing test-scope fixtures, evaluated per
    /// test.
    deferred: Vec<Modifier>,
}

struct TestRun<'a> {
    status: TestStatus,
    expected_status: TestStatus,
    errors: Vec<TestError>,
    steps: Vec<TestStep>,
    /// Set when a beforeAll hook failed; the suite's remaining tests in
    /// this job must be skipped rather than retried here.
    failed_before_all: Option<&'a Suite>,
}

/// Executes jobs inside one worker
///
/// Worker-scope fixtures persist across jobs; any unexpected failure
/// stops the current job so the dispatcher can recycle the process.
pub struct WorkerMain {
    params: WorkerInitParams,
    suite: Arc<Suite>,
    events: mpsc::Sender<WorkerMessage>,
    stop: Arc<StopSignal>,
    fixtures: FixtureRunner,
    stopped: bool,
    step_counter: u64,
}

impl WorkerMain {
    pub fn new(
        params: WorkerInitParams,
        suite: Arc<Suite>,
        events: mpsc::Sender<WorkerMessage>,
        stop: Arc<StopSignal>,
    ) -> Self {
        Self {
            params,
            suite,
            events,
            stop,
            fixtures: FixtureRunner::new(),
            stopped: false,
            step_counter: 0,
        }
    }

    async fn emit(&self, message: WorkerMessage) {
        let _ = self.events.send(message).await;
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.params.options.default_timeout_ms)
    }

    /// Run one job to completion. Unfinished entries stay unreported; the
    /// dispatcher requeues them.
    pub async fn run_job(&mut self, payload: RunPayload) -> DonePayload {
        let suite = self.suite.clone();
        let mut done = DonePayload::default();

        let chains = suite.tests_with_chain();
        let by_id: HashMap<&str, usize> = chains
            .iter()
            .enumerate()
            .map(|(index, (_, test))| (test.id.as_str(), index))
            .collect();

        let mut selected: Vec<(usize, u32)> = Vec::new();
        for entry in &payload.entries {
            match by_id.get(entry.test_id.as_str()) {
                Some(index) => selected.push((*index, entry.retry)),
                None => {
                    warn!(test = %entry.test_id, "test not found in suite");
                    done.fatal_errors
                        .push(TestError::new(format!("test not found: {}", entry.test_id)));
                    return done;
                }
            }
        }

        let mut active: Vec<ActiveSuite<'_>> = Vec::new();
        for position in 0..selected.len() {
            if self.stop.is_requested() || self.stopped {
                break;
            }
            let (chain_index, retry) = selected[position];
            let (chain, test) = &chains[chain_index];

            // Statically skipped tests never enter their suites, so fully
            // skipped suites run no beforeAll hooks.
            let static_annotations = static_annotations(chain, test);
            if has_skip_annotation(&static_annotations) {
                self.emit(WorkerMessage::TestBegin(TestBeginPayload {
                    test_id: test.id.clone(),
                    retry,
                }))
                .await;
                self.emit(WorkerMessage::TestEnd(TestEndPayload {
                    test_id: test.id.clone(),
                    retry,
                    status: TestStatus::Skipped,
                    expected_status: test.expected_status,
                    duration_ms: 0,
                    errors: Vec::new(),
                    steps: Vec::new(),
                }))
                .await;
                continue;
            }

            let next_chain = selected
                .get(position + 1)
                .map(|(index, _)| &chains[*index].0);

            let started = Instant::now();
            self.emit(WorkerMessage::TestBegin(TestBeginPayload {
                test_id: test.id.clone(),
                retry,
            }))
            .await;
            let run = self
                .run_one_test(chain, test, static_annotations, next_chain, &mut active)
                .await;
            self.emit(WorkerMessage::TestEnd(TestEndPayload {
                test_id: test.id.clone(),
                retry,
                status: run.status,
                expected_status: run.expected_status,
                duration_ms: started.elapsed().as_millis() as u64,
                errors: run.errors,
                steps: run.steps,
            }))
            .await;

            if let Some(failed_suite) = run.failed_before_all {
                for (later_index, _) in &selected[position + 1..] {
                    let (later_chain, later_test) = &chains[*later_index];
                    let in_failed_suite = later_chain
                        .iter()
                        .any(|s| std::ptr::eq(*s, failed_suite));
                    if in_failed_suite {
                        done.skip_tests_due_to_setup_failure
                            .push(later_test.id.clone());
                    }
                }
            }

            let unexpected = run.status != run.expected_status && run.status != TestStatus::Skipped;
            if unexpected {
                debug!(test = %test.id, status = %run.status, "stopping worker after failure");
                self.stopped = true;
            }
        }

        // Unwind suites that still owe afterAll hooks. With no test in
        // flight their errors are worker-level.
        let timeouts = TimeoutManager::new(self.default_timeout());
        while let Some(left) = active.pop() {
            let mut errors = Vec::new();
            self.run_all_hooks(left.suite, HookKind::AfterAll, &timeouts, &mut errors)
                .await;
            done.fatal_errors.extend(errors);
        }
        if !self.fixtures.test_scope_clean() {
            if let Err(error) = self
                .fixtures
                .teardown_scope(FixtureScope::Test, &timeouts)
                .await
            {
                done.fatal_errors.push(error);
            }
        }
        done
    }

    /// Tear down everything the worker still holds. Called once, on stop.
    pub async fn shutdown(&mut self) -> Vec<TestError> {
        let timeouts = TimeoutManager::new(self.default_timeout());
        let mut errors = Vec::new();
        for scope in [FixtureScope::Test, FixtureScope::Worker, FixtureScope::Global] {
            if let Err(error) = self.fixtures.teardown_scope(scope, &timeouts).await {
                errors.push(error);
            }
        }
        errors
    }

    fn next_step_id(&mut self, test_id: &str) -> String {
        self.step_counter += 1;
        format!("{test_id}:{}", self.step_counter)
    }

    async fn begin_step(
        &mut self,
        test_id: &str,
        title: &str,
        category: &str,
        location: Option<Location>,
    ) -> (String, Instant) {
        let step_id = self.next_step_id(test_id);
        self.emit(WorkerMessage::StepBegin(StepBeginPayload {
            test_id: test_id.to_string(),
            step_id: step_id.clone(),
            title: title.to_string(),
            category: category.to_string(),
            parent_step_id: None,
            force_no_parent: true,
            location,
        }))
        .await;
        (step_id, Instant::now())
    }

    async fn end_step(
        &mut self,
        test_id: &str,
        step_id: String,
        title: &str,
        category: &str,
        started: Instant,
        error: Option<TestError>,
        steps: &mut Vec<TestStep>,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        self.emit(WorkerMessage::StepEnd(StepEndPayload {
            test_id: test_id.to_string(),
            step_id: step_id.clone(),
            duration_ms,
            error: error.clone(),
        }))
        .await;
        steps.push(TestStep {
            step_id,
            parent_step_id: None,
            title: title.to_string(),
            category: category.to_string(),
            duration_ms,
            error,
            location: None,
        });
    }

    #[allow(clippy::too_many_lines)]
    async fn run_one_test<'a>(
        &mut self,
        chain: &[&'a Suite],
        test: &Arc<TestCase>,
        annotations: Vec<Annotation>,
        next_chain: Option<&Vec<&'a Suite>>,
        active: &mut Vec<ActiveSuite<'a>>,
    ) -> TestRun<'a> {
        let effective_timeout = test
            .timeout
            .or_else(|| chain.iter().rev().find_map(|s| s.timeout))
            .unwrap_or_else(|| self.default_timeout());
        let timeouts = TimeoutManager::new(effective_timeout);

        let mut run = TestRun {
            status: TestStatus::Passed,
            expected_status: test.expected_status,
            errors: Vec::new(),
            steps: Vec::new(),
            failed_before_all: None,
        };
        let mut annotations = annotations;
        for annotation in &annotations {
            match annotation.kind {
                ModifierKind::Fail => run.expected_status = TestStatus::Failed,
                ModifierKind::Slow => timeouts.slow(),
                ModifierKind::Skip | ModifierKind::Fixme => {}
            }
        }

        if let Err(error) = self.fixtures.set_pool(test.pool.clone()) {
            run.status = TestStatus::Failed;
            run.errors.push(TestError::from(error));
            return run;
        }

        // Before hooks: enter new suites (modifiers, beforeAll), evaluate
        // deferred modifiers, then beforeEach ancestor to descendant.
        let mut halt: Option<Halt> = None;
        let (step_id, step_started) = self
            .begin_step(&test.id, "Before Hooks", "hook", None)
            .await;

        // Leave suites the previous test kept active but this chain does
        // not share (a skipped test in between defers the transition).
        let shared = active
            .iter()
            .zip(chain.iter())
            .take_while(|(a, s)| std::ptr::eq(a.suite, **s))
            .count();
        while active.len() > shared {
            if let Some(left) = active.pop() {
                let mut errors = Vec::new();
                self.run_all_hooks(left.suite, HookKind::AfterAll, &timeouts, &mut errors)
                    .await;
                if let Some(error) = errors.into_iter().next() {
                    halt.get_or_insert(Halt::Failure(error));
                }
            }
        }

        for suite in chain.iter().skip(active.len()) {
            if halt.is_some() {
                break;
            }
            let inherited = active
                .last()
                .map(|a| a.annotations.clone())
                .unwrap_or_default();
            match self.enter_suite(suite, inherited, &timeouts).await {
                Ok(entered) => active.push(entered),
                Err((entered, stage_halt)) => {
                    active.push(entered);
                    if let Halt::Failure(_) | Halt::Timeout(_) = &stage_halt {
                        run.failed_before_all = Some(*suite);
                    }
                    halt = Some(stage_halt);
                }
            }
        }

        if halt.is_none() {
            let deferred: Vec<Modifier> = active
                .iter()
                .flat_map(|a| a.deferred.iter().cloned())
                .collect();
            for modifier in deferred {
                match self.run_modifier(&modifier, &timeouts).await {
                    Ok(true) => {
                        match modifier.kind {
                            ModifierKind::Skip | ModifierKind::Fixme => {
                                halt = Some(Halt::Skipped);
                            }
                            ModifierKind::Fail => run.expected_status = TestStatus::Failed,
                            ModifierKind::Slow => timeouts.slow(),
                        }
                        annotations.push(Annotation {
                            kind: modifier.kind,
                            description: modifier.description.clone(),
                        });
                        if matches!(halt, Some(Halt::Skipped)) {
                            break;
                        }
                    }
                    Ok(false) => {}
                    Err(stage_halt) => {
                        halt = Some(stage_halt);
                        break;
                    }
                }
            }
        }

        if halt.is_none() {
            'hooks: for suite in chain {
                for hook in suite.hooks_of(HookKind::BeforeEach) {
                    if let Err(stage_halt) = self.run_hook(hook, &timeouts, None).await {
                        halt = Some(stage_halt);
                        break 'hooks;
                    }
                }
            }
        }
        let before_error = halt_error(&halt);
        self.end_step(
            &test.id,
            step_id,
            "Before Hooks",
            "hook",
            step_started,
            before_error,
            &mut run.steps,
        )
        .await;

        // Test body.
        if halt.is_none() {
            halt = self
                .run_stage(
                    &timeouts,
                    RunnableDescription::new(RunnableKind::Test)
                        .with_location(test.location.clone()),
                    &test.deps,
                    &test.location,
                    FixtureContext::Test,
                    &test.body,
                )
                .await
                .err();
        }

        // After hooks get a fresh budget so cleanup is never starved by an
        // already expired deadline.
        let after_slot = shared_slot(effective_timeout);
        let (step_id, step_started) = self.begin_step(&test.id, "After Hooks", "hook", None).await;
        let mut after_halt: Option<Halt> = None;

        for suite in chain.iter().rev() {
            for hook in suite.hooks_of(HookKind::AfterEach) {
                if let Err(stage_halt) = self
                    .run_hook(hook, &timeouts, Some(after_slot.clone()))
                    .await
                {
                    after_halt.get_or_insert(stage_halt);
                }
            }
        }

        if let Err(stage_halt) = self
            .run_test_teardown(&timeouts, after_slot.clone())
            .await
        {
            after_halt.get_or_insert(stage_halt);
        }

        // Leave suites the next test does not share; on failure leave all
        // so the recycled worker owes nothing. A skip keeps them active.
        let failed = matches!(halt, Some(Halt::Failure(_) | Halt::Timeout(_) | Halt::Interrupted))
            || matches!(
                after_halt,
                Some(Halt::Failure(_) | Halt::Timeout(_) | Halt::Interrupted)
            );
        while let Some(last) = active.last() {
            let keep = !failed
                && next_chain
                    .map(|next| next.iter().any(|s| std::ptr::eq(*s, last.suite)))
                    .unwrap_or(false);
            if keep {
                break;
            }
            let left = active.pop().map(|a| a.suite);
            if let Some(suite) = left {
                let mut errors = Vec::new();
                self.run_all_hooks(suite, HookKind::AfterAll, &timeouts, &mut errors)
                    .await;
                if let Some(error) = errors.into_iter().next() {
                    after_halt.get_or_insert(Halt::Failure(error));
                }
            }
        }

        let after_error = halt_error(&after_halt);
        self.end_step(
            &test.id,
            step_id,
            "After Hooks",
            "hook",
            step_started,
            after_error,
            &mut run.steps,
        )
        .await;

        // A skipped test still fails when its cleanup fails.
        let decisive = match (halt, after_halt) {
            (Some(Halt::Skipped), Some(after @ (Halt::Failure(_) | Halt::Timeout(_)))) => {
                Some(after)
            }
            (halt, after_halt) => halt.or(after_halt),
        };
        match decisive {
            None => run.status = TestStatus::Passed,
            Some(Halt::Skipped) => run.status = TestStatus::Skipped,
            Some(Halt::Interrupted) => run.status = TestStatus::Interrupted,
            Some(Halt::Timeout(error)) => {
                run.status = TestStatus::TimedOut;
                run.errors.push(error);
            }
            Some(Halt::Failure(error)) => {
                run.status = TestStatus::Failed;
                run.errors.push(error);
            }
        }
        run
    }

    /// Process a suite's modifiers and run its beforeAll hooks. The suite
    /// becomes active even when a hook fails, so its afterAll still runs.
    async fn enter_suite<'a>(
        &mut self,
        suite: &'a Suite,
        inherited: Vec<Annotation>,
        timeouts: &TimeoutManager,
    ) -> Result<ActiveSuite<'a>, (ActiveSuite<'a>, Halt)> {
        let mut entered = ActiveSuite {
            suite,
            annotations: inherited,
            deferred: Vec::new(),
        };
        for modifier in &suite.modifiers {
            let Some(_) = &modifier.func else {
                entered.annotations.push(Annotation {
                    kind: modifier.kind,
                    description: modifier.description.clone(),
                });
                continue;
            };
            if self.fixtures.depends_on_worker_fixtures_only(&modifier.deps) {
                match self.run_modifier(modifier, timeouts).await {
                    Ok(true) => entered.annotations.push(Annotation {
                        kind: modifier.kind,
                        description: modifier.description.clone(),
                    }),
                    Ok(false) => {}
                    Err(halt) => return Err((entered, halt)),
                }
            } else {
                entered.deferred.push(modifier.clone());
            }
        }

        for hook in suite.hooks_of(HookKind::BeforeAll) {
            if let Err(halt) = self.run_all_hook(hook, timeouts).await {
                return Err((entered, halt));
            }
        }
        Ok(entered)
    }

    /// One beforeAll/afterAll hook: own budget, no test-scope autos, and a
    /// test-scope teardown right after so per-hook fixtures never leak.
    async fn run_all_hook(&mut self, hook: &Hook, timeouts: &TimeoutManager) -> Result<(), Halt> {
        let result = self
            .run_stage(
                timeouts,
                RunnableDescription::new(RunnableKind::Hook(hook.kind))
                    .with_location(hook.location.clone())
                    .with_slot(shared_slot(self.default_timeout())),
                &hook.deps,
                &hook.location,
                FixtureContext::AllHooksOnly,
                &hook.func,
            )
            .await;
        let teardown = self
            .run_test_teardown(timeouts, shared_slot(self.default_timeout()))
            .await;
        result.and(teardown)
    }

    async fn run_all_hooks(
        &mut self,
        suite: &Suite,
        kind: HookKind,
        timeouts: &TimeoutManager,
        errors: &mut Vec<TestError>,
    ) {
        for hook in suite.hooks_of(kind) {
            if let Err(halt) = self.run_all_hook(hook, timeouts).await {
                match halt {
                    Halt::Failure(error) | Halt::Timeout(error) => errors.push(error),
                    Halt::Skipped | Halt::Interrupted => {}
                }
            }
        }
    }

    async fn run_hook(
        &mut self,
        hook: &Hook,
        timeouts: &TimeoutManager,
        slot: Option<SharedSlot>,
    ) -> Result<(), Halt> {
        let mut desc = RunnableDescription::new(RunnableKind::Hook(hook.kind))
            .with_location(hook.location.clone());
        if let Some(slot) = slot {
            desc = desc.with_slot(slot);
        }
        self.run_stage(
            timeouts,
            desc,
            &hook.deps,
            &hook.location,
            FixtureContext::Test,
            &hook.func,
        )
        .await
    }

    async fn run_modifier(
        &mut self,
        modifier: &Modifier,
        timeouts: &TimeoutManager,
    ) -> Result<bool, Halt> {
        let Some(func) = modifier.func.clone() else {
            return Ok(true);
        };
        timeouts.set_runnable(
            RunnableDescription::new(RunnableKind::Modifier(modifier.kind))
                .with_location(modifier.location.clone()),
        );
        let fixtures = &mut self.fixtures;
        let stop = self.stop.clone();
        let location = modifier.location.clone();
        let stage = async {
            let params = fixtures
                .resolve_params(&modifier.deps, &location, FixtureContext::Test, timeouts)
                .await?;
            match std::panic::AssertUnwindSafe(func(params)).catch_unwind().await {
                Ok(Ok(applies)) => Ok(applies),
                Ok(Err(error)) => Err(located(error.into(), &location)),
                Err(payload) => Err(TestError::at(
                    format!("modifier panicked: {}", panic_message(payload)),
                    location.clone(),
                )),
            }
        };
        let outcome = tokio::select! {
            result = stage => result.map_err(Halt::Failure),
            _ = timeouts.expired() => Err(Halt::Timeout(timeouts.timeout_error())),
            _ = stop.requested() => Err(Halt::Interrupted),
        };
        timeouts.clear_runnable();
        outcome
    }

    /// Resolve fixtures and run one body under the current budget, racing
    /// expiry and the stop signal.
    async fn run_stage(
        &mut self,
        timeouts: &TimeoutManager,
        desc: RunnableDescription,
        deps: &[String],
        location: &Location,
        context: FixtureContext,
        func: &TestFn,
    ) -> Result<(), Halt> {
        timeouts.set_runnable(desc);
        let fixtures = &mut self.fixtures;
        let stop = self.stop.clone();
        let stage = async {
            let params = fixtures
                .resolve_params(deps, location, context, timeouts)
                .await?;
            match std::panic::AssertUnwindSafe(func(params)).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(located(error.into(), location)),
                Err(payload) => Err(TestError::at(
                    format!("panic: {}", panic_message(payload)),
                    location.clone(),
                )),
            }
        };
        let outcome = tokio::select! {
            result = stage => result.map_err(Halt::Failure),
            _ = timeouts.expired() => Err(Halt::Timeout(timeouts.timeout_error())),
            _ = stop.requested() => Err(Halt::Interrupted),
        };
        timeouts.clear_runnable();
        outcome
    }

    /// Test-scope fixture teardown, bounded by the given slot but never
    /// interrupted by the stop signal.
    async fn run_test_teardown(
        &mut self,
        timeouts: &TimeoutManager,
        slot: SharedSlot,
    ) -> Result<(), Halt> {
        if self.fixtures.test_scope_clean() {
            return Ok(());
        }
        timeouts.set_runnable(
            RunnableDescription::new(RunnableKind::Teardown).with_slot(slot),
        );
        let fixtures = &mut self.fixtures;
        let outcome = tokio::select! {
            result = fixtures.teardown_scope(FixtureScope::Test, timeouts) => {
                result.map_err(Halt::Failure)
            }
            _ = timeouts.expired() => Err(Halt::Timeout(timeouts.timeout_error())),
        };
        timeouts.clear_runnable();
        outcome
    }
}

fn halt_error(halt: &Option<Halt>) -> Option<TestError> {
    match halt {
        Some(Halt::Failure(error)) | Some(Halt::Timeout(error)) => Some(error.clone()),
        _ => None,
    }
}

fn located(mut error: TestError, location: &Location) -> TestError {
    if error.location.is_none() {
        error.location = Some(location.clone());
    }
    error
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
