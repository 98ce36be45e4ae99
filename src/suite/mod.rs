//! Test suite data model
//!
//! Suites, test cases, hooks and modifiers as produced by the loader, plus
//! the per-attempt result types reported back by workers.

#![allow(dead_code)]

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Location, TestError};
use crate::fixtures::{FixtureParams, FixturePool};

pub type TestId = String;

/// Outcome of a single test attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
    Interrupted,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::TimedOut => write!(f, "timedOut"),
            TestStatus::Skipped => write!(f, "skipped"),
            TestStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Body of a test or hook, invoked with its resolved fixtures.
pub type TestFn =
    Arc<dyn Fn(FixtureParams) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Conditional modifier body; returning `true` applies the modifier.
pub type ModifierFn =
    Arc<dyn Fn(FixtureParams) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookKind {
    BeforeAll,
    AfterAll,
    BeforeEach,
    AfterEach,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookKind::BeforeAll => write!(f, "beforeAll"),
            HookKind::AfterAll => write!(f, "afterAll"),
            HookKind::BeforeEach => write!(f, "beforeEach"),
            HookKind::AfterEach => write!(f, "afterEach"),
        }
    }
}

/// A suite-level hook
#[derive(Clone)]
pub struct Hook {
    pub kind: HookKind,
    pub title: String,
    pub func: TestFn,
    pub deps: Vec<String>,
    pub location: Location,
}

impl Hook {
    pub fn new<F, Fut>(kind: HookKind, deps: &[&str], location: Location, f: F) -> Self
    where
        F: Fn(FixtureParams) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            kind,
            title: format!("{kind} hook"),
            func: Arc::new(move |params| Box::pin(f(params))),
            deps: deps.iter().map(|d| (*d).to_string()).collect(),
            location,
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifierKind {
    Skip,
    Fixme,
    Fail,
    Slow,
}

impl fmt::Display for ModifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModifierKind::Skip => write!(f, "skip"),
            ModifierKind::Fixme => write!(f, "fixme"),
            ModifierKind::Fail => write!(f, "fail"),
            ModifierKind::Slow => write!(f, "slow"),
        }
    }
}

/// A suite-level modifier, either unconditional or gated on a predicate
/// that receives fixtures.
#[derive(Clone)]
pub struct Modifier {
    pub kind: ModifierKind,
    pub description: Option<String>,
    pub func: Option<ModifierFn>,
    pub deps: Vec<String>,
    pub location: Location,
}

impl Modifier {
    pub fn unconditional(kind: ModifierKind, location: Location) -> Self {
        Self {
            kind,
            description: None,
            func: None,
            deps: Vec::new(),
            location,
        }
    }

    pub fn conditional<F, Fut>(kind: ModifierKind, deps: &[&str], location: Location, f: F) -> Self
    where
        F: Fn(FixtureParams) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        Self {
            kind,
            description: None,
            func: Some(Arc::new(move |params| Box::pin(f(params)))),
            deps: deps.iter().map(|d| (*d).to_string()).collect(),
            location,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl fmt::Debug for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modifier")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// An annotation applied to a test, either statically or by a modifier
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: ModifierKind,
    pub description: Option<String>,
}

impl Annotation {
    pub fn new(kind: ModifierKind) -> Self {
        Self {
            kind,
            description: None,
        }
    }
}

/// How the tests of a suite may be distributed across workers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParallelMode {
    /// Inherit from the parent suite; file order within one worker.
    #[default]
    Default,
    /// All tests run in one worker, in order, and a failure skips the rest.
    Serial,
    /// Every test may go to its own worker.
    Parallel,
}

/// One declared test
pub struct TestCase {
    pub id: TestId,
    pub title: String,
    pub location: Location,
    pub retries: u32,
    pub expected_status: TestStatus,
    pub timeout: Option<Duration>,
    pub annotations: Vec<Annotation>,
    pub body: TestFn,
    pub deps: Vec<String>,
    pub pool: Arc<FixturePool>,
    pub require_file: String,
}

impl TestCase {
    pub fn new<F, Fut>(
        id: impl Into<TestId>,
        title: impl Into<String>,
        location: Location,
        pool: Arc<FixturePool>,
        require_file: impl Into<String>,
        deps: &[&str],
        body: F,
    ) -> Self
    where
        F: Fn(FixtureParams) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            id: id.into(),
            title: title.into(),
            location,
            retries: 0,
            expected_status: TestStatus::Passed,
            timeout: None,
            annotations: Vec::new(),
            body: Arc::new(move |params| Box::pin(body(params))),
            deps: deps.iter().map(|d| (*d).to_string()).collect(),
            pool,
            require_file: require_file.into(),
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn with_expected_status(mut self, status: TestStatus) -> Self {
        self.expected_status = status;
        self
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum SuiteEntry {
    Suite(Suite),
    Test(Arc<TestCase>),
}

/// A suite of tests and nested suites, in declaration order
#[derive(Debug, Default)]
pub struct Suite {
    pub title: String,
    pub location: Option<Location>,
    pub parallel_mode: ParallelMode,
    pub timeout: Option<Duration>,
    pub hooks: Vec<Hook>,
    pub modifiers: Vec<Modifier>,
    pub entries: Vec<SuiteEntry>,
}

impl Suite {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn serial(mut self) -> Self {
        self.parallel_mode = ParallelMode::Serial;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel_mode = ParallelMode::Parallel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn add_suite(mut self, suite: Suite) -> Self {
        self.entries.push(SuiteEntry::Suite(suite));
        self
    }

    pub fn add_test(mut self, test: TestCase) -> Self {
        self.entries.push(SuiteEntry::Test(Arc::new(test)));
        self
    }

    pub fn add_hook(mut self, hook: Hook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn add_modifier(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    pub fn hooks_of(&self, kind: HookKind) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.kind == kind)
    }

    pub fn has_hooks_of(&self, kind: HookKind) -> bool {
        self.hooks.iter().any(|h| h.kind == kind)
    }

    /// All tests in declaration (depth-first) order.
    pub fn all_tests(&self) -> Vec<Arc<TestCase>> {
        let mut tests = Vec::new();
        self.collect_tests(&mut tests);
        tests
    }

    fn collect_tests(&self, out: &mut Vec<Arc<TestCase>>) {
        for entry in &self.entries {
            match entry {
                SuiteEntry::Suite(suite) => suite.collect_tests(out),
                SuiteEntry::Test(test) => out.push(test.clone()),
            }
        }
    }

    pub fn find_test(&self, id: &str) -> Option<Arc<TestCase>> {
        for entry in &self.entries {
            match entry {
                SuiteEntry::Suite(suite) => {
                    if let Some(test) = suite.find_test(id) {
                        return Some(test);
                    }
                }
                SuiteEntry::Test(test) if test.id == id => return Some(test.clone()),
                SuiteEntry::Test(_) => {}
            }
        }
        None
    }

    /// Every test together with its suite chain, root first.
    pub fn tests_with_chain(&self) -> Vec<(Vec<&Suite>, Arc<TestCase>)> {
        let mut out = Vec::new();
        let mut chain = vec![self];
        self.collect_chains(&mut chain, &mut out);
        out
    }

    fn collect_chains<'a>(
        &'a self,
        chain: &mut Vec<&'a Suite>,
        out: &mut Vec<(Vec<&'a Suite>, Arc<TestCase>)>,
    ) {
        for entry in &self.entries {
            match entry {
                SuiteEntry::Suite(suite) => {
                    chain.push(suite);
                    suite.collect_chains(chain, out);
                    chain.pop();
                }
                SuiteEntry::Test(test) => out.push((chain.clone(), test.clone())),
            }
        }
    }

    /// Ids of every test belonging to an outermost serial suite that
    /// contains at least one of the given failed tests.
    ///
    /// A failure inside a serial suite invalidates the whole suite: all of
    /// its tests restart together on retry.
    pub fn tests_in_failed_serial_suites(&self, failed: &HashSet<TestId>) -> HashSet<TestId> {
        let mut out = HashSet::new();
        for (chain, test) in self.tests_with_chain() {
            if !failed.contains(&test.id) {
                continue;
            }
            if let Some(serial) = chain
                .iter()
                .find(|s| s.parallel_mode == ParallelMode::Serial)
            {
                for sibling in serial.all_tests() {
                    out.insert(sibling.id.clone());
                }
            }
        }
        out
    }
}

/// Annotations a test carries before any conditional modifier runs: its
/// own plus every unconditional modifier along its suite chain.
pub fn static_annotations(chain: &[&Suite], test: &TestCase) -> Vec<Annotation> {
    let mut annotations = Vec::new();
    for suite in chain {
        for modifier in &suite.modifiers {
            if modifier.func.is_none() {
                annotations.push(Annotation {
                    kind: modifier.kind,
                    description: modifier.description.clone(),
                });
            }
        }
    }
    annotations.extend(test.annotations.iter().cloned());
    annotations
}

pub fn has_skip_annotation(annotations: &[Annotation]) -> bool {
    annotations
        .iter()
        .any(|a| matches!(a.kind, ModifierKind::Skip | ModifierKind::Fixme))
}

/// One step inside a test attempt (a hook phase, a fixture, a user step)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestStep {
    pub step_id: String,
    pub parent_step_id: Option<String>,
    pub title: String,
    pub category: String,
    pub duration_ms: u64,
    pub error: Option<TestError>,
    pub location: Option<Location>,
}

/// One attempt of one test
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: TestId,
    pub retry: u32,
    pub worker_index: Option<usize>,
    pub status: TestStatus,
    pub expected_status: TestStatus,
    pub duration_ms: u64,
    pub errors: Vec<TestError>,
    pub steps: Vec<TestStep>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl TestResult {
    /// A fresh attempt. Unfinished attempts stay `Interrupted`.
    pub fn started(test_id: impl Into<TestId>, retry: u32, worker_index: usize) -> Self {
        Self {
            test_id: test_id.into(),
            retry,
            worker_index: Some(worker_index),
            status: TestStatus::Interrupted,
            expected_status: TestStatus::Passed,
            duration_ms: 0,
            errors: Vec::new(),
            steps: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// An attempt that never reached a worker (mass skip, missing test).
    pub fn unstarted(test_id: impl Into<TestId>, retry: u32, status: TestStatus) -> Self {
        Self {
            test_id: test_id.into(),
            retry,
            worker_index: None,
            status,
            expected_status: TestStatus::Passed,
            duration_ms: 0,
            errors: Vec::new(),
            steps: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    pub fn is_expected(&self) -> bool {
        self.status == self.expected_status || self.status == TestStatus::Skipped
    }
}

/// Final verdict of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
    Interrupted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Passed => write!(f, "passed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Everything a run produced, keyed by test id
#[derive(Debug)]
pub struct RunSummary {
    pub status: RunStatus,
    pub results: HashMap<TestId, Vec<TestResult>>,
}

impl RunSummary {
    pub fn attempts(&self, test_id: &str) -> &[TestResult] {
        self.results.get(test_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_status(&self, test_id: &str) -> Option<TestStatus> {
        self.attempts(test_id).last().map(|r| r.status)
    }
}
