//! testpool
//!
//! An async test-execution runtime: tests declare the fixtures they need,
//! the runtime builds each fixture's dependency closure on demand, groups
//! tests into jobs keyed by their fixture requirements and runs the jobs on
//! a pool of isolated workers with retries, serial suites and hierarchical
//! timeouts.
//!
//! The main pieces:
//! - [`fixtures`]: fixture registration, validation and the setup/teardown
//!   engine.
//! - [`suite`]: the suite/test/hook data model and per-attempt results.
//! - [`grouping`]: test-to-job assignment and shard filtering.
//! - [`dispatch`]: the dispatcher that drives the worker pool.
//! - [`worker`]: the worker-side execution state machine.
//! - [`timeout`]: the shared time-slot timeout manager.

pub mod dispatch;
pub mod error;
pub mod fixtures;
pub mod grouping;
pub mod ipc;
pub mod reporter;
pub mod suite;
pub mod timeout;
pub mod worker;

pub use dispatch::{Dispatcher, RunConfig, StopHandle};
pub use error::{Location, TestError};
pub use fixtures::{
    FixtureDecl, FixtureOptions, FixturePool, FixtureRunner, FixtureScope, ProvideHandle,
    RegistrationIds,
};
pub use grouping::{create_test_groups, filter_for_shard, Shard, TestGroup};
pub use reporter::{init_tracing, LogReporter, Reporter};
pub use suite::{
    Annotation, Hook, HookKind, Modifier, ModifierKind, ParallelMode, RunStatus, RunSummary,
    Suite, TestCase, TestResult, TestStatus,
};
