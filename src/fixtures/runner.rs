//! Fixture instantiation and teardown
//!
//! Runs fixture factories as two-phase tasks (setup, idle, teardown),
//! memoizes instances per registration and tears scopes down in reverse
//! creation order.

#![allow(dead_code)]

use anyhow::anyhow;
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::TestError;
use crate::timeout::{shared_slot, FixtureDescription, TimeoutManager};

use super::registration::{
    FixturePool, FixtureRegistration, FixtureScope, FixtureSource, RegistrationId,
};

/// A live fixture value, shared between the instance and its dependents.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// Resolved fixture values keyed by the dependency names a body declared.
pub type FixtureParams = HashMap<String, FixtureValue>;

/// A two-phase fixture factory: set up, call [`ProvideHandle::provide`],
/// then run teardown code after `provide` returns.
pub type FixtureFactory = Arc<
    dyn Fn(FixtureParams, ProvideHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync,
>;

/// Hands a fixture value to dependents and parks the factory until teardown
pub struct ProvideHandle {
    ready: Option<oneshot::Sender<FixtureValue>>,
    teardown: Option<oneshot::Receiver<()>>,
}

impl ProvideHandle {
    /// Publish the value and wait for the teardown signal. Code after the
    /// await is the fixture's teardown phase. Calling this twice is an
    /// error.
    pub async fn provide<T: Any + Send + Sync>(&mut self, value: T) -> anyhow::Result<()> {
        self.provide_value(Arc::new(value)).await
    }

    pub async fn provide_value(&mut self, value: FixtureValue) -> anyhow::Result<()> {
        let (ready, teardown) = match (self.ready.take(), self.teardown.take()) {
            (Some(ready), Some(teardown)) => (ready, teardown),
            _ => return Err(anyhow!("fixture value provided twice")),
        };
        let _ = ready.send(value);
        // A dropped sender also means teardown (the instance was discarded).
        let _ = teardown.await;
        Ok(())
    }
}

/// A live instance of one registration
struct Fixture {
    registration: Arc<FixtureRegistration>,
    value: FixtureValue,
    /// Ids of registrations instantiated on top of this one. Dependents
    /// are torn down before their dependencies.
    usages: Vec<RegistrationId>,
    teardown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

/// Which test-scope fixtures a runnable may pull in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixtureContext {
    /// Tests and each-hooks: all scopes, all auto fixtures.
    Test,
    /// All-hooks (beforeAll/afterAll): test-scope auto fixtures are not
    /// installed, declared test-scope dependencies still are.
    AllHooksOnly,
}

/// Holds the live fixture instances of one worker
///
/// Instances are memoized by registration id, so a diamond dependency sets
/// up once per scope lifetime.
pub struct FixtureRunner {
    pool: Option<Arc<FixturePool>>,
    instances: HashMap<RegistrationId, Fixture>,
    /// Creation order, used for reverse-order scope teardown.
    order: Vec<RegistrationId>,
    test_scope_clean: bool,
}

impl Default for FixtureRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureRunner {
    pub fn new() -> Self {
        Self {
            pool: None,
            instances: HashMap::new(),
            order: Vec::new(),
            test_scope_clean: true,
        }
    }

    /// Install the pool for the next test. A worker only ever receives
    /// pools whose worker-scope digest matches its hash.
    pub fn set_pool(&mut self, pool: Arc<FixturePool>) -> anyhow::Result<()> {
        if !self.test_scope_clean {
            return Err(anyhow!("cannot switch fixture pool with live test-scope fixtures"));
        }
        if let Some(existing) = &self.pool {
            if existing.digest != pool.digest {
                return Err(anyhow!(
                    "fixture pool digest changed within one worker: {} != {}",
                    existing.digest,
                    pool.digest
                ));
            }
        }
        self.pool = Some(pool);
        Ok(())
    }

    pub fn pool(&self) -> Option<&Arc<FixturePool>> {
        self.pool.as_ref()
    }

    /// `true` when every declared dependency resolves to a worker or
    /// global fixture, so the runnable can go first within all-hooks.
    pub fn depends_on_worker_fixtures_only(&self, deps: &[String]) -> bool {
        let Some(pool) = &self.pool else { return false };
        deps.iter().all(|name| {
            pool.get(name)
                .map(|reg| reg.scope != FixtureScope::Test)
                .unwrap_or(false)
        })
    }

    /// Resolve the values for a declared dependency list, installing auto
    /// fixtures first.
    pub async fn resolve_params(
        &mut self,
        deps: &[String],
        location: &crate::error::Location,
        context: FixtureContext,
        timeouts: &TimeoutManager,
    ) -> Result<FixtureParams, TestError> {
        let pool = self
            .pool
            .clone()
            .ok_or_else(|| TestError::new("no fixture pool installed"))?;

        for auto in pool.auto_registrations() {
            if context == FixtureContext::AllHooksOnly && auto.scope == FixtureScope::Test {
                continue;
            }
            self.setup_fixture(auto, timeouts).await?;
        }

        let mut params = FixtureParams::new();
        for name in deps {
            let registration = pool.get(name).ok_or_else(|| {
                TestError::at(format!("unknown fixture \"{name}\""), location.clone())
            })?;
            let value = self.setup_fixture(registration, timeouts).await?;
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    /// Instantiate a registration (and transitively its dependencies),
    /// reusing the live instance when one exists.
    pub fn setup_fixture<'a>(
        &'a mut self,
        registration: Arc<FixtureRegistration>,
        timeouts: &'a TimeoutManager,
    ) -> BoxFuture<'a, Result<FixtureValue, TestError>> {
        Box::pin(async move {
            if let Some(instance) = self.instances.get(&registration.id) {
                return Ok(instance.value.clone());
            }
            let pool = self
                .pool
                .clone()
                .ok_or_else(|| TestError::new("no fixture pool installed"))?;

            let mut params = FixtureParams::new();
            let mut dep_ids = Vec::new();
            for name in &registration.deps {
                let dep = pool.resolve(name, Some(&registration)).ok_or_else(|| {
                    TestError::at(
                        format!(
                            "fixture \"{}\" has unknown dependency \"{name}\"",
                            registration.name
                        ),
                        registration.location.clone(),
                    )
                })?;
                let value = self.setup_fixture(dep.clone(), timeouts).await?;
                params.insert(name.clone(), value);
                dep_ids.push(dep.id);
            }

            debug!(fixture = %registration.name, scope = %registration.scope, "setting up fixture");
            let (value, teardown_tx, task) = match &registration.source {
                FixtureSource::Value(value) => (value.clone(), None, None),
                FixtureSource::Factory(factory) => {
                    let (ready_tx, ready_rx) = oneshot::channel();
                    let (teardown_tx, teardown_rx) = oneshot::channel();
                    let handle = ProvideHandle {
                        ready: Some(ready_tx),
                        teardown: Some(teardown_rx),
                    };
                    let task = tokio::spawn(factory(params, handle));

                    timeouts.set_current_fixture(Some(FixtureDescription {
                        title: format!("fixture \"{}\" setup", registration.name),
                        location: registration.location.clone(),
                        slot: registration.timeout.map(shared_slot),
                    }));
                    let provided = ready_rx.await;
                    timeouts.set_current_fixture(None);

                    match provided {
                        Ok(value) => (value, Some(teardown_tx), Some(task)),
                        Err(_) => {
                            // The factory returned without providing.
                            return Err(match task.await {
                                Ok(Ok(())) => TestError::at(
                                    format!(
                                        "fixture \"{}\" finished without providing a value",
                                        registration.name
                                    ),
                                    registration.location.clone(),
                                ),
                                Ok(Err(error)) => {
                                    let mut error = TestError::from(error);
                                    if error.location.is_none() {
                                        error.location = Some(registration.location.clone());
                                    }
                                    error
                                }
                                Err(join) => TestError::at(
                                    format!(
                                        "fixture \"{}\" setup panicked: {join}",
                                        registration.name
                                    ),
                                    registration.location.clone(),
                                ),
                            });
                        }
                    }
                }
            };

            if registration.scope == FixtureScope::Test {
                self.test_scope_clean = false;
            }
            self.instances.insert(
                registration.id,
                Fixture {
                    registration: registration.clone(),
                    value: value.clone(),
                    usages: Vec::new(),
                    teardown_tx,
                    task,
                },
            );
            self.order.push(registration.id);
            for dep_id in dep_ids {
                if let Some(dep) = self.instances.get_mut(&dep_id) {
                    dep.usages.push(registration.id);
                }
            }
            Ok(value)
        })
    }

    /// Tear down every live instance of a scope, newest first. Teardown is
    /// best effort: all instances are torn down and the first error wins.
    pub async fn teardown_scope(
        &mut self,
        scope: FixtureScope,
        timeouts: &TimeoutManager,
    ) -> Result<(), TestError> {
        let ids: Vec<RegistrationId> = self
            .order
            .iter()
            .rev()
            .filter(|id| {
                self.instances
                    .get(id)
                    .map(|i| i.registration.scope == scope)
                    .unwrap_or(false)
            })
            .copied()
            .collect();

        let mut first_error = None;
        for id in ids {
            if let Err(error) = self.teardown_instance(id, timeouts).await {
                first_error.get_or_insert(error);
            }
        }
        if scope == FixtureScope::Test {
            self.test_scope_clean = true;
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Tear down one instance, its dependents first.
    fn teardown_instance<'a>(
        &'a mut self,
        id: RegistrationId,
        timeouts: &'a TimeoutManager,
    ) -> BoxFuture<'a, Result<(), TestError>> {
        Box::pin(async move {
            let Some(mut instance) = self.instances.remove(&id) else {
                return Ok(());
            };
            self.order.retain(|other| *other != id);

            let mut first_error = None;
            for usage in std::mem::take(&mut instance.usages) {
                if let Err(error) = self.teardown_instance(usage, timeouts).await {
                    first_error.get_or_insert(error);
                }
            }

            let registration = instance.registration.clone();
            debug!(fixture = %registration.name, "tearing down fixture");
            if let Some(tx) = instance.teardown_tx.take() {
                let _ = tx.send(());
            }
            if let Some(task) = instance.task.take() {
                timeouts.set_current_fixture(Some(FixtureDescription {
                    title: format!("fixture \"{}\" teardown", registration.name),
                    location: registration.location.clone(),
                    slot: registration.timeout.map(shared_slot),
                }));
                let finished = task.await;
                timeouts.set_current_fixture(None);
                match finished {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        let mut error = TestError::from(error);
                        if error.location.is_none() {
                            error.location = Some(registration.location.clone());
                        }
                        first_error.get_or_insert(error);
                    }
                    Err(join) => {
                        first_error.get_or_insert(TestError::at(
                            format!("fixture \"{}\" teardown panicked: {join}", registration.name),
                            registration.location.clone(),
                        ));
                    }
                }
            }
            match first_error {
                Some(error) => Err(error),
                None => Ok(()),
            }
        })
    }

    pub fn test_scope_clean(&self) -> bool {
        self.test_scope_clean
    }

    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Location;
    use crate::fixtures::registration::{FixtureDecl, FixtureOptions, RegistrationIds};
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn loc(line: u32) -> Location {
        Location::new("fixtures.rs", line, 1)
    }

    fn manager() -> TimeoutManager {
        TimeoutManager::new(Duration::ZERO)
    }

    fn logged(name: &'static str, deps: &[&str], log: &Log) -> FixtureDecl {
        let log = log.clone();
        FixtureDecl::factory(name, deps, loc(1), move |_params, mut handle| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("setup {name}"));
                handle.provide(name).await?;
                log.lock().unwrap().push(format!("teardown {name}"));
                Ok(())
            }
        })
    }

    fn pool_of(decls: Vec<FixtureDecl>) -> Arc<FixturePool> {
        let mut ids = RegistrationIds::new();
        Arc::new(FixturePool::build(&[decls], &mut ids, None, false).unwrap())
    }

    #[tokio::test]
    async fn chain_sets_up_in_dependency_order_and_tears_down_in_reverse() {
        let log: Log = Default::default();
        let pool = pool_of(vec![
            logged("a", &[], &log),
            logged("b", &["a"], &log),
            logged("c", &["b"], &log),
        ]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        let reg = pool.get("c").unwrap();
        runner.setup_fixture(reg, &timeouts).await.unwrap();
        runner
            .teardown_scope(FixtureScope::Test, &timeouts)
            .await
            .unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "setup a",
                "setup b",
                "setup c",
                "teardown c",
                "teardown b",
                "teardown a"
            ]
        );
        assert!(runner.test_scope_clean());
        assert_eq!(runner.live_instances(), 0);
    }

    #[tokio::test]
    async fn diamond_dependency_sets_up_once() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = {
            let count = count.clone();
            FixtureDecl::factory("base", &[], loc(1), move |_params, mut handle| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    handle.provide(()).await
                }
            })
        };
        let leaf = |name: &'static str| {
            FixtureDecl::factory(name, &["base"], loc(2), |_params, mut handle| async move {
                handle.provide(()).await
            })
        };
        let pool = pool_of(vec![counter, leaf("left"), leaf("right")]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        runner
            .setup_fixture(pool.get("left").unwrap(), &timeouts)
            .await
            .unwrap();
        runner
            .setup_fixture(pool.get("right").unwrap(), &timeouts)
            .await
            .unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn value_fixture_resolves_without_a_task() {
        let pool = pool_of(vec![FixtureDecl::value("port", loc(1), 8080u16)]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        let value = runner
            .setup_fixture(pool.get("port").unwrap(), &timeouts)
            .await
            .unwrap();
        assert_eq!(*value.downcast::<u16>().unwrap(), 8080);
    }

    #[tokio::test]
    async fn provide_twice_is_an_error() {
        let pool = pool_of(vec![FixtureDecl::factory(
            "greedy",
            &[],
            loc(3),
            |_params, mut handle| async move {
                // First provide parks until teardown, second must fail.
                handle.provide(1u32).await?;
                handle.provide(2u32).await?;
                Ok(())
            },
        )]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        runner
            .setup_fixture(pool.get("greedy").unwrap(), &timeouts)
            .await
            .unwrap();
        let error = runner
            .teardown_scope(FixtureScope::Test, &timeouts)
            .await
            .unwrap_err();
        assert!(error.message.contains("provided twice"), "{}", error.message);
    }

    #[tokio::test]
    async fn factory_error_before_provide_carries_declaration_site() {
        let pool = pool_of(vec![FixtureDecl::factory(
            "broken",
            &[],
            loc(9),
            |_params, _handle| async move { Err(anyhow!("connection refused")) },
        )]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        let error = runner
            .setup_fixture(pool.get("broken").unwrap(), &timeouts)
            .await
            .unwrap_err();
        assert!(error.message.contains("connection refused"));
        assert_eq!(error.location, Some(loc(9)));
    }

    #[tokio::test]
    async fn finishing_without_provide_is_an_error() {
        let pool = pool_of(vec![FixtureDecl::factory(
            "silent",
            &[],
            loc(4),
            |_params, _handle| async move { Ok(()) },
        )]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        let error = runner
            .setup_fixture(pool.get("silent").unwrap(), &timeouts)
            .await
            .unwrap_err();
        assert!(error.message.contains("without providing"), "{}", error.message);
    }

    #[tokio::test]
    async fn test_scope_teardown_keeps_worker_fixtures_alive() {
        let log: Log = Default::default();
        let pool = pool_of(vec![
            logged("wide", &[], &log)
                .with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
            logged("narrow", &["wide"], &log),
        ]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        runner
            .setup_fixture(pool.get("narrow").unwrap(), &timeouts)
            .await
            .unwrap();
        runner
            .teardown_scope(FixtureScope::Test, &timeouts)
            .await
            .unwrap();
        assert_eq!(runner.live_instances(), 1);

        // The next test reuses the worker instance without a new setup.
        runner
            .setup_fixture(pool.get("narrow").unwrap(), &timeouts)
            .await
            .unwrap();
        runner
            .teardown_scope(FixtureScope::Test, &timeouts)
            .await
            .unwrap();
        runner
            .teardown_scope(FixtureScope::Worker, &timeouts)
            .await
            .unwrap();

        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "setup wide",
                "setup narrow",
                "teardown narrow",
                "setup narrow",
                "teardown narrow",
                "teardown wide"
            ]
        );
    }

    #[tokio::test]
    async fn teardown_is_best_effort_and_reports_first_error() {
        let log: Log = Default::default();
        let failing = |name: &'static str, log: &Log| {
            let log = log.clone();
            FixtureDecl::factory(name, &[], loc(1), move |_params, mut handle| {
                let log = log.clone();
                async move {
                    handle.provide(()).await?;
                    log.lock().unwrap().push(format!("teardown {name}"));
                    Err(anyhow!("{name} teardown failed"))
                }
            })
        };
        let pool = pool_of(vec![failing("first", &log), failing("second", &log)]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool.clone()).unwrap();
        let timeouts = manager();

        runner
            .setup_fixture(pool.get("first").unwrap(), &timeouts)
            .await
            .unwrap();
        runner
            .setup_fixture(pool.get("second").unwrap(), &timeouts)
            .await
            .unwrap();
        let error = runner
            .teardown_scope(FixtureScope::Test, &timeouts)
            .await
            .unwrap_err();

        // Newest first, both torn down despite the errors.
        assert!(error.message.contains("second teardown failed"));
        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec!["teardown second", "teardown first"]);
    }

    #[tokio::test]
    async fn auto_fixtures_install_with_resolved_params() {
        let log: Log = Default::default();
        let auto = logged("tracer", &[], &log).with_options(FixtureOptions::new().auto(true));
        let plain = logged("db", &[], &log);
        let pool = pool_of(vec![auto, plain]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool).unwrap();
        let timeouts = manager();

        let params = runner
            .resolve_params(
                &["db".to_string()],
                &loc(1),
                FixtureContext::Test,
                &timeouts,
            )
            .await
            .unwrap();
        assert!(params.contains_key("db"));
        assert!(!params.contains_key("tracer"));
        assert_eq!(runner.live_instances(), 2);
    }

    #[tokio::test]
    async fn all_hooks_context_skips_test_scope_autos() {
        let log: Log = Default::default();
        let test_auto = logged("page", &[], &log).with_options(FixtureOptions::new().auto(true));
        let worker_auto = logged("server", &[], &log)
            .with_options(FixtureOptions::new().auto(true).scope(FixtureScope::Worker));
        let pool = pool_of(vec![test_auto, worker_auto]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool).unwrap();
        let timeouts = manager();

        runner
            .resolve_params(&[], &loc(1), FixtureContext::AllHooksOnly, &timeouts)
            .await
            .unwrap();
        let events = log.lock().unwrap().clone();
        assert_eq!(events, vec!["setup server"]);
    }

    #[tokio::test]
    async fn worker_only_dependency_check() {
        let pool = pool_of(vec![
            logged("wide", &[], &Default::default())
                .with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
            logged("narrow", &[], &Default::default()),
        ]);
        let mut runner = FixtureRunner::new();
        runner.set_pool(pool).unwrap();
        assert!(runner.depends_on_worker_fixtures_only(&["wide".to_string()]));
        assert!(!runner.depends_on_worker_fixtures_only(&["narrow".to_string()]));
        assert!(!runner.depends_on_worker_fixtures_only(&["missing".to_string()]));
    }
}
