//! Hierarchical timeout manager
//!
//! Tracks a hierarchy of time budgets (test, hook, fixture) sharing one
//! countdown primitive that is re-armed on every scope transition.

#![allow(dead_code)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Location, TestError};
use crate::suite::{HookKind, ModifierKind};

/// A mutable time budget
///
/// A zero timeout is the disabled/debug sentinel: the budget never expires
/// and explicit overrides must keep it disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeSlot {
    pub timeout: Duration,
    pub elapsed: Duration,
}

impl TimeSlot {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            elapsed: Duration::ZERO,
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_disabled(&self) -> bool {
        self.timeout.is_zero()
    }

    /// Remaining budget, `None` when disabled.
    pub fn remaining(&self) -> Option<Duration> {
        if self.is_disabled() {
            None
        } else {
            Some(self.timeout.saturating_sub(self.elapsed))
        }
    }
}

/// A slot shared between several runnables (e.g. one budget for all
/// after-hooks of a test).
pub type SharedSlot = Arc<Mutex<TimeSlot>>;

pub fn shared_slot(timeout: Duration) -> SharedSlot {
    Arc::new(Mutex::new(TimeSlot::new(timeout)))
}

/// What kind of code is currently accounted against the budget
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunnableKind {
    Test,
    Hook(HookKind),
    Modifier(ModifierKind),
    Teardown,
}

impl fmt::Display for RunnableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnableKind::Test => write!(f, "test"),
            RunnableKind::Hook(kind) => write!(f, "{kind} hook"),
            RunnableKind::Modifier(kind) => write!(f, "{kind} modifier"),
            RunnableKind::Teardown => write!(f, "teardown"),
        }
    }
}

/// The runnable currently charged for elapsed time
#[derive(Clone, Debug)]
pub struct RunnableDescription {
    pub kind: RunnableKind,
    pub location: Option<Location>,
    pub slot: Option<SharedSlot>,
}

impl RunnableDescription {
    pub fn new(kind: RunnableKind) -> Self {
        Self {
            kind,
            location: None,
            slot: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_slot(mut self, slot: SharedSlot) -> Self {
        self.slot = Some(slot);
        self
    }
}

/// A fixture temporarily accounted on top of the current runnable
///
/// When set, a fixture with its own slot is billed separately and does not
/// consume the runnable's budget.
#[derive(Clone, Debug)]
pub struct FixtureDescription {
    pub title: String,
    pub location: Location,
    pub slot: Option<SharedSlot>,
}

struct Inner {
    default_slot: SharedSlot,
    runnable: Option<RunnableDescription>,
    fixture: Option<FixtureDescription>,
    running_since: Option<Instant>,
}

/// Re-armable countdown shared by all budgeted regions of one test
///
/// The current slot is `fixture.slot ?? runnable.slot ?? default`. Every
/// transition snapshots elapsed time into the slot being left and re-arms
/// the deadline with the remaining budget of the slot being entered.
pub struct TimeoutManager {
    inner: Mutex<Inner>,
    deadline: watch::Sender<Option<Instant>>,
}

impl TimeoutManager {
    pub fn new(default_timeout: Duration) -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            inner: Mutex::new(Inner {
                default_slot: shared_slot(default_timeout),
                runnable: None,
                fixture: None,
                running_since: None,
            }),
            deadline,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_slot(inner: &Inner) -> SharedSlot {
        inner
            .fixture
            .as_ref()
            .and_then(|f| f.slot.clone())
            .or_else(|| inner.runnable.as_ref().and_then(|r| r.slot.clone()))
            .unwrap_or_else(|| inner.default_slot.clone())
    }

    fn slot_guard(slot: &SharedSlot) -> MutexGuard<'_, TimeSlot> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Charge the time since the last transition to the slot being left.
    fn snapshot(inner: &mut Inner) {
        if let Some(since) = inner.running_since.take() {
            let slot = Self::current_slot(inner);
            Self::slot_guard(&slot).elapsed += since.elapsed();
        }
    }

    /// Restart the countdown against the (possibly new) current slot.
    fn rearm(&self, inner: &mut Inner) {
        if inner.runnable.is_none() && inner.fixture.is_none() {
            inner.running_since = None;
            let _ = self.deadline.send_replace(None);
            return;
        }
        let now = Instant::now();
        inner.running_since = Some(now);
        let slot = Self::current_slot(inner);
        let deadline = Self::slot_guard(&slot).remaining().map(|left| now + left);
        let _ = self.deadline.send_replace(deadline);
    }

    /// Enter a new runnable, leaving the previous one.
    pub fn set_runnable(&self, runnable: RunnableDescription) {
        let mut inner = self.lock();
        Self::snapshot(&mut inner);
        inner.runnable = Some(runnable);
        self.rearm(&mut inner);
    }

    /// Leave the current runnable and disarm the countdown.
    pub fn clear_runnable(&self) {
        let mut inner = self.lock();
        Self::snapshot(&mut inner);
        inner.runnable = None;
        inner.fixture = None;
        self.rearm(&mut inner);
    }

    /// Enter or leave a fixture's accounted block.
    pub fn set_current_fixture(&self, fixture: Option<FixtureDescription>) {
        let mut inner = self.lock();
        Self::snapshot(&mut inner);
        inner.fixture = fixture;
        self.rearm(&mut inner);
    }

    /// Triple the current slot's budget (slow annotation).
    pub fn slow(&self) {
        let mut inner = self.lock();
        Self::snapshot(&mut inner);
        let slot = Self::current_slot(&inner);
        {
            let mut guard = Self::slot_guard(&slot);
            if !guard.is_disabled() {
                guard.timeout *= 3;
            }
        }
        self.rearm(&mut inner);
    }

    /// Override the current slot's budget, unless it is the zero sentinel.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.lock();
        Self::snapshot(&mut inner);
        let slot = Self::current_slot(&inner);
        {
            let mut guard = Self::slot_guard(&slot);
            if !guard.is_disabled() {
                guard.timeout = timeout;
            }
        }
        self.rearm(&mut inner);
    }

    pub fn default_slot(&self) -> SharedSlot {
        self.lock().default_slot.clone()
    }

    /// Budget of the current slot, `None` when disabled.
    pub fn current_timeout(&self) -> Option<Duration> {
        let inner = self.lock();
        let slot = Self::current_slot(&inner);
        let guard = Self::slot_guard(&slot);
        if guard.is_disabled() {
            None
        } else {
            Some(guard.timeout)
        }
    }

    /// Resolves when the armed deadline passes. Pends forever while the
    /// countdown is disarmed or the budget is disabled.
    pub async fn expired(&self) {
        let mut rx = self.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                futures::future::pending::<()>().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        futures::future::pending::<()>().await;
                    }
                }
            }
        }
    }

    /// Error naming what ran out of time and where it was declared.
    pub fn timeout_error(&self) -> TestError {
        let inner = self.lock();
        let slot = Self::current_slot(&inner);
        let timeout_ms = Self::slot_guard(&slot).timeout.as_millis();
        if let Some(fixture) = &inner.fixture {
            return TestError::at(
                format!("Timeout of {timeout_ms}ms exceeded while running {}", fixture.title),
                fixture.location.clone(),
            );
        }
        match &inner.runnable {
            Some(runnable) => {
                let message = format!("{} timeout of {timeout_ms}ms exceeded", runnable.kind);
                match &runnable.location {
                    Some(location) => TestError::at(message, location.clone()),
                    None => TestError::new(message),
                }
            }
            None => TestError::new(format!("Timeout of {timeout_ms}ms exceeded")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    fn test_runnable() -> RunnableDescription {
        RunnableDescription::new(RunnableKind::Test)
            .with_location(Location::new("spec.rs", 1, 1))
    }

    #[test]
    fn remaining_budget_arithmetic() {
        let mut slot = TimeSlot::new(Duration::from_millis(100));
        slot.elapsed = Duration::from_millis(30);
        assert_eq!(slot.remaining(), Some(Duration::from_millis(70)));
        assert!(TimeSlot::disabled().remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_current_budget() {
        let manager = TimeoutManager::new(Duration::from_millis(50));
        manager.set_runnable(test_runnable());
        manager.expired().await;
        let error = manager.timeout_error();
        assert!(error.message.contains("test timeout of 50ms"), "{}", error.message);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_triples_current_budget() {
        let manager = TimeoutManager::new(Duration::from_millis(100));
        manager.slow();
        assert_eq!(manager.current_timeout(), Some(Duration::from_millis(300)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sentinel_stays_disabled() {
        let manager = TimeoutManager::new(Duration::ZERO);
        manager.set_timeout(Duration::from_millis(10));
        assert_eq!(manager.current_timeout(), None);
        manager.slow();
        assert_eq!(manager.current_timeout(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn fixture_slot_does_not_consume_test_budget() {
        let manager = TimeoutManager::new(Duration::from_millis(1000));
        manager.set_runnable(test_runnable());
        advance(Duration::from_millis(100)).await;

        // Entering a fixture with its own slot snapshots the test slot.
        manager.set_current_fixture(Some(FixtureDescription {
            title: "fixture \"db\" setup".to_string(),
            location: Location::new("db.rs", 1, 1),
            slot: Some(shared_slot(Duration::from_millis(500))),
        }));
        advance(Duration::from_millis(200)).await;
        manager.set_current_fixture(None);
        advance(Duration::from_millis(50)).await;
        manager.clear_runnable();

        let default = manager.default_slot();
        let elapsed = default.lock().unwrap().elapsed;
        assert_eq!(elapsed, Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn fixture_with_own_slot_names_the_fixture_on_expiry() {
        let manager = TimeoutManager::new(Duration::from_millis(1000));
        manager.set_runnable(test_runnable());
        manager.set_current_fixture(Some(FixtureDescription {
            title: "fixture \"server\" setup".to_string(),
            location: Location::new("server.rs", 7, 1),
            slot: Some(shared_slot(Duration::from_millis(20))),
        }));
        manager.expired().await;
        let error = manager.timeout_error();
        assert!(error.message.contains("fixture \"server\" setup"), "{}", error.message);
        assert_eq!(error.location, Some(Location::new("server.rs", 7, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn unarmed_or_disabled_countdown_stays_pending() {
        use tokio_test::{assert_pending, task};

        // No runnable: nothing is billed, nothing can expire.
        let manager = TimeoutManager::new(Duration::from_millis(50));
        let mut expired = task::spawn(manager.expired());
        assert_pending!(expired.poll());
        advance(Duration::from_secs(60)).await;
        assert_pending!(expired.poll());
        drop(expired);

        // The zero sentinel never arms the deadline even with a runnable.
        let disabled = TimeoutManager::new(Duration::ZERO);
        disabled.set_runnable(test_runnable());
        let mut expired = task::spawn(disabled.expired());
        assert_pending!(expired.poll());
        advance(Duration::from_secs(60)).await;
        assert_pending!(expired.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn rearms_when_budget_is_extended_mid_wait() {
        let manager = Arc::new(TimeoutManager::new(Duration::from_millis(100)));
        manager.set_runnable(test_runnable());
        let started = Instant::now();

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.expired().await;
                Instant::now()
            })
        };
        advance(Duration::from_millis(50)).await;
        manager.set_timeout(Duration::from_millis(400));
        let fired_at = waiter.await.expect("waiter task");
        // The original 100ms deadline must not have fired.
        assert!(fired_at - started >= Duration::from_millis(300));
    }
}
