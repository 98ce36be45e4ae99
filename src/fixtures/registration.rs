//! Fixture registration and pool construction
//!
//! Builds the resolved set of fixture registrations visible to a test,
//! validates the dependency graph and computes the worker-reuse digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConfigError, Location};

use super::runner::{FixtureFactory, FixtureValue};

/// Fixture instance lifetime class
///
/// `Test` instances live for one attempt, `Worker` instances for one worker
/// process, `Global` instances for the whole run. A fixture may only depend
/// on fixtures of equal or wider scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    Test,
    Worker,
    Global,
}

impl FixtureScope {
    /// Narrower scopes order before wider ones.
    pub fn order(self) -> u8 {
        match self {
            FixtureScope::Test => 0,
            FixtureScope::Worker => 1,
            FixtureScope::Global => 2,
        }
    }
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureScope::Test => write!(f, "test"),
            FixtureScope::Worker => write!(f, "worker"),
            FixtureScope::Global => write!(f, "global"),
        }
    }
}

/// Stable identity of a registration, used for instance memoization and
/// the worker digest.
pub type RegistrationId = u64;

/// Allocator for registration ids
///
/// Owned by whoever builds pools (one per loading pass), so that pools
/// sharing a parent also share the ids of inherited registrations.
#[derive(Debug, Default)]
pub struct RegistrationIds {
    next: RegistrationId,
}

impl RegistrationIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> RegistrationId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Either a ready-made value or a factory that produces one
#[derive(Clone)]
pub enum FixtureSource {
    Value(FixtureValue),
    Factory(FixtureFactory),
}

impl fmt::Debug for FixtureSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureSource::Value(_) => write!(f, "FixtureSource::Value"),
            FixtureSource::Factory(_) => write!(f, "FixtureSource::Factory"),
        }
    }
}

/// Options attached to a fixture declaration
#[derive(Clone, Copy, Debug)]
pub struct FixtureOptions {
    pub scope: FixtureScope,
    pub auto: bool,
    pub option: bool,
    pub timeout: Option<Duration>,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            scope: FixtureScope::Test,
            auto: false,
            option: false,
            timeout: None,
        }
    }
}

impl FixtureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, scope: FixtureScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn auto(mut self, auto: bool) -> Self {
        self.auto = auto;
        self
    }

    pub fn option(mut self, option: bool) -> Self {
        self.option = option;
        self
    }

    /// A fixture with its own timeout does not consume the test's budget.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One fixture declaration as produced by the loader
///
/// Dependency names are declared explicitly; they are never inferred from
/// the factory itself.
#[derive(Clone)]
pub struct FixtureDecl {
    pub name: String,
    pub source: FixtureSource,
    pub options: Option<FixtureOptions>,
    pub deps: Vec<String>,
    pub location: Location,
}

impl FixtureDecl {
    /// Declare a fixture backed by a two-phase factory.
    pub fn factory<F, Fut>(name: impl Into<String>, deps: &[&str], location: Location, f: F) -> Self
    where
        F: Fn(super::runner::FixtureParams, super::runner::ProvideHandle) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            source: FixtureSource::Factory(Arc::new(move |params, handle| {
                Box::pin(f(params, handle))
            })),
            options: None,
            deps: deps.iter().map(|d| (*d).to_string()).collect(),
            location,
        }
    }

    /// Declare a fixture backed by a static value.
    pub fn value<T: std::any::Any + Send + Sync>(
        name: impl Into<String>,
        location: Location,
        value: T,
    ) -> Self {
        Self {
            name: name.into(),
            source: FixtureSource::Value(Arc::new(value)),
            options: None,
            deps: Vec::new(),
            location,
        }
    }

    pub fn with_options(mut self, options: FixtureOptions) -> Self {
        self.options = Some(options);
        self
    }
}

impl fmt::Debug for FixtureDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureDecl")
            .field("name", &self.name)
            .field("deps", &self.deps)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// A declared fixture after pool merging, immutable once built
pub struct FixtureRegistration {
    pub id: RegistrationId,
    pub name: String,
    pub scope: FixtureScope,
    pub source: FixtureSource,
    pub auto: bool,
    pub option: bool,
    pub timeout: Option<Duration>,
    pub deps: Vec<String>,
    pub location: Location,
    /// The registration this one overrides, if any. An override that lists
    /// its own name as a dependency resolves it to this previous version.
    pub super_reg: Option<Arc<FixtureRegistration>>,
}

impl fmt::Debug for FixtureRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("auto", &self.auto)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// The resolved set of registrations visible to a test
///
/// The digest hashes the ids of all worker-scope registrations (sorted by
/// name); two pools with equal digests may share a worker process.
#[derive(Debug)]
pub struct FixturePool {
    registrations: HashMap<String, Arc<FixtureRegistration>>,
    pub digest: String,
}

impl FixturePool {
    /// Merge declaration lists on top of an optional parent pool and
    /// validate the result.
    ///
    /// Re-declaring a name without explicit options inherits the previous
    /// scope/auto/option; re-declaring with a conflicting scope or auto
    /// flag is a configuration error.
    pub fn build(
        sets: &[Vec<FixtureDecl>],
        ids: &mut RegistrationIds,
        parent: Option<&FixturePool>,
        disallow_worker_scope: bool,
    ) -> Result<FixturePool, ConfigError> {
        let mut registrations: HashMap<String, Arc<FixtureRegistration>> = parent
            .map(|p| p.registrations.clone())
            .unwrap_or_default();

        for set in sets {
            for decl in set {
                let previous = registrations.get(&decl.name).cloned();
                let options = match (&previous, &decl.options) {
                    (Some(prev), Some(opts)) => {
                        if prev.scope != opts.scope {
                            return Err(ConfigError::new(
                                format!(
                                    "fixture \"{}\" has already been registered with scope \"{}\" at {}",
                                    decl.name, prev.scope, prev.location
                                ),
                                decl.location.clone(),
                            ));
                        }
                        if prev.auto != opts.auto {
                            return Err(ConfigError::new(
                                format!(
                                    "fixture \"{}\" has already been registered with auto = {} at {}",
                                    decl.name, prev.auto, prev.location
                                ),
                                decl.location.clone(),
                            ));
                        }
                        *opts
                    }
                    (Some(prev), None) => FixtureOptions {
                        scope: prev.scope,
                        auto: prev.auto,
                        option: prev.option,
                        timeout: prev.timeout,
                    },
                    (None, Some(opts)) => *opts,
                    (None, None) => FixtureOptions::default(),
                };

                if options.scope != FixtureScope::Test && disallow_worker_scope {
                    return Err(ConfigError::new(
                        format!(
                            "cannot register {}-scope fixture \"{}\" here: it would force a new worker",
                            options.scope, decl.name
                        ),
                        decl.location.clone(),
                    ));
                }

                let registration = Arc::new(FixtureRegistration {
                    id: ids.allocate(),
                    name: decl.name.clone(),
                    scope: options.scope,
                    source: decl.source.clone(),
                    auto: options.auto,
                    option: options.option,
                    timeout: options.timeout,
                    deps: decl.deps.clone(),
                    location: decl.location.clone(),
                    super_reg: previous,
                });
                registrations.insert(decl.name.clone(), registration);
            }
        }

        let digest = Self::validate(&registrations)?;
        Ok(FixturePool {
            registrations,
            digest,
        })
    }

    /// DFS over all registrations: detects cycles, rejects scope
    /// narrowing, and folds worker-scope registration ids into the digest.
    fn validate(
        registrations: &HashMap<String, Arc<FixtureRegistration>>,
    ) -> Result<String, ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Visited,
        }

        fn visit(
            reg: &Arc<FixtureRegistration>,
            registrations: &HashMap<String, Arc<FixtureRegistration>>,
            markers: &mut HashMap<RegistrationId, Mark>,
            stack: &mut Vec<Arc<FixtureRegistration>>,
        ) -> Result<(), ConfigError> {
            markers.insert(reg.id, Mark::Visiting);
            stack.push(reg.clone());
            for name in &reg.deps {
                let dep = resolve_in(registrations, name, Some(reg)).ok_or_else(|| {
                    let message = if name == &reg.name {
                        format!(
                            "fixture \"{}\" references itself, but has no previous registration",
                            reg.name
                        )
                    } else {
                        format!("fixture \"{}\" has unknown dependency \"{name}\"", reg.name)
                    };
                    ConfigError::new(message, reg.location.clone())
                })?;
                if dep.scope.order() < reg.scope.order() {
                    return Err(ConfigError::new(
                        format!(
                            "{} fixture \"{}\" cannot depend on a {} fixture \"{}\" defined at {}",
                            reg.scope, reg.name, dep.scope, name, dep.location
                        ),
                        reg.location.clone(),
                    ));
                }
                match markers.get(&dep.id) {
                    None => visit(&dep, registrations, markers, stack)?,
                    Some(Mark::Visiting) => {
                        let index = stack.iter().position(|r| r.id == dep.id).unwrap_or(0);
                        let names: Vec<String> = stack[index..]
                            .iter()
                            .map(|r| format!("\"{}\"", r.name))
                            .collect();
                        return Err(ConfigError::new(
                            format!(
                                "fixtures {} -> \"{}\" form a dependency cycle",
                                names.join(" -> "),
                                dep.name
                            ),
                            dep.location.clone(),
                        ));
                    }
                    Some(Mark::Visited) => {}
                }
            }
            markers.insert(reg.id, Mark::Visited);
            stack.pop();
            Ok(())
        }

        let mut markers = HashMap::new();
        let mut stack = Vec::new();
        let mut names: Vec<&String> = registrations.keys().collect();
        names.sort();

        let mut hasher = Sha256::new();
        for name in names {
            let registration = &registrations[name];
            if !markers.contains_key(&registration.id) {
                visit(registration, registrations, &mut markers, &mut stack)?;
            }
            if registration.scope == FixtureScope::Worker {
                hasher.update(registration.id.to_le_bytes());
                hasher.update(b";");
            }
        }
        Ok(hex_digest(&hasher.finalize()))
    }

    /// Look up a registration, resolving an override's own name to its
    /// previous version.
    pub fn resolve(
        &self,
        name: &str,
        for_registration: Option<&FixtureRegistration>,
    ) -> Option<Arc<FixtureRegistration>> {
        if let Some(reg) = for_registration {
            if reg.name == name {
                return reg.super_reg.clone();
            }
        }
        self.registrations.get(name).cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FixtureRegistration>> {
        self.registrations.get(name).cloned()
    }

    /// Auto fixtures, in name order for determinism.
    pub fn auto_registrations(&self) -> Vec<Arc<FixtureRegistration>> {
        let mut autos: Vec<Arc<FixtureRegistration>> = self
            .registrations
            .values()
            .filter(|r| r.auto)
            .cloned()
            .collect();
        autos.sort_by(|a, b| a.name.cmp(&b.name));
        autos
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

fn resolve_in(
    registrations: &HashMap<String, Arc<FixtureRegistration>>,
    name: &str,
    for_registration: Option<&FixtureRegistration>,
) -> Option<Arc<FixtureRegistration>> {
    if let Some(reg) = for_registration {
        if reg.name == name {
            return reg.super_reg.clone();
        }
    }
    registrations.get(name).cloned()
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(line: u32) -> Location {
        Location::new("fixtures.rs", line, 1)
    }

    fn noop(name: &str, deps: &[&str], line: u32) -> FixtureDecl {
        FixtureDecl::factory(name, deps, loc(line), |_params, mut handle| async move {
            handle.provide(()).await
        })
    }

    fn build(sets: &[Vec<FixtureDecl>]) -> Result<FixturePool, ConfigError> {
        let mut ids = RegistrationIds::new();
        FixturePool::build(sets, &mut ids, None, false)
    }

    #[test]
    fn cycle_detection_names_both_fixtures() {
        let result = build(&[vec![noop("a", &["b"], 1), noop("b", &["a"], 2)]]);
        let error = result.unwrap_err();
        assert!(error.message.contains("\"a\""), "{}", error.message);
        assert!(error.message.contains("\"b\""), "{}", error.message);
        assert!(error.message.contains("dependency cycle"), "{}", error.message);
    }

    #[test]
    fn worker_fixture_cannot_depend_on_test_fixture() {
        let result = build(&[vec![
            noop("narrow", &[], 1),
            noop("wide", &["narrow"], 2)
                .with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
        ]]);
        let error = result.unwrap_err();
        assert!(error.message.contains("worker fixture \"wide\""), "{}", error.message);
        assert!(error.message.contains("test fixture \"narrow\""), "{}", error.message);
    }

    #[test]
    fn test_fixture_may_depend_on_worker_fixture() {
        let pool = build(&[vec![
            noop("wide", &[], 1).with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
            noop("narrow", &["wide"], 2),
        ]])
        .unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn global_fixture_cannot_depend_on_worker_fixture() {
        let result = build(&[vec![
            noop("w", &[], 1).with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
            noop("g", &["w"], 2).with_options(FixtureOptions::new().scope(FixtureScope::Global)),
        ]]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_dependency_is_a_config_error() {
        let error = build(&[vec![noop("a", &["missing"], 1)]]).unwrap_err();
        assert!(error.message.contains("unknown dependency \"missing\""));
        assert_eq!(error.location, loc(1));
    }

    #[test]
    fn self_reference_without_base_is_a_config_error() {
        let error = build(&[vec![noop("a", &["a"], 1)]]).unwrap_err();
        assert!(error.message.contains("references itself"));
    }

    #[test]
    fn override_resolves_own_name_to_previous_version() {
        let pool = build(&[
            vec![noop("a", &[], 1)],
            vec![noop("a", &["a"], 2)],
        ])
        .unwrap();
        let reg = pool.get("a").unwrap();
        let base = pool.resolve("a", Some(&reg)).unwrap();
        assert_eq!(base.location, loc(1));
    }

    #[test]
    fn redeclaration_without_options_inherits_scope_and_auto() {
        let pool = build(&[
            vec![noop("a", &[], 1)
                .with_options(FixtureOptions::new().scope(FixtureScope::Worker).auto(true))],
            vec![noop("a", &[], 2)],
        ])
        .unwrap();
        let reg = pool.get("a").unwrap();
        assert_eq!(reg.scope, FixtureScope::Worker);
        assert!(reg.auto);
    }

    #[test]
    fn redeclaration_with_conflicting_scope_fails() {
        let result = build(&[
            vec![noop("a", &[], 1).with_options(FixtureOptions::new().scope(FixtureScope::Worker))],
            vec![noop("a", &[], 2).with_options(FixtureOptions::new().scope(FixtureScope::Test))],
        ]);
        let error = result.unwrap_err();
        assert!(error.message.contains("already been registered with scope"));
    }

    #[test]
    fn disallowed_worker_scope_fails_construction() {
        let mut ids = RegistrationIds::new();
        let sets = vec![vec![
            noop("w", &[], 1).with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
        ]];
        let result = FixturePool::build(&sets, &mut ids, None, true);
        assert!(result.unwrap_err().message.contains("force a new worker"));
    }

    #[test]
    fn digest_covers_worker_scope_registrations_only() {
        let mut ids = RegistrationIds::new();
        let base = FixturePool::build(
            &[vec![
                noop("w", &[], 1).with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
                noop("t", &[], 2),
            ]],
            &mut ids,
            None,
            false,
        )
        .unwrap();

        // Adding a test-scope fixture on top keeps the digest.
        let derived = FixturePool::build(&[vec![noop("t2", &[], 3)]], &mut ids, Some(&base), false)
            .unwrap();
        assert_eq!(base.digest, derived.digest);

        // Adding a worker-scope fixture changes it.
        let changed = FixturePool::build(
            &[vec![
                noop("w2", &[], 4).with_options(FixtureOptions::new().scope(FixtureScope::Worker)),
            ]],
            &mut ids,
            Some(&base),
            false,
        )
        .unwrap();
        assert_ne!(base.digest, changed.digest);
    }
}
