//! Fixture engine
//!
//! Declaration, pool construction and runtime instantiation of
//! dependency-injected fixtures.

pub mod registration;
pub mod runner;

pub use registration::{
    FixtureDecl, FixtureOptions, FixturePool, FixtureRegistration, FixtureScope, FixtureSource,
    RegistrationId, RegistrationIds,
};
pub use runner::{
    FixtureContext, FixtureFactory, FixtureParams, FixtureRunner, FixtureValue, ProvideHandle,
};
