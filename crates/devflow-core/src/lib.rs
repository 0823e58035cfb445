//! Workflow execution core for devflow.
//!
//! This crate holds the engine and everything it composes: the variable
//! resolver, circuit breakers and rate limiters, the budget enforcer, the
//! quality gate pipeline, capability traits and the run repository port.
//! It depends only on `devflow-types` -- never on `devflow-infra` or any
//! database or network crate.

pub mod budget;
pub mod capability;
pub mod event;
pub mod guard;
pub mod quality;
pub mod repository;
pub mod workflow;
