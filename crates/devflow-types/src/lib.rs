//! Shared domain types for devflow.
//!
//! This crate holds the types every other devflow crate speaks: the workflow
//! document and its typed definition, run and step results, budget, quality,
//! event and configuration types, and the shared repository error.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod budget;
pub mod config;
pub mod error;
pub mod event;
pub mod quality;
pub mod run;
pub mod workflow;
