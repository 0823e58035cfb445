//! Infrastructure layer for devflow.
//!
//! Implements the ports defined in `devflow-core`: the SQLite run repository,
//! the HTTP gateway that serves external actions and generation, and the
//! TOML engine configuration loader.

pub mod config;
pub mod gateway;
pub mod sqlite;
