//! Repository trait definitions (ports).
//!
//! The infrastructure layer (devflow-infra) implements these traits with
//! SQLite. The core crate ships an in-memory implementation for tests and
//! embedded use, and never depends on a specific storage technology.

pub mod memory;
pub mod run;

pub use memory::InMemoryRunRepository;
pub use run::RunRepository;
