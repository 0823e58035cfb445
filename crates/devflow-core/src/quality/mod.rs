//! Quality gates for generated artifacts.
//!
//! - `gate` -- the `QualityGate` trait
//! - `gates` -- built-in syntax, security, style and coverage gates
//! - `pipeline` -- ordered evaluation, short-circuit and verdict routing

pub mod gate;
pub mod gates;
pub mod pipeline;

pub use gate::{GateScore, QualityGate};
pub use pipeline::QualityPipeline;
