//! Built-in quality gates, in pipeline order.

pub mod coverage;
pub mod security;
pub mod style;
pub mod syntax;

pub use coverage::CoverageGate;
pub use security::SecurityGate;
pub use style::StyleGate;
pub use syntax::SyntaxGate;
