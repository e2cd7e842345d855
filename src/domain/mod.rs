pub mod error;
pub mod evaluation;
pub mod models;
pub mod types;

/// Structural version stamped on every persisted evaluation document.
/// Consumers must accept additive-only evolution within a major version.
pub const EVALUATION_VERSION: &str = "1.0.0";
