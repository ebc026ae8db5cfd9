pub mod crd;
pub mod error;

pub use error::ReconcileError;

/// Comma-separated list of canonical label selectors which match the
/// RiverMQ Operator's labelling scheme.
pub const RIVERMQ_OPERATOR_LABEL_SELECTORS: &str = "app=rivermq,rivermq.io/controlled-by=rivermq-operator";
