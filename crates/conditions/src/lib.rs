//! Kready conditions (Milestone 1): per-kind readiness catalog, snapshot evaluator
//! and dependent resolution. Everything here is synchronous and side-effect free.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod dependents;
pub mod evaluate;
pub mod path;
pub mod rule;

pub use catalog::Catalog;
pub use dependents::{dependents, DependentRef};
pub use evaluate::{container_problems, evaluate, Evaluation, CONTAINERS, OBSERVED_GENERATION};
pub use path::FieldPath;
pub use rule::{AwaitSpec, ConditionRule, DependentRule, FailRule, GenerationReq, Link, Operand, Predicate, Timeouts};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid field path '{path}': {reason}")]
    BadPath { path: String, reason: String },
    #[error("{kind}: field path '{path}' not in schema (at '{segment}')")]
    UnknownField { kind: String, path: String, segment: String },
    #[error("duplicate catalog entry for {0}")]
    DuplicateKind(String),
    #[error("catalog load: {0}")]
    Load(String),
}
