//! Dependency graph of execution units.
//!
//! Built once from a plan, validated (unique ids, known dependencies, no
//! cycles), then mutated only through status transitions.

pub mod dag;
pub mod unit;

pub use dag::{DependencyGraph, UnitOutcome};
pub use unit::ExecutionUnit;
