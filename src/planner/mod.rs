//! Planning module.
//!
//! This module compares desired descriptors with applied records and produces
//! an ordered plan of operations.

mod builder;
mod plan;

pub use builder::PlanBuilder;
pub use plan::{Action, Operation, Plan, PlanSummary};
