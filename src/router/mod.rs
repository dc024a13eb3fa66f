//! Decision resolution: rules in, one [`RouterDecision`] out.

pub mod decision;
pub mod resolver;

pub use decision::{DecisionParams, RouterAction, RouterDecision};
pub use resolver::{DecisionResolver, NoMatchPolicy};
