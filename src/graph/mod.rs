//! Component dependency graph.
//!
//! - `builder`: validates a plan and builds the [`ComponentGraph`]
//! - `schedule`: execution mode selection and the group/chain partition

pub mod builder;
pub mod schedule;

pub use builder::{ComponentGraph, ComponentIndex, GraphBuilder};
pub use schedule::{ExecutionMode, ModeRequest};
