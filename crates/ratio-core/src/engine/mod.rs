//! Composite scheduling: execution nodes and the per-instance state machine.

pub mod instance;
pub mod node;

pub use instance::{
    Effect, Instance, InstanceOutcome, InstanceSpec, Invocation, NodeFinished, Target,
};
pub use node::{ChildNode, ExecutionNode, NodeReport, NodeStatus};
