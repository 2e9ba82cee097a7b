//! Workflow graph and its executor.
//!
//! A workflow is a directed graph of named nodes, each bound to a registered
//! [`Step`](overseer_core::traits::Step). Edges carry a named guard evaluated
//! against the shared [`WorkflowState`](overseer_core::types::WorkflowState).
//!
//! The [`Executor`] walks the graph breadth-first: every iteration runs the
//! current ready set, merges results into the state, then collects the
//! targets of satisfied edges as the next ready set.

pub mod edge;
pub mod executor;
pub mod guard;
pub mod node;
pub mod workflow;

pub use edge::Edge;
pub use executor::{Executor, LogEntry, LogStatus, WorkflowResult};
pub use guard::{GuardRegistry, GuardRule};
pub use node::NodeRecord;
pub use workflow::WorkflowGraph;
