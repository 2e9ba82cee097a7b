use tracing::{debug, warn};

use overseer_core::error::{OverseerError, Result};
use overseer_core::types::WorkflowState;

use super::edge::Edge;
use super::guard::{GuardRegistry, GuardRule};

/// A named-node condition graph with a single start node.
///
/// Nodes keep insertion order; edges are evaluated in insertion order.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    nodes: Vec<String>,
    edges: Vec<Edge>,
    start: Option<String>,
    guards: GuardRegistry,
}

impl WorkflowGraph {
    /// An empty graph using the built-in guards.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_guards(guards: GuardRegistry) -> Self {
        Self {
            guards,
            ..Self::default()
        }
    }

    /// Add a node. Re-adding an existing name is a no-op.
    pub fn add_node(&mut self, name: impl Into<String>) -> &mut Self {
        let name = name.into();
        if !self.has_node(&name) {
            self.nodes.push(name);
        }
        self
    }

    pub fn add_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: impl Into<String>,
    ) -> &mut Self {
        self.edges.push(Edge::new(from, to, condition));
        self
    }

    pub fn set_start(&mut self, name: impl Into<String>) -> &mut Self {
        self.start = Some(name.into());
        self
    }

    pub fn register_guard(&mut self, name: impl Into<String>, rule: GuardRule) -> &mut Self {
        self.guards.register(name, rule);
        self
    }

    pub fn start(&self) -> Option<&str> {
        self.start.as_deref()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn guards(&self) -> &GuardRegistry {
        &self.guards
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n == name)
    }

    /// Evaluate a guard against the state. Unknown guards are false.
    pub fn evaluate_condition(&self, condition: &str, state: &WorkflowState) -> bool {
        match self.guards.evaluate(condition, state) {
            Some(v) => v,
            None => {
                warn!(guard = condition, "Unknown guard condition, treating as false");
                false
            }
        }
    }

    /// Targets of every edge out of `current` whose guard holds, in edge order.
    /// Duplicates are kept.
    pub fn next_nodes(&self, current: &str, state: &WorkflowState) -> Vec<String> {
        let next: Vec<String> = self
            .edges
            .iter()
            .filter(|e| e.from == current && self.evaluate_condition(&e.condition, state))
            .map(|e| e.to.clone())
            .collect();
        debug!(node = current, next = ?next, "Evaluated outgoing edges");
        next
    }

    /// Structural checks run before a workflow starts.
    ///
    /// With `strict_guards`, every edge condition must be a registered guard.
    pub fn validate(&self, strict_guards: bool) -> Result<()> {
        let start = self.start.as_deref().ok_or(OverseerError::MissingStartNode)?;
        if !self.has_node(start) {
            return Err(OverseerError::UnknownNode(start.to_string()));
        }

        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !self.has_node(end) {
                    return Err(OverseerError::UnknownNode(end.clone()));
                }
            }
            if strict_guards && !self.guards.contains(&edge.condition) {
                return Err(OverseerError::UnknownGuard {
                    guard: edge.condition.clone(),
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
            }
        }
        Ok(())
    }
}
