use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use overseer_core::config::expand_env_vars;
use overseer_core::error::{OverseerError, Result};

use crate::graph::{Edge, GuardRule, WorkflowGraph};
use crate::step::{CommandStep, StepRegistry};

/// A workflow definition file.
///
/// ```toml
/// name = "release"
/// start = "build"
///
/// [[nodes]]
/// name = "build"
/// command = "make"
/// args = ["all"]
///
/// [[edges]]
/// from = "build"
/// to = "publish"
/// condition = "build_ok"
///
/// [[guards]]
/// name = "build_ok"
/// key = "build_ok"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    pub name: String,
    pub start: String,
    #[serde(default)]
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Flag guards added on top of the built-in ones.
    #[serde(default)]
    pub guards: Vec<GuardDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Substitute command tried by recovery once retries are exhausted.
    #[serde(default)]
    pub alternative: Option<CommandDef>,
    /// Result used when recovery falls back.
    #[serde(default)]
    pub fallback_result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDef {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A guard reading one boolean flag from the state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardDef {
    pub name: String,
    pub key: String,
    /// Value used when the key is absent.
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub negate: bool,
}

impl GuardDef {
    fn rule(&self) -> GuardRule {
        if self.negate {
            GuardRule::not_flag(&self.key, self.default)
        } else {
            GuardRule::flag(&self.key, self.default)
        }
    }
}

impl WorkflowFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| OverseerError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded)
            .map_err(|e| OverseerError::Config(format!("invalid workflow file: {}", e)))
    }

    /// Build the graph and a registry of command steps. Structural checks
    /// (start node, edge ends, guard names) are left to the executor.
    pub fn build(&self) -> Result<(WorkflowGraph, StepRegistry)> {
        let mut graph = WorkflowGraph::new();
        let mut steps = StepRegistry::new();
        let mut seen = HashSet::new();

        for guard in &self.guards {
            graph.register_guard(&guard.name, guard.rule());
        }

        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(OverseerError::Config(format!(
                    "duplicate node '{}' in workflow '{}'",
                    node.name, self.name
                )));
            }
            graph.add_node(&node.name);

            let timeout = node.timeout_secs.map(Duration::from_secs);
            let primary = command_step(&node.name, &node.command, &node.args, timeout, node.working_dir.as_ref());
            steps.register(&node.name, Arc::new(primary));

            if let Some(alt) = &node.alternative {
                let name = format!("{}_fallback", node.name);
                let step = command_step(&name, &alt.command, &alt.args, timeout, node.working_dir.as_ref());
                steps.register_alternative(&node.name, Arc::new(step));
            }
            if let Some(result) = &node.fallback_result {
                steps.set_fallback_result(&node.name, result.clone());
            }
        }

        for edge in &self.edges {
            graph.add_edge(&edge.from, &edge.to, &edge.condition);
        }
        graph.set_start(&self.start);

        Ok((graph, steps))
    }
}

fn command_step(
    name: &str,
    command: &str,
    args: &[String],
    timeout: Option<Duration>,
    working_dir: Option<&PathBuf>,
) -> CommandStep {
    let mut step = CommandStep::new(name, command, args.to_vec());
    if let Some(timeout) = timeout {
        step = step.with_timeout(timeout);
    }
    if let Some(dir) = working_dir {
        step = step.with_working_dir(dir);
    }
    step
}
