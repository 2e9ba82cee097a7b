use serde::{Deserialize, Serialize};

/// A directed edge whose traversal is gated by a named guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    /// Guard name looked up in the graph's guard registry.
    #[serde(default = "default_condition")]
    pub condition: String,
}

fn default_condition() -> String {
    "always".to_string()
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: condition.into(),
        }
    }

    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(from, to, default_condition())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = Edge::always("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to, "b");
        assert_eq!(e.condition, "always");

        let e = Edge::new("analysis", "decision", "analysis_complete");
        assert_eq!(e.condition, "analysis_complete");
    }

    #[test]
    fn test_condition_defaults_to_always() {
        let e: Edge = toml::from_str("from = \"a\"\nto = \"b\"\n").unwrap();
        assert_eq!(e.condition, "always");
    }
}
