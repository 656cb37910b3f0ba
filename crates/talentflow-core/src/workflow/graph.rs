//! Step graph and the immutable, validated form of a definition.
//!
//! Uses `petgraph` to model every routing edge a step can take (`next`,
//! decision branches, parallel branches, escalation routes). The graph is
//! built once when a definition is activated; instances only ever see a
//! `ValidatedDefinition`, so a dangling target can never surface mid-run.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use talentflow_types::workflow::{Step, StepKind, WorkflowDefinition};

use super::definition::{WorkflowError, validate_definition};

/// Directed graph of step ids. Parallel edges between the same pair are
/// collapsed, so in-degree counts distinct predecessors.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    /// Build the graph. Edges to unknown ids are skipped; callers that care
    /// run `validate_definition` first.
    pub fn from_definition(def: &WorkflowDefinition) -> Self {
        let mut graph = DiGraph::<String, ()>::new();
        let mut index = HashMap::new();
        for step in &def.steps {
            let idx = graph.add_node(step.id.clone());
            index.entry(step.id.clone()).or_insert(idx);
        }
        for step in &def.steps {
            let from = index[&step.id];
            for target in step.edges() {
                if let Some(&to) = index.get(&target) {
                    graph.update_edge(from, to, ());
                }
            }
        }
        Self { graph, index }
    }

    /// Number of distinct steps with an edge into `step_id`.
    pub fn fan_in(&self, step_id: &str) -> usize {
        self.index
            .get(step_id)
            .map(|&idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .unwrap_or(0)
    }

    /// Distinct predecessors of `step_id`, sorted.
    pub fn predecessors(&self, step_id: &str) -> Vec<String> {
        let Some(&idx) = self.index.get(step_id) else {
            return Vec::new();
        };
        let mut preds: Vec<String> = self
            .graph
            .neighbors_directed(idx, Direction::Incoming)
            .map(|n| self.graph[n].clone())
            .collect();
        preds.sort();
        preds
    }

    /// Whether `to` can be reached from `from` along routing edges.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// ValidatedDefinition
// ---------------------------------------------------------------------------

/// A definition that passed validation, with its graph precomputed.
///
/// Immutable once built; the engine shares it across instances behind an `Arc`.
#[derive(Debug, Clone)]
pub struct ValidatedDefinition {
    def: WorkflowDefinition,
    graph: WorkflowGraph,
    positions: HashMap<String, usize>,
    start: usize,
}

impl ValidatedDefinition {
    pub fn new(def: WorkflowDefinition) -> Result<Self, WorkflowError> {
        validate_definition(&def)?;
        let graph = WorkflowGraph::from_definition(&def);
        let positions: HashMap<String, usize> = def
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let start = def
            .steps
            .iter()
            .position(|s| s.kind() == StepKind::Start)
            .unwrap_or_default();
        Ok(Self {
            def,
            graph,
            positions,
            start,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.def
    }

    pub fn id(&self) -> uuid::Uuid {
        self.def.id
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn start(&self) -> &Step {
        &self.def.steps[self.start]
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.positions.get(id).map(|&i| &self.def.steps[i])
    }

    /// Merge steps with their expected arrival counts.
    pub fn merges(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.def
            .steps
            .iter()
            .filter(|s| s.kind() == StepKind::Merge)
            .map(|s| (s.id.as_str(), self.graph.fan_in(&s.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use talentflow_types::workflow::{DecisionRule, StepConfig};
    use uuid::Uuid;

    fn step(id: &str, config: StepConfig, next: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            config,
            next: next.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition {
            id: Uuid::now_v7(),
            name: "diamond".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            triggers: vec![],
            variables: serde_json::Map::new(),
            steps: vec![
                step("start", StepConfig::Start, &["route"]),
                step(
                    "route",
                    StepConfig::Decision {
                        rules: vec![
                            DecisionRule { when: "{{amount}} > 100".into(), next: "big".into() },
                            DecisionRule { when: "{{amount}} > 50".into(), next: "big".into() },
                        ],
                        default: Some("small".into()),
                    },
                    &[],
                ),
                step("big", StepConfig::Merge, &["join"]),
                step("small", StepConfig::Merge, &["join"]),
                step("join", StepConfig::Merge, &["end"]),
                step("end", StepConfig::End, &[]),
            ],
            metadata: Map::new(),
        }
    }

    #[test]
    fn test_fan_in_counts_distinct_predecessors() {
        let graph = WorkflowGraph::from_definition(&diamond());
        // Two rules pointing at "big" are one predecessor edge.
        assert_eq!(graph.fan_in("big"), 1);
        assert_eq!(graph.fan_in("join"), 2);
        assert_eq!(graph.predecessors("join"), vec!["big", "small"]);
        assert_eq!(graph.fan_in("unknown"), 0);
    }

    #[test]
    fn test_has_path() {
        let graph = WorkflowGraph::from_definition(&diamond());
        assert!(graph.has_path("start", "end"));
        assert!(!graph.has_path("end", "start"));
        assert!(!graph.has_path("start", "missing"));
    }

    #[test]
    fn test_validated_definition_lookup() {
        let notify = || StepConfig::Notification {
            channel: "email".into(),
            recipients: vec!["hr@example.com".into()],
            template: "hello".into(),
            data: serde_json::Value::Null,
            output_key: None,
        };
        let mut def = diamond();
        def.steps = vec![
            step("start", StepConfig::Start, &["fork"]),
            step(
                "fork",
                StepConfig::Parallel {
                    branches: vec!["laptop".into(), "badge".into()],
                },
                &[],
            ),
            step("laptop", notify(), &["join"]),
            step("badge", notify(), &["join"]),
            step("join", StepConfig::Merge, &["end"]),
            step("end", StepConfig::End, &[]),
        ];
        let validated = ValidatedDefinition::new(def).expect("should validate");
        assert_eq!(validated.start().id, "start");
        assert_eq!(validated.step("join").map(|s| s.kind()), Some(StepKind::Merge));
        assert!(validated.step("nope").is_none());
        let merges: Vec<_> = validated.merges().collect();
        assert_eq!(merges, vec![("join", 2)]);
        assert_eq!(validated.graph().predecessors("join"), vec!["badge", "laptop"]);
    }

    #[test]
    fn test_validated_definition_rejects_invalid() {
        // "big" and "small" are merges with a single predecessor each.
        assert!(ValidatedDefinition::new(diamond()).is_err());
    }
}
