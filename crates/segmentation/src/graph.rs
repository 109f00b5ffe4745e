//! Validated segment graph — an arena of nodes keyed by id, checked for
//! resolvability and acyclicity once at registration so traversal never
//! chases a dangling reference.

use std::collections::HashMap;

use pulse_core::{PulseError, PulseResult};

use crate::definition::{SegmentDefinition, SegmentNode};

/// A segment definition whose id references have been resolved and checked.
#[derive(Debug, Clone)]
pub struct SegmentGraph {
    entry: SegmentNode,
    nodes: HashMap<String, SegmentNode>,
}

impl SegmentGraph {
    /// Builds the arena and rejects definitions with duplicate ids, dangling
    /// child references, or cycles.
    pub fn build(definition: &SegmentDefinition) -> PulseResult<Self> {
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            if nodes.insert(node.id().to_string(), node.clone()).is_some() {
                return Err(PulseError::Definition(format!(
                    "duplicate segment node id {}",
                    node.id()
                )));
            }
        }

        let graph = Self {
            entry: definition.entry_node.clone(),
            nodes,
        };

        for referenced in graph.entry.child_ids() {
            graph.check_resolvable(referenced)?;
        }
        for node in graph.nodes.values() {
            for referenced in node.child_ids() {
                graph.check_resolvable(referenced)?;
            }
        }
        graph.check_acyclic()?;

        Ok(graph)
    }

    pub fn entry(&self) -> &SegmentNode {
        &self.entry
    }

    /// Resolves a child id. A miss is a definition error, not a non-match.
    pub fn node(&self, id: &str) -> PulseResult<&SegmentNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| PulseError::Definition(format!("unknown segment node id {id}")))
    }

    fn check_resolvable(&self, id: &str) -> PulseResult<()> {
        if self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(PulseError::Definition(format!(
                "segment node references unknown child id {id}"
            )))
        }
    }

    /// Depth-first search with an explicit recursion stack; a node on the
    /// stack reached again means the definition references itself.
    fn check_acyclic(&self) -> PulseResult<()> {
        let mut visited = std::collections::HashSet::new();
        let mut stack = Vec::new();
        self.visit(&self.entry, &mut visited, &mut stack)?;
        for node in self.nodes.values() {
            self.visit(node, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        node: &'a SegmentNode,
        visited: &mut std::collections::HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> PulseResult<()> {
        let id = node.id();
        if stack.contains(&id) {
            return Err(PulseError::Definition(format!(
                "segment node {id} transitively references itself"
            )));
        }
        if !visited.insert(id) {
            return Ok(());
        }
        stack.push(id);
        for child in node.child_ids() {
            self.visit(self.node(child)?, visited, stack)?;
        }
        stack.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::SegmentOperator;

    fn trait_node(id: &str) -> SegmentNode {
        SegmentNode::Trait {
            id: id.into(),
            path: "plan".into(),
            operator: SegmentOperator::Exists,
        }
    }

    #[test]
    fn test_build_valid_graph() {
        let def = SegmentDefinition {
            entry_node: SegmentNode::And {
                id: "root".into(),
                children: vec!["a".into(), "b".into()],
            },
            nodes: vec![trait_node("a"), trait_node("b")],
        };
        let graph = SegmentGraph::build(&def).unwrap();
        assert_eq!(graph.node("a").unwrap().id(), "a");
    }

    #[test]
    fn test_dangling_child_is_rejected() {
        let def = SegmentDefinition {
            entry_node: SegmentNode::And {
                id: "root".into(),
                children: vec!["missing".into()],
            },
            nodes: vec![],
        };
        let err = SegmentGraph::build(&def).unwrap_err();
        assert!(matches!(err, PulseError::Definition(_)));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let def = SegmentDefinition {
            entry_node: SegmentNode::Or {
                id: "root".into(),
                children: vec!["a".into()],
            },
            nodes: vec![trait_node("a"), trait_node("a")],
        };
        assert!(SegmentGraph::build(&def).is_err());
    }

    #[test]
    fn test_cycle_is_rejected() {
        let def = SegmentDefinition {
            entry_node: SegmentNode::And {
                id: "root".into(),
                children: vec!["a".into()],
            },
            nodes: vec![
                SegmentNode::Or {
                    id: "a".into(),
                    children: vec!["b".into()],
                },
                SegmentNode::And {
                    id: "b".into(),
                    children: vec!["a".into()],
                },
            ],
        };
        let err = SegmentGraph::build(&def).unwrap_err();
        assert!(err.to_string().contains("references itself"));
    }
}
