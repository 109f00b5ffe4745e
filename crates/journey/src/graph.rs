//! Validated journey graph — an arena of body nodes keyed by id, checked at
//! registration for resolvability, reachability, and acyclicity so every
//! path provably terminates at the exit node.

use std::collections::{HashMap, HashSet};

use pulse_core::{PulseError, PulseResult};

use crate::types::{
    EntryNode, JourneyBodyNode, JourneyDefinition, ENTRY_NODE_ID, EXIT_NODE_ID,
};

#[derive(Debug, Clone)]
pub struct JourneyGraph {
    entry: EntryNode,
    nodes: HashMap<String, JourneyBodyNode>,
}

impl JourneyGraph {
    pub fn build(definition: &JourneyDefinition) -> PulseResult<Self> {
        let mut nodes = HashMap::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            let id = node.id();
            if id == EXIT_NODE_ID || id == ENTRY_NODE_ID {
                return Err(PulseError::Definition(format!(
                    "journey node id {id} is reserved"
                )));
            }
            if node.child_ids().is_empty() {
                return Err(PulseError::Definition(format!(
                    "journey node {id} has no children"
                )));
            }
            check_payload(node)?;
            if nodes.insert(id.to_string(), node.clone()).is_some() {
                return Err(PulseError::Definition(format!(
                    "duplicate journey node id {id}"
                )));
            }
        }

        let graph = Self {
            entry: definition.entry_node.clone(),
            nodes,
        };

        graph.check_child(graph.entry.child())?;
        for node in graph.nodes.values() {
            for child in node.child_ids() {
                graph.check_child(child)?;
            }
        }
        graph.check_reachable_and_acyclic()?;

        Ok(graph)
    }

    pub fn entry(&self) -> &EntryNode {
        &self.entry
    }

    pub fn node(&self, id: &str) -> PulseResult<&JourneyBodyNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| PulseError::Definition(format!("unknown journey node id {id}")))
    }

    fn check_child(&self, id: &str) -> PulseResult<()> {
        if id == EXIT_NODE_ID || self.nodes.contains_key(id) {
            Ok(())
        } else {
            Err(PulseError::Definition(format!(
                "journey node references unknown child id {id}"
            )))
        }
    }

    /// DFS from the entry child. Every body node must be reached, and no
    /// node may sit on its own downstream path; together with resolvable
    /// children this guarantees all paths terminate at the exit.
    fn check_reachable_and_acyclic(&self) -> PulseResult<()> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        self.visit(self.entry.child(), &mut visited, &mut stack)?;

        for id in self.nodes.keys() {
            if !visited.contains(id.as_str()) {
                return Err(PulseError::Definition(format!(
                    "journey node {id} is unreachable from the entry node"
                )));
            }
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> PulseResult<()> {
        if id == EXIT_NODE_ID {
            return Ok(());
        }
        if stack.contains(&id) {
            return Err(PulseError::Definition(format!(
                "journey node {id} is part of a cycle"
            )));
        }
        if !visited.insert(id) {
            return Ok(());
        }
        stack.push(id);
        for child in self.node(id)?.child_ids() {
            self.visit(child, visited, stack)?;
        }
        stack.pop();
        Ok(())
    }
}

/// Node-local payload checks that don't require the arena.
fn check_payload(node: &JourneyBodyNode) -> PulseResult<()> {
    match node {
        JourneyBodyNode::Delay {
            id,
            variant:
                crate::types::DelayVariant::LocalTime {
                    hour,
                    minute,
                    allowed_days_of_week,
                },
            ..
        } => {
            if *hour > 23 || *minute > 59 {
                return Err(PulseError::Definition(format!(
                    "delay node {id} has invalid local time {hour}:{minute}"
                )));
            }
            if let Some(days) = allowed_days_of_week {
                if days.is_empty() || days.iter().any(|d| *d > 6) {
                    return Err(PulseError::Definition(format!(
                        "delay node {id} has invalid allowed weekdays"
                    )));
                }
            }
            Ok(())
        }
        JourneyBodyNode::ExperimentSplit { id, variants } => {
            if variants.iter().any(|v| v.percent <= 0.0) {
                return Err(PulseError::Definition(format!(
                    "experiment split {id} has a non-positive variant weight"
                )));
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
