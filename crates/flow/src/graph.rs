//! Compiled, read-only view of a validated flow version.
//!
//! Nodes live in an arena indexed by position; each node carries an
//! adjacency map keyed by branch label. Cursors refer to nodes by id only,
//! so a compiled graph can be shared behind an `Arc` by every cursor bound
//! to the version.

use std::collections::HashMap;

use campaign_core::ValidationError;
use uuid::Uuid;

use crate::types::{Branch, FlowDefinition, Node};
use crate::validator;

#[derive(Debug)]
pub struct FlowGraph {
    definition: FlowDefinition,
    index: HashMap<String, usize>,
    outgoing: Vec<HashMap<Branch, usize>>,
    entry: usize,
}

impl FlowGraph {
    /// Validates the definition and builds the arena. Nothing is produced for
    /// an invalid definition.
    pub fn compile(definition: FlowDefinition) -> Result<Self, ValidationError> {
        validator::validate(&definition)?;

        let index: HashMap<String, usize> = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let mut outgoing = vec![HashMap::new(); definition.nodes.len()];
        let mut has_incoming = vec![false; definition.nodes.len()];
        for edge in &definition.edges {
            let source = index[&edge.source];
            let target = index[&edge.target];
            outgoing[source].insert(edge.branch(), target);
            has_incoming[target] = true;
        }

        // validation guarantees exactly one node without incoming edges
        let entry = has_incoming.iter().position(|incoming| !incoming).unwrap_or(0);

        Ok(Self {
            definition,
            index,
            outgoing,
            entry,
        })
    }

    pub fn id(&self) -> Uuid {
        self.definition.id
    }

    pub fn campaign_id(&self) -> Uuid {
        self.definition.campaign_id
    }

    pub fn version(&self) -> u32 {
        self.definition.version
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn entry(&self) -> &Node {
        &self.definition.nodes[self.entry]
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.definition.nodes[i])
    }

    /// Target of `node_id`'s edge for `branch`. Single-exit nodes are reached
    /// through whichever edge they have, whatever its label.
    pub fn next(&self, node_id: &str, branch: Branch) -> Option<&Node> {
        let &i = self.index.get(node_id)?;
        let edges = &self.outgoing[i];
        let target = match branch {
            Branch::Next => edges.values().next(),
            other => edges.get(&other),
        }?;
        Some(&self.definition.nodes[*target])
    }
}
