//! Structural validation of flow definitions, run once at activation.
//!
//! Checks run in a fixed order and the first failing check is reported with
//! every node and edge it implicates:
//!
//! 1. node and edge ids are unique
//! 2. every edge endpoint names a node of the same definition
//! 3. exactly one node has no incoming edge (the entry node)
//! 4. per-type out-degree (goal: none, email/delay: at most one,
//!    condition: one "yes" and one "no")
//! 5. every node is reachable from the entry node
//! 6. the graph without condition timeout ("no") edges is acyclic
//! 7. loops closed by a timeout edge have a non-zero wait window

use std::collections::{HashMap, HashSet};

use campaign_core::{ValidationError, ValidationReason};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::types::{Branch, Edge, FlowDefinition, Node, NodeKind};

type ValidationResult = Result<(), ValidationError>;

/// Validates a flow definition. Returns the first structural violation found.
pub fn validate(definition: &FlowDefinition) -> ValidationResult {
    let nodes = &definition.nodes;
    let edges = &definition.edges;

    check_unique_ids(nodes, edges)?;

    let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    check_endpoints(&by_id, edges)?;

    let entry = check_single_entry(nodes, edges)?;
    check_out_degree(nodes, edges)?;
    check_reachability(nodes, edges, entry)?;
    check_acyclic(nodes, edges, &by_id)?;
    check_bounded_loops(nodes, edges, &by_id)
}

fn check_unique_ids(nodes: &[Node], edges: &[Edge]) -> ValidationResult {
    let mut seen = HashSet::new();
    let dup_nodes: Vec<String> = nodes
        .iter()
        .filter(|n| !seen.insert(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();

    let mut seen = HashSet::new();
    let dup_edges: Vec<String> = edges
        .iter()
        .filter(|e| !seen.insert(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();

    if dup_nodes.is_empty() && dup_edges.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            node_ids: dup_nodes,
            edge_ids: dup_edges,
            reason: ValidationReason::DuplicateId,
        })
    }
}

fn check_endpoints(by_id: &HashMap<&str, &Node>, edges: &[Edge]) -> ValidationResult {
    let mut edge_ids = Vec::new();
    let mut node_ids = Vec::new();
    for edge in edges {
        let mut dangling = false;
        for endpoint in [&edge.source, &edge.target] {
            if !by_id.contains_key(endpoint.as_str()) {
                dangling = true;
                if !node_ids.contains(endpoint) {
                    node_ids.push(endpoint.clone());
                }
            }
        }
        if dangling {
            edge_ids.push(edge.id.clone());
        }
    }

    if edge_ids.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            node_ids,
            edge_ids,
            reason: ValidationReason::DanglingEdge,
        })
    }
}

fn check_single_entry<'a>(nodes: &'a [Node], edges: &[Edge]) -> Result<&'a Node, ValidationError> {
    let targets: HashSet<&str> = edges.iter().map(|e| e.target.as_str()).collect();
    let entries: Vec<&Node> = nodes
        .iter()
        .filter(|n| !targets.contains(n.id.as_str()))
        .collect();

    match entries.as_slice() {
        [entry] => Ok(entry),
        [] => Err(ValidationError::nodes(
            ValidationReason::EntryNodeCount,
            nodes.iter().map(|n| n.id.clone()).collect(),
        )),
        many => Err(ValidationError::nodes(
            ValidationReason::EntryNodeCount,
            many.iter().map(|n| n.id.clone()).collect(),
        )),
    }
}

fn check_out_degree(nodes: &[Node], edges: &[Edge]) -> ValidationResult {
    let mut outgoing: HashMap<&str, Vec<&Edge>> = HashMap::new();
    for edge in edges {
        outgoing.entry(edge.source.as_str()).or_default().push(edge);
    }
    let out_of = |node: &Node| outgoing.get(node.id.as_str()).cloned().unwrap_or_default();

    let mut goal_violations = Offenders::default();
    let mut single_violations = Offenders::default();
    let mut condition_violations = Offenders::default();

    for node in nodes {
        let out = out_of(node);
        match &node.kind {
            NodeKind::Goal(_) if !out.is_empty() => goal_violations.add(node, &out),
            NodeKind::Email(_) | NodeKind::Delay(_) if out.len() > 1 => {
                single_violations.add(node, &out)
            }
            NodeKind::Condition(_) => {
                let yes = out.iter().filter(|e| e.branch() == Branch::Yes).count();
                let no = out.iter().filter(|e| e.branch() == Branch::No).count();
                if out.len() != 2 || yes != 1 || no != 1 {
                    condition_violations.add(node, &out);
                }
            }
            _ => {}
        }
    }

    goal_violations.into_result(ValidationReason::GoalHasOutgoing)?;
    single_violations.into_result(ValidationReason::TooManyOutgoing)?;
    condition_violations.into_result(ValidationReason::ConditionBranches)
}

#[derive(Default)]
struct Offenders {
    node_ids: Vec<String>,
    edge_ids: Vec<String>,
}

impl Offenders {
    fn add(&mut self, node: &Node, edges: &[&Edge]) {
        self.node_ids.push(node.id.clone());
        self.edge_ids.extend(edges.iter().map(|e| e.id.clone()));
    }

    fn into_result(self, reason: ValidationReason) -> ValidationResult {
        if self.node_ids.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                node_ids: self.node_ids,
                edge_ids: self.edge_ids,
                reason,
            })
        }
    }
}

fn check_reachability(nodes: &[Node], edges: &[Edge], entry: &Node) -> ValidationResult {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let reached = reachable_from(&adjacency, entry.id.as_str());
    let unreachable: Vec<String> = nodes
        .iter()
        .filter(|n| !reached.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect();

    if unreachable.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::nodes(
            ValidationReason::Unreachable,
            unreachable,
        ))
    }
}

fn reachable_from<'a>(adjacency: &HashMap<&'a str, Vec<&'a str>>, start: &'a str) -> HashSet<&'a str> {
    let mut reached = HashSet::new();
    let mut stack = vec![start];
    while let Some(n) = stack.pop() {
        if reached.insert(n) {
            if let Some(next) = adjacency.get(n) {
                stack.extend(next.iter().copied());
            }
        }
    }
    reached
}

/// Timeout edges of condition nodes are the only edges allowed to close a loop.
fn is_timeout_edge(edge: &Edge, by_id: &HashMap<&str, &Node>) -> bool {
    matches!(
        by_id.get(edge.source.as_str()).map(|n| &n.kind),
        Some(NodeKind::Condition(_))
    ) && edge.branch() == Branch::No
}

fn check_acyclic(nodes: &[Node], edges: &[Edge], by_id: &HashMap<&str, &Node>) -> ValidationResult {
    let mut graph: DiGraph<&str, &str> = DiGraph::new();
    let index_of: HashMap<&str, NodeIndex> = nodes
        .iter()
        .map(|n| (n.id.as_str(), graph.add_node(n.id.as_str())))
        .collect();

    for edge in edges.iter().filter(|e| !is_timeout_edge(e, by_id)) {
        graph.add_edge(
            index_of[edge.source.as_str()],
            index_of[edge.target.as_str()],
            edge.id.as_str(),
        );
    }

    let mut node_ids = Vec::new();
    let mut in_cycle: HashMap<NodeIndex, usize> = HashMap::new();
    for (component, scc) in tarjan_scc(&graph).into_iter().enumerate() {
        let self_loop = scc.len() == 1 && graph.contains_edge(scc[0], scc[0]);
        if scc.len() > 1 || self_loop {
            for ix in scc {
                in_cycle.insert(ix, component);
                node_ids.push(graph[ix].to_string());
            }
        }
    }

    if node_ids.is_empty() {
        return Ok(());
    }

    let edge_ids = graph
        .edge_indices()
        .filter_map(|e| {
            let (a, b) = graph.edge_endpoints(e)?;
            match (in_cycle.get(&a), in_cycle.get(&b)) {
                (Some(ca), Some(cb)) if ca == cb => Some(graph[e].to_string()),
                _ => None,
            }
        })
        .collect();

    node_ids.sort();
    Err(ValidationError {
        node_ids,
        edge_ids,
        reason: ValidationReason::Cycle,
    })
}

fn check_bounded_loops(nodes: &[Node], edges: &[Edge], by_id: &HashMap<&str, &Node>) -> ValidationResult {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.target.as_str());
    }

    let mut offenders = Offenders::default();
    for edge in edges.iter().filter(|e| is_timeout_edge(e, by_id)) {
        let Some(NodeKind::Condition(config)) = by_id.get(edge.source.as_str()).map(|n| &n.kind) else {
            continue;
        };
        let closes_loop = reachable_from(&adjacency, edge.target.as_str()).contains(edge.source.as_str());
        if closes_loop && config.wait.is_zero() {
            if let Some(node) = nodes.iter().find(|n| n.id == edge.source) {
                offenders.add(node, &[edge]);
            }
        }
    }
    offenders.into_result(ValidationReason::UnboundedLoop)
}
