//! Scheduling view of a loop body.
//!
//! `DependencyGraph::build` works on a compacted copy of the body: it
//! annotates every participating node with its latency and resource usage
//! and derives three edge classes:
//!
//! - **data**: operand → user, distance 0;
//! - **memory**: write → later read of the same buffer, distance 0;
//! - **recurrence**: `Output.args[i]` → `IterArg i`, distance 1.
//!
//! Placeholders, the output and scheduling barriers take no part. The body
//! itself is never touched; `SchedNode::original` maps back onto it.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};

use super::resources::annotate;
use crate::config::{HardwareConfig, ResourceVector};
use crate::error::ScheduleError;
use crate::ir::{Graph, NodeId, OpKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeKind {
    Data,
    Memory,
    Recurrence,
}

/// `to` may issue no earlier than `weight - distance * II` cycles after `from`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
    pub distance: u32,
    /// Latency of `from`; also the prefetch scheduler's tie-break.
    pub weight: u32,
    pub kind: EdgeKind,
}

impl Edge {
    /// Minimum cycle distance from `from` to `to` at the given II.
    pub fn delay(&self, ii: u32) -> i64 {
        self.weight as i64 - self.distance as i64 * ii as i64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedNode {
    /// Handle in the compacted copy.
    pub copy_id: NodeId,
    /// Handle in the loop body the copy was taken from.
    pub original: NodeId,
    pub name: String,
    pub kind: &'static str,
    pub latency: u32,
    pub usage: ResourceVector,
    pub ignore: bool,
}

impl SchedNode {
    pub fn is_memory_read(&self) -> bool {
        self.kind == "read"
    }

    pub fn is_iter_arg(&self) -> bool {
        self.kind == "iter_arg"
    }
}

/// Buffers are compared by the outer value a placeholder captures, so two
/// captures of one allocation still order against each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum MemoryKey {
    Outer(NodeId),
    Local(NodeId),
}

pub struct DependencyGraph {
    /// Name of the loop body subgraph.
    pub body: String,
    pub copy: Graph,
    pub nodes: Vec<SchedNode>,
    pub edges: Vec<Edge>,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the scheduling graph of `body`. `captures` are the root values
    /// bound to the body's placeholders, in capture order.
    pub fn build(
        body_name: &str,
        body: &Graph,
        hardware: &HardwareConfig,
        captures: &[NodeId],
    ) -> Result<Self, ScheduleError> {
        body.validate(body_name)?;
        let (copy, back) = body.compact_copy();
        let output = copy.output().ok_or_else(|| {
            ScheduleError::MalformedGraph(format!("{}: loop body has no output", body_name))
        })?;

        let mut nodes = Vec::new();
        let mut index_of: BTreeMap<NodeId, usize> = BTreeMap::new();
        for (id, node) in copy.iter() {
            if node.op.is_root_only() {
                return Err(ScheduleError::MalformedGraph(format!(
                    "{}: '{}' ({}) is a {} and cannot appear in a loop body",
                    body_name,
                    node.name,
                    id,
                    node.op.tag()
                )));
            }
            if matches!(
                node.op,
                OpKind::Placeholder { .. } | OpKind::Output | OpKind::SchedulingBarrier { .. }
            ) {
                continue;
            }
            let ann = annotate(&node.op, hardware);
            index_of.insert(id, nodes.len());
            nodes.push(SchedNode {
                copy_id: id,
                original: back[id.index()],
                name: node.name.clone(),
                kind: node.op.tag(),
                latency: ann.latency,
                usage: ann.usage,
                ignore: ann.ignore,
            });
        }

        let mut edges = Vec::new();
        let mut seen: BTreeSet<(usize, usize, u32)> = BTreeSet::new();
        let mut push = |edges: &mut Vec<Edge>, from: usize, to: usize, distance: u32, kind| {
            if seen.insert((from, to, distance)) {
                edges.push(Edge {
                    from,
                    to,
                    distance,
                    weight: nodes[from].latency,
                    kind,
                });
            }
        };

        // Data edges.
        for (id, node) in copy.iter() {
            let Some(&to) = index_of.get(&id) else {
                continue;
            };
            for arg in &node.args {
                if let Some(&from) = index_of.get(arg) {
                    push(&mut edges, from, to, 0, EdgeKind::Data);
                }
            }
        }

        // Memory-order edges: each read waits for every earlier write to
        // the same buffer.
        let mut writes: Vec<(MemoryKey, usize)> = Vec::new();
        for (id, node) in copy.iter() {
            let Some(&i) = index_of.get(&id) else {
                continue;
            };
            let Some(pos) = node.op.memory_operand() else {
                continue;
            };
            let Some(&memory) = node.args.get(pos) else {
                continue;
            };
            let key = match copy.get(memory).map(|m| &m.op) {
                Some(OpKind::Placeholder { capture }) => match captures.get(*capture) {
                    Some(&outer) => MemoryKey::Outer(outer),
                    None => MemoryKey::Local(memory),
                },
                _ => MemoryKey::Local(memory),
            };
            if node.op.is_memory_write() {
                writes.push((key, i));
            } else if node.op.is_memory_read() {
                for &(wkey, w) in &writes {
                    if wkey == key {
                        push(&mut edges, w, i, 0, EdgeKind::Memory);
                    }
                }
            }
        }

        // Recurrences.
        let iter_args: BTreeMap<usize, NodeId> = copy
            .iter()
            .filter_map(|(id, n)| match n.op {
                OpKind::IterArg { index } => Some((index, id)),
                _ => None,
            })
            .collect();
        for (i, &result) in copy[output].args.iter().enumerate() {
            let Some(&ia) = iter_args.get(&i) else {
                continue;
            };
            if let Some(OpKind::IterArg { index }) = copy.get(result).map(|n| &n.op) {
                if *index != i {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "{}: output {} forwards iter arg {} unchanged into another slot",
                        body_name, i, index
                    )));
                }
                continue;
            }
            // Loop-invariant results (placeholders) carry nothing to wait for.
            if let (Some(&from), Some(&to)) = (index_of.get(&result), index_of.get(&ia)) {
                push(&mut edges, from, to, 1, EdgeKind::Recurrence);
            }
        }

        let intra: DiGraph<(), ()> = DiGraph::from_edges(
            edges
                .iter()
                .filter(|e| e.distance == 0)
                .map(|e| (e.from as u32, e.to as u32)),
        );
        if is_cyclic_directed(&intra) {
            return Err(ScheduleError::MalformedGraph(format!(
                "{}: same-iteration dependences form a cycle",
                body_name
            )));
        }

        let mut preds = vec![Vec::new(); nodes.len()];
        let mut succs = vec![Vec::new(); nodes.len()];
        for (k, e) in edges.iter().enumerate() {
            succs[e.from].push(k);
            preds[e.to].push(k);
        }

        Ok(Self {
            body: body_name.to_string(),
            copy,
            nodes,
            edges,
            preds,
            succs,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Incoming edges of node `i`.
    pub fn preds(&self, i: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.preds[i].iter().map(move |&k| &self.edges[k])
    }

    /// Outgoing edges of node `i`.
    pub fn succs(&self, i: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.succs[i].iter().map(move |&k| &self.edges[k])
    }

    /// Total demand per resource over one iteration.
    pub fn total_usage(&self) -> ResourceVector {
        self.nodes
            .iter()
            .fold(ResourceVector::ZERO, |acc, n| acc.add(&n.usage))
    }

    /// Content hash of nodes and edges, used to tie schedule artifacts to
    /// the graph they were computed for.
    pub fn fingerprint(&self) -> String {
        let mut text = String::new();
        for n in &self.nodes {
            text.push_str(&format!(
                "n {} {} {} {} {}\n",
                n.copy_id.0, n.name, n.kind, n.latency, n.usage
            ));
        }
        for e in &self.edges {
            text.push_str(&format!(
                "e {} {} {} {} {:?}\n",
                e.from, e.to, e.distance, e.weight, e.kind
            ));
        }
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }
}
