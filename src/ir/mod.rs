//! Kernel dataflow IR consumed by the scheduler.
//!
//! A `Trace` holds the kernel's root graph plus one named subgraph per loop
//! body. Every `Graph` is an arena addressed by stable `NodeId` handles:
//! erasing a node leaves a tombstone and handles are never reused, so a
//! scheduling copy can always be mapped back onto the graph it came from.
//!
//! ```text
//! root:   Argument / Allocate / Constant ──► Iterate(init.., captures..) ──► GetResult
//!                                               │
//! body:   Placeholder(capture) / IterArg(i) ──► Read / Mma / ... ──► Output
//!                     ▲                                                │
//!                     └──────────── carried edge (distance 1) ─────────┘
//! ```

pub mod builder;
pub mod display;
pub mod expr;
pub mod samples;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;
pub use expr::IndexExpr;

// ─── Handles ──────────────────────────────────────────────────────

/// Stable handle of a node inside one `Graph`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

// ─── Operation kinds ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSpace {
    Global,
    Shared,
}

/// Matrix-multiply intrinsic variants supported by the hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum MmaShape {
    F32_16x16x16_F16,
    F32_32x32x8_F16,
    F32_16x16x32_F8,
    F32_32x32x16_F8,
    I32_16x16x32_I8,
}

impl MmaShape {
    /// Issue latency multiplier relative to the base MMA latency.
    pub fn latency_scale(self) -> u32 {
        match self {
            MmaShape::F32_16x16x16_F16 => 1,
            MmaShape::F32_32x32x8_F16 => 2,
            MmaShape::F32_16x16x32_F8 => 1,
            MmaShape::F32_32x32x16_F8 => 2,
            MmaShape::I32_16x16x32_I8 => 1,
        }
    }

    /// (M, N, K) tile of the intrinsic.
    pub fn dims(self) -> (u32, u32, u32) {
        match self {
            MmaShape::F32_16x16x16_F16 => (16, 16, 16),
            MmaShape::F32_32x32x8_F16 => (32, 32, 8),
            MmaShape::F32_16x16x32_F8 => (16, 16, 32),
            MmaShape::F32_32x32x16_F8 => (32, 32, 16),
            MmaShape::I32_16x16x32_I8 => (16, 16, 32),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Max,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Exp2,
    Neg,
    Cast,
}

/// Closed set of operation kinds.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Kernel buffer argument (root graph).
    Argument { name: String, space: AddressSpace },
    /// Buffer allocation (root graph).
    Allocate {
        shape: Vec<IndexExpr>,
        space: AddressSpace,
    },
    Constant { value: i64 },
    /// Loop body view of the outer value at `capture` in the Iterate's captures.
    Placeholder { capture: usize },
    /// Loop body view of the iteration-carried value `index`.
    IterArg { index: usize },
    /// Loop body terminator; operand i becomes IterArg i of the next iteration.
    Output,
    /// Operands: [memory].
    Read {
        space: AddressSpace,
        index: Vec<IndexExpr>,
        elements_per_thread: u32,
    },
    /// Operands: [value, memory].
    Write {
        space: AddressSpace,
        index: Vec<IndexExpr>,
        elements_per_thread: u32,
    },
    /// Operands: [lhs, rhs, acc].
    Mma { shape: MmaShape },
    Binary { op: BinaryOp },
    Unary { op: UnaryOp },
    Shuffle { offset: u32, width: u32 },
    /// Loop. Operands: the first `num_iter_args` are initial carried values,
    /// the rest are outer values captured by the body.
    Iterate {
        axis: String,
        induction_var: String,
        subgraph: String,
        count: Option<IndexExpr>,
        num_iter_args: usize,
    },
    /// Operands: [iterate].
    GetResult { index: usize },
    /// Issue-order fence between cycle groups of a pipelined loop.
    SchedulingBarrier { cycle: u32 },
}

impl OpKind {
    /// Short tag used in node names, artifacts and dumps.
    pub fn tag(&self) -> &'static str {
        match self {
            OpKind::Argument { .. } => "argument",
            OpKind::Allocate { .. } => "allocate",
            OpKind::Constant { .. } => "constant",
            OpKind::Placeholder { .. } => "placeholder",
            OpKind::IterArg { .. } => "iter_arg",
            OpKind::Output => "output",
            OpKind::Read { .. } => "read",
            OpKind::Write { .. } => "write",
            OpKind::Mma { .. } => "mma",
            OpKind::Binary { .. } => "binary",
            OpKind::Unary { .. } => "unary",
            OpKind::Shuffle { .. } => "shuffle",
            OpKind::Iterate { .. } => "iterate",
            OpKind::GetResult { .. } => "get_result",
            OpKind::SchedulingBarrier { .. } => "scheduling_barrier",
        }
    }

    /// Structural nodes carry no cost and are excluded from resource accounting.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            OpKind::Placeholder { .. }
                | OpKind::IterArg { .. }
                | OpKind::Output
                | OpKind::SchedulingBarrier { .. }
        )
    }

    /// Kinds that may only appear in a kernel's root graph.
    pub fn is_root_only(&self) -> bool {
        matches!(
            self,
            OpKind::Argument { .. }
                | OpKind::Allocate { .. }
                | OpKind::Iterate { .. }
                | OpKind::GetResult { .. }
        )
    }

    pub fn is_memory_read(&self) -> bool {
        matches!(self, OpKind::Read { .. })
    }

    pub fn is_memory_write(&self) -> bool {
        matches!(self, OpKind::Write { .. })
    }

    /// Operand position of the memory buffer for reads and writes.
    pub fn memory_operand(&self) -> Option<usize> {
        match self {
            OpKind::Read { .. } => Some(0),
            OpKind::Write { .. } => Some(1),
            _ => None,
        }
    }

    /// Whether the op defines a value other nodes may consume.
    pub fn has_result(&self) -> bool {
        !matches!(
            self,
            OpKind::Write { .. } | OpKind::Output | OpKind::SchedulingBarrier { .. }
        )
    }

    pub(crate) fn index_mut(&mut self) -> Option<&mut Vec<IndexExpr>> {
        match self {
            OpKind::Read { index, .. } | OpKind::Write { index, .. } => Some(index),
            _ => None,
        }
    }
}

// ─── Nodes ────────────────────────────────────────────────────────

/// Scheduling metadata attached to a real graph node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingParams {
    pub absolute_cycle: u32,
    /// absolute_cycle mod II
    pub cycle: u32,
    /// absolute_cycle / II
    pub stage: u32,
    pub initiation_interval: u32,
}

impl SchedulingParams {
    pub fn new(absolute_cycle: u32, initiation_interval: u32) -> Self {
        Self {
            absolute_cycle,
            cycle: absolute_cycle % initiation_interval,
            stage: absolute_cycle / initiation_interval,
            initiation_interval,
        }
    }
}

/// Provenance of a node emitted by loop pipelining.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Subgraph of the loop body the node was cloned from.
    pub body: String,
    /// Node in that body.
    pub node: NodeId,
    pub stage: u32,
    /// Source-loop iteration this copy computes.
    pub iteration: IndexExpr,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op: OpKind,
    pub args: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<SchedulingParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: OpKind, args: Vec<NodeId>) -> Self {
        Self {
            name: name.into(),
            op,
            args,
            schedule: None,
            origin: None,
        }
    }
}

/// A dependency whose value crosses from one loop iteration to a later one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarriedEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub distance: u32,
}

// ─── Graph ────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    order: Vec<NodeId>,
    #[serde(default)]
    carried: Vec<CarriedEdge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Some(node));
        id
    }

    /// Append a node at the end of program order.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = self.alloc(node);
        self.order.push(id);
        id
    }

    /// Insert a node immediately before `anchor` in program order.
    pub fn insert_before(&mut self, anchor: NodeId, node: Node) -> NodeId {
        let pos = self.position(anchor).unwrap_or(self.order.len());
        let id = self.alloc(node);
        self.order.insert(pos, id);
        id
    }

    /// Insert a node immediately after `anchor` in program order.
    pub fn insert_after(&mut self, anchor: NodeId, node: Node) -> NodeId {
        let pos = self
            .position(anchor)
            .map(|p| p + 1)
            .unwrap_or(self.order.len());
        let id = self.alloc(node);
        self.order.insert(pos, id);
        id
    }

    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&n| n == id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.index()).and_then(|n| n.as_mut())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Live nodes in program order.
    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> + '_ {
        self.order
            .iter()
            .filter_map(move |&id| self.get(id).map(|n| (id, n)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Remove a node. Its handle stays reserved.
    pub fn erase(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.index()) {
            *slot = None;
        }
        self.order.retain(|&n| n != id);
        self.carried.retain(|e| e.from != id && e.to != id);
    }

    /// Nodes using `id` as an operand, in program order.
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| n.args.contains(&id))
            .map(|(u, _)| u)
            .collect()
    }

    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) {
        for id in self.order.clone() {
            if let Some(node) = self.get_mut(id) {
                for arg in node.args.iter_mut() {
                    if *arg == old {
                        *arg = new;
                    }
                }
            }
        }
    }

    pub fn find(&self, pred: impl Fn(&Node) -> bool) -> Vec<NodeId> {
        self.iter().filter(|(_, n)| pred(n)).map(|(id, _)| id).collect()
    }

    pub fn by_name(&self, name: &str) -> Option<NodeId> {
        self.iter().find(|(_, n)| n.name == name).map(|(id, _)| id)
    }

    pub fn output(&self) -> Option<NodeId> {
        self.iter()
            .find(|(_, n)| matches!(n.op, OpKind::Output))
            .map(|(id, _)| id)
    }

    /// IterArg nodes ordered by their carried index.
    pub fn iter_args(&self) -> Vec<NodeId> {
        let mut args: Vec<(usize, NodeId)> = self
            .iter()
            .filter_map(|(id, n)| match n.op {
                OpKind::IterArg { index } => Some((index, id)),
                _ => None,
            })
            .collect();
        args.sort();
        args.into_iter().map(|(_, id)| id).collect()
    }

    pub fn carried_edges(&self) -> &[CarriedEdge] {
        &self.carried
    }

    pub fn add_carried_edge(&mut self, edge: CarriedEdge) {
        if !self.carried.contains(&edge) {
            self.carried.push(edge);
        }
    }

    /// Drop every carried edge ending at `to`.
    pub fn sever_carried_edges(&mut self, to: NodeId) {
        self.carried.retain(|e| e.to != to);
    }

    /// Record the loop-carried recurrence Output.args[i] → IterArg i.
    pub fn close_loop(&mut self) {
        let Some(output) = self.output() else {
            return;
        };
        let results = self.get(output).map(|n| n.args.clone()).unwrap_or_default();
        for ia in self.iter_args() {
            let Some(OpKind::IterArg { index }) = self.get(ia).map(|n| n.op.clone()) else {
                continue;
            };
            if let Some(&from) = results.get(index) {
                self.add_carried_edge(CarriedEdge {
                    from,
                    to: ia,
                    distance: 1,
                });
            }
        }
    }

    /// Check operand references: every operand is live and defined earlier
    /// in program order. Carried edges are exempt from ordering, which
    /// also makes ordinary data edges acyclic.
    pub fn validate(&self, graph_name: &str) -> Result<(), ScheduleError> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        for (id, node) in self.iter() {
            for &arg in &node.args {
                if !self.contains(arg) {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "{}: node '{}' ({}) references missing node {}",
                        graph_name, node.name, id, arg
                    )));
                }
                if !seen.contains(&arg) {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "{}: node '{}' ({}) uses {} before it is defined",
                        graph_name, node.name, id, arg
                    )));
                }
            }
            seen.insert(id);
        }
        for edge in &self.carried {
            if !self.contains(edge.from) || !self.contains(edge.to) {
                return Err(ScheduleError::MalformedGraph(format!(
                    "{}: carried edge {} -> {} references a missing node",
                    graph_name, edge.from, edge.to
                )));
            }
            if edge.distance == 0 {
                return Err(ScheduleError::MalformedGraph(format!(
                    "{}: carried edge {} -> {} has distance 0",
                    graph_name, edge.from, edge.to
                )));
            }
        }
        Ok(())
    }

    /// Copy the live nodes into a fresh, densely numbered graph.
    ///
    /// Returns the copy and a table mapping copy handles (by index) back to
    /// the handles of `self`.
    pub fn compact_copy(&self) -> (Graph, Vec<NodeId>) {
        let mut fwd: BTreeMap<NodeId, NodeId> = BTreeMap::new();
        let mut back = Vec::with_capacity(self.order.len());
        let mut copy = Graph::new();
        for (id, node) in self.iter() {
            let mut n = node.clone();
            n.args = n
                .args
                .iter()
                .map(|a| fwd.get(a).copied().unwrap_or(*a))
                .collect();
            let new_id = copy.add(n);
            fwd.insert(id, new_id);
            back.push(id);
        }
        for edge in &self.carried {
            if let (Some(&from), Some(&to)) = (fwd.get(&edge.from), fwd.get(&edge.to)) {
                copy.carried.push(CarriedEdge {
                    from,
                    to,
                    distance: edge.distance,
                });
            }
        }
        (copy, back)
    }
}

impl std::ops::Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        self.get(id)
            .unwrap_or_else(|| panic!("node {} is not live in this graph", id))
    }
}

impl std::ops::IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        self.get_mut(id)
            .unwrap_or_else(|| panic!("node {} is not live in this graph", id))
    }
}

// ─── Trace ────────────────────────────────────────────────────────

/// A traced kernel: root graph plus named loop bodies.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub name: String,
    pub root: Graph,
    pub subgraphs: BTreeMap<String, Graph>,
}

impl Trace {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn subgraph(&self, name: &str) -> Option<&Graph> {
        self.subgraphs.get(name)
    }

    pub fn subgraph_mut(&mut self, name: &str) -> Option<&mut Graph> {
        self.subgraphs.get_mut(name)
    }

    /// Iterate nodes of the root graph, in program order.
    pub fn loops(&self) -> Vec<NodeId> {
        self.root
            .find(|n| matches!(n.op, OpKind::Iterate { .. }))
    }

    /// Validate the root graph, every body, and every Iterate's operand
    /// layout against its body.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.root.validate(&self.name)?;
        for (name, body) in &self.subgraphs {
            body.validate(name)?;
        }
        for id in self.loops() {
            let node = &self.root[id];
            let OpKind::Iterate {
                subgraph,
                num_iter_args,
                ..
            } = &node.op
            else {
                continue;
            };
            let body = self.subgraph(subgraph).ok_or_else(|| {
                ScheduleError::MalformedGraph(format!(
                    "loop '{}' refers to missing subgraph '{}'",
                    node.name, subgraph
                ))
            })?;
            let output = body.output().ok_or_else(|| {
                ScheduleError::MalformedGraph(format!("subgraph '{}' has no output", subgraph))
            })?;
            if body[output].args.len() != *num_iter_args {
                return Err(ScheduleError::MalformedGraph(format!(
                    "subgraph '{}' returns {} values but loop '{}' carries {}",
                    subgraph,
                    body[output].args.len(),
                    node.name,
                    num_iter_args
                )));
            }
            let captures = node.args.len().saturating_sub(*num_iter_args);
            for (pid, p) in body.iter() {
                let bad = match p.op {
                    OpKind::Placeholder { capture } => capture >= captures,
                    OpKind::IterArg { index } => index >= *num_iter_args,
                    _ => false,
                };
                if bad {
                    return Err(ScheduleError::MalformedGraph(format!(
                        "subgraph '{}': '{}' ({}) refers past the loop operands",
                        subgraph, p.name, pid
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
