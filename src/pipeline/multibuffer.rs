//! Multi-buffering of shared buffers in a pipelined loop.
//!
//! Once iterations overlap, a buffer written in stage `w` and read back in
//! a later stage `r` is overwritten by iterations `i+1 .. i+(r-w)` before
//! iteration `i` reads it. Giving the buffer `r - w + 1` rotating copies,
//! selected by `iteration mod N`, keeps every in-flight iteration on its
//! own copy.

use std::collections::BTreeMap;

use crate::ir::{AddressSpace, Graph, IndexExpr, NodeId, OpKind, Origin, Trace};

/// A shared buffer live across several stages of one pipelined loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferHazard {
    pub buffer: String,
    /// The `Allocate` in the root graph.
    pub allocation: NodeId,
    /// Earliest stage writing the buffer.
    pub write_stage: u32,
    /// Latest stage reading it.
    pub read_stage: u32,
    /// Copies needed: `read_stage - write_stage + 1`.
    pub buffers: u32,
    /// The buffer is also accessed outside the pipelined loop, so its
    /// shape cannot change.
    pub escapes: bool,
}

/// One read or write of a shared allocation.
struct Access {
    /// `None` for the root graph, else a loop body.
    graph: Option<String>,
    node: NodeId,
    allocation: NodeId,
    /// Set for nodes emitted by pipelining.
    origin: Option<Origin>,
    is_write: bool,
}

impl Access {
    fn is_from(&self, body: &str) -> bool {
        self.origin.as_ref().is_some_and(|o| o.body == body)
    }
}

fn shared_allocation(trace: &Trace, id: NodeId) -> Option<NodeId> {
    match trace.root.get(id).map(|n| &n.op) {
        Some(OpKind::Allocate {
            space: AddressSpace::Shared,
            ..
        }) => Some(id),
        _ => None,
    }
}

/// Every access to a shared allocation in the trace: root nodes directly,
/// loop bodies through their captures.
fn accesses(trace: &Trace) -> Vec<Access> {
    let mut out = Vec::new();
    let mut visit = |graph: Option<&str>, g: &Graph, resolve: &dyn Fn(NodeId) -> Option<NodeId>| {
        for (id, node) in g.iter() {
            let Some(pos) = node.op.memory_operand() else {
                continue;
            };
            let Some(allocation) = node.args.get(pos).and_then(|&m| resolve(m)) else {
                continue;
            };
            out.push(Access {
                graph: graph.map(str::to_string),
                node: id,
                allocation,
                origin: node.origin.clone(),
                is_write: node.op.is_memory_write(),
            });
        }
    };

    visit(None, &trace.root, &|m| shared_allocation(trace, m));
    for loop_id in trace.loops() {
        let node = &trace.root[loop_id];
        let OpKind::Iterate {
            subgraph,
            num_iter_args,
            ..
        } = &node.op
        else {
            continue;
        };
        let Some(body) = trace.subgraph(subgraph) else {
            continue;
        };
        let resolve = |m: NodeId| match body.get(m).map(|n| &n.op) {
            Some(OpKind::Placeholder { capture }) => node
                .args
                .get(num_iter_args + capture)
                .and_then(|&outer| shared_allocation(trace, outer)),
            _ => None,
        };
        visit(Some(subgraph.as_str()), body, &resolve);
    }
    out
}

/// Shared buffers of the pipelined `body` whose reads trail their writes
/// by at least one stage, in allocation order.
pub fn find_hazards(trace: &Trace, body: &str) -> Vec<BufferHazard> {
    let all = accesses(trace);
    let mut ranges: BTreeMap<NodeId, (Option<u32>, Option<u32>)> = BTreeMap::new();
    for access in all.iter().filter(|a| a.is_from(body)) {
        let stage = access.origin.as_ref().map_or(0, |o| o.stage);
        let (write, read) = ranges.entry(access.allocation).or_default();
        if access.is_write {
            *write = Some(write.map_or(stage, |w| w.min(stage)));
        } else {
            *read = Some(read.map_or(stage, |r| r.max(stage)));
        }
    }
    ranges
        .into_iter()
        .filter_map(|(allocation, range)| match range {
            (Some(write_stage), Some(read_stage)) if read_stage > write_stage => {
                Some(BufferHazard {
                    buffer: trace.root[allocation].name.clone(),
                    allocation,
                    write_stage,
                    read_stage,
                    buffers: read_stage - write_stage + 1,
                    escapes: all
                        .iter()
                        .any(|a| a.allocation == allocation && !a.is_from(body)),
                })
            }
            _ => None,
        })
        .collect()
}

/// Expand every hazardous buffer into `buffers` rotating copies: the
/// allocation gains a leading dimension and every access of `body` a
/// leading index `iteration mod buffers`. Escaping buffers are left
/// alone. Returns the number of accesses rewritten.
pub fn multi_buffer(trace: &mut Trace, body: &str, hazards: &[BufferHazard]) -> usize {
    let copies: BTreeMap<NodeId, u32> = hazards
        .iter()
        .filter(|h| !h.escapes)
        .map(|h| (h.allocation, h.buffers))
        .collect();
    for (&allocation, &n) in &copies {
        if let Some(OpKind::Allocate { shape, .. }) = trace.root.get_mut(allocation).map(|a| &mut a.op) {
            shape.insert(0, IndexExpr::Const(n as i64));
        }
    }

    let mut rewritten = 0;
    for access in accesses(trace) {
        let Some(origin) = access.origin.as_ref().filter(|o| o.body == body) else {
            continue;
        };
        let Some(&n) = copies.get(&access.allocation) else {
            continue;
        };
        let graph = match &access.graph {
            None => Some(&mut trace.root),
            Some(name) => trace.subgraph_mut(name),
        };
        let Some(index) = graph
            .and_then(|g| g.get_mut(access.node))
            .and_then(|node| node.op.index_mut())
        else {
            continue;
        };
        let slot = origin.iteration.clone().modulo(IndexExpr::Const(n as i64));
        index.insert(0, slot);
        rewritten += 1;
    }
    rewritten
}
