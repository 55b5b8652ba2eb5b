//! Heuristic prefetch scheduling.
//!
//! One forward list-scheduling pass places every operation as early as its
//! same-iteration dependences and the reservation table allow, preferring
//! memory reads, then operations with heavier outgoing edges. A backward
//! pass then sinks every non-read operation to the latest slot its
//! successors still accept, so loads run ahead of the compute that
//! consumes them. If the loop-carried edges do not hold at the current II
//! the II grows; a fully sequential schedule ends the search.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::bounds::res_mii;
use super::graph::DependencyGraph;
use super::verify::verify_schedule;
use super::{Schedule, SchedulerStrategy};
use crate::config::ResourceVector;

#[derive(Clone, Copy, Debug, Default)]
pub struct PrefetchScheduler;

impl SchedulerStrategy for PrefetchScheduler {
    fn name(&self) -> &'static str {
        "prefetch"
    }

    fn schedule(&self, graph: &DependencyGraph, inventory: &ResourceVector) -> Option<Schedule> {
        if let Some(node) = graph.nodes.iter().find(|n| !n.usage.fits(inventory)) {
            warn!(node = %node.name, usage = %node.usage, "node exceeds per-cycle inventory");
            return None;
        }
        let order = topological_order(graph);
        let sequential = sequential(graph, &order);
        let start = res_mii(graph, inventory);

        for ii in start..sequential.initiation_interval {
            let Some(cycles) = list_schedule(graph, inventory, &order, ii) else {
                continue;
            };
            let schedule = Schedule::normalized(&cycles, ii);
            if verify_schedule(graph, &schedule, inventory).is_ok() {
                return Some(schedule);
            }
        }
        debug!(body = %graph.body, ii = sequential.initiation_interval, "prefetch falls back to sequential schedule");
        Some(sequential)
    }
}

/// Same-iteration topological order, lowest index first among ready nodes.
fn topological_order(graph: &DependencyGraph) -> Vec<usize> {
    let n = graph.len();
    let mut indegree = vec![0usize; n];
    for e in graph.edges.iter().filter(|e| e.distance == 0) {
        indegree[e.to] += 1;
    }
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for e in graph.succs(i).filter(|e| e.distance == 0) {
            indegree[e.to] -= 1;
            if indegree[e.to] == 0 {
                ready.insert(e.to);
            }
        }
    }
    order
}

/// One operation after another in topological order; II is the length of
/// the whole iteration. Every edge holds and every phase holds at most one
/// costed operation.
fn sequential(graph: &DependencyGraph, order: &[usize]) -> Schedule {
    let mut cycles = vec![0u32; graph.len()];
    let mut t = 0;
    for &i in order {
        cycles[i] = t;
        t += graph.nodes[i].latency;
    }
    Schedule {
        cycles,
        initiation_interval: t.max(1),
    }
}

fn list_schedule(
    graph: &DependencyGraph,
    inventory: &ResourceVector,
    order: &[usize],
    ii: u32,
) -> Option<Vec<i64>> {
    let n = graph.len();
    let phase = |t: i64| t.rem_euclid(ii as i64) as usize;
    let heaviest: Vec<u32> = (0..n)
        .map(|i| graph.succs(i).map(|e| e.weight).max().unwrap_or(0))
        .collect();
    let key = |i: usize| (!graph.nodes[i].is_memory_read(), Reverse(heaviest[i]), i);

    // Forward: as soon as possible.
    let mut indegree = vec![0usize; n];
    for e in graph.edges.iter().filter(|e| e.distance == 0) {
        indegree[e.to] += 1;
    }
    let mut ready: BTreeSet<(bool, Reverse<u32>, usize)> =
        (0..n).filter(|&i| indegree[i] == 0).map(&key).collect();
    let mut cycle: Vec<Option<i64>> = vec![None; n];
    let mut mrt = vec![ResourceVector::ZERO; ii as usize];
    while let Some((_, _, i)) = ready.pop_first() {
        let earliest = graph
            .preds(i)
            .filter_map(|e| cycle[e.from].map(|c| c + e.delay(ii)))
            .max()
            .unwrap_or(0)
            .max(0);
        let usage = graph.nodes[i].usage;
        let t = (earliest..earliest + ii as i64).find(|&t| mrt[phase(t)].add(&usage).fits(inventory))?;
        mrt[phase(t)] = mrt[phase(t)].add(&usage);
        cycle[i] = Some(t);
        for e in graph.succs(i).filter(|e| e.distance == 0) {
            indegree[e.to] -= 1;
            if indegree[e.to] == 0 {
                ready.insert(key(e.to));
            }
        }
    }
    let mut cycle: Vec<i64> = cycle.into_iter().collect::<Option<Vec<_>>>()?;

    // Backward: sink compute as late as its successors allow.
    let horizon = (0..n)
        .map(|i| cycle[i] + graph.nodes[i].latency as i64)
        .max()
        .unwrap_or(0);
    for &i in order.iter().rev() {
        if graph.nodes[i].is_memory_read() {
            continue;
        }
        let latest = graph
            .succs(i)
            .filter(|e| e.to != i)
            .map(|e| cycle[e.to] - e.delay(ii))
            .min()
            .unwrap_or(horizon - graph.nodes[i].latency as i64);
        if latest <= cycle[i] {
            continue;
        }
        let usage = graph.nodes[i].usage;
        let current = cycle[i];
        mrt[phase(current)] = mrt[phase(current)].sub(&usage);
        let t = (current + 1..=latest)
            .rev()
            .find(|&t| mrt[phase(t)].add(&usage).fits(inventory))
            .unwrap_or(current);
        mrt[phase(t)] = mrt[phase(t)].add(&usage);
        cycle[i] = t;
    }

    let holds = graph
        .edges
        .iter()
        .all(|e| cycle[e.to] - cycle[e.from] >= e.delay(ii));
    holds.then_some(cycle)
}
