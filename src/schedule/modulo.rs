//! Iterative modulo scheduling.
//!
//! For each candidate II from `max(ResMII, RecMII)` upward, operations are
//! placed in height order into a modulo reservation table (MRT). An
//! operation that finds no free slot in `[estart, estart + II)` is forced
//! in anyway and evicts whatever it conflicts with: resource occupants of
//! its phase and successors whose dependence it now violates. Evicted
//! operations go back on the queue. A per-II budget of placements bounds
//! the search; exhausting it moves on to the next II.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use super::bounds::{rec_mii, res_mii};
use super::graph::DependencyGraph;
use super::verify::verify_schedule;
use super::{Schedule, SchedulerStrategy};
use crate::config::{ResourceKind, ResourceVector};

#[derive(Clone, Debug)]
pub struct ModuloScheduler {
    pub max_initiation_interval: u32,
    /// Placements allowed per node for each candidate II.
    pub budget_ratio: u32,
}

impl SchedulerStrategy for ModuloScheduler {
    fn name(&self) -> &'static str {
        "modulo"
    }

    fn schedule(&self, graph: &DependencyGraph, inventory: &ResourceVector) -> Option<Schedule> {
        if let Some(node) = graph.nodes.iter().find(|n| !n.usage.fits(inventory)) {
            warn!(node = %node.name, usage = %node.usage, "node exceeds per-cycle inventory");
            return None;
        }
        let res = res_mii(graph, inventory);
        let rec = rec_mii(graph);
        let mii = res.max(rec);
        debug!(body = %graph.body, res_mii = res, rec_mii = rec, "modulo search");

        for ii in mii..=self.max_initiation_interval {
            let Some(cycles) = self.try_ii(graph, inventory, ii) else {
                debug!(body = %graph.body, ii, "no modulo schedule within budget");
                continue;
            };
            let schedule = Schedule::normalized(&cycles, ii);
            match verify_schedule(graph, &schedule, inventory) {
                Ok(()) => return Some(schedule),
                Err(reason) => warn!(body = %graph.body, ii, %reason, "rejecting modulo schedule"),
            }
        }
        None
    }
}

/// Mutable search state for one candidate II.
struct Placement {
    ii: u32,
    cycle: Vec<Option<i64>>,
    /// Cycle of the most recent placement, kept across evictions.
    last: Vec<Option<i64>>,
    mrt: Vec<ResourceVector>,
    /// (priority rank, node) of every unscheduled node.
    queue: BTreeSet<(usize, usize)>,
    rank: Vec<usize>,
}

impl Placement {
    fn phase(&self, t: i64) -> usize {
        t.rem_euclid(self.ii as i64) as usize
    }

    fn place(&mut self, graph: &DependencyGraph, op: usize, t: i64) {
        let ph = self.phase(t);
        self.mrt[ph] = self.mrt[ph].add(&graph.nodes[op].usage);
        self.cycle[op] = Some(t);
        self.last[op] = Some(t);
    }

    fn evict(&mut self, graph: &DependencyGraph, op: usize) {
        if let Some(t) = self.cycle[op].take() {
            let ph = self.phase(t);
            self.mrt[ph] = self.mrt[ph].sub(&graph.nodes[op].usage);
            self.queue.insert((self.rank[op], op));
        }
    }
}

impl ModuloScheduler {
    fn try_ii(
        &self,
        graph: &DependencyGraph,
        inventory: &ResourceVector,
        ii: u32,
    ) -> Option<Vec<i64>> {
        let n = graph.len();
        let height = heights(graph, ii);
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| height[b].cmp(&height[a]).then(a.cmp(&b)));
        let mut rank = vec![0; n];
        for (r, &i) in order.iter().enumerate() {
            rank[i] = r;
        }

        let mut state = Placement {
            ii,
            cycle: vec![None; n],
            last: vec![None; n],
            mrt: vec![ResourceVector::ZERO; ii as usize],
            queue: order.iter().map(|&i| (rank[i], i)).collect(),
            rank,
        };
        let mut budget = self.budget_ratio as usize * n.max(1);

        while let Some((_, op)) = state.queue.pop_first() {
            if budget == 0 {
                return None;
            }
            budget -= 1;

            let estart = graph
                .preds(op)
                .filter(|e| e.from != op)
                .filter_map(|e| state.cycle[e.from].map(|c| c + e.delay(ii)))
                .max()
                .unwrap_or(0)
                .max(0);
            let usage = graph.nodes[op].usage;
            let free = (estart..estart + ii as i64)
                .find(|&t| state.mrt[state.phase(t)].add(&usage).fits(inventory));
            let t = match (free, state.last[op]) {
                (Some(t), _) => t,
                (None, Some(prev)) if prev >= estart => prev + 1,
                (None, _) => estart,
            };

            // Resource conflicts: evict occupants of the phase that share a
            // resource with `op` until it fits.
            let ph = state.phase(t);
            if !state.mrt[ph].add(&usage).fits(inventory) {
                let occupants: Vec<usize> = (0..n)
                    .filter(|&j| {
                        j != op
                            && state.cycle[j].is_some_and(|c| state.phase(c) == ph)
                            && shares_resource(&usage, &graph.nodes[j].usage)
                    })
                    .collect();
                for j in occupants {
                    if state.mrt[ph].add(&usage).fits(inventory) {
                        break;
                    }
                    state.evict(graph, j);
                }
            }
            state.place(graph, op, t);

            // Dependence conflicts: scheduled successors now too early.
            let victims: BTreeSet<usize> = graph
                .succs(op)
                .filter(|e| e.to != op)
                .filter(|e| state.cycle[e.to].is_some_and(|c| c < t + e.delay(ii)))
                .map(|e| e.to)
                .collect();
            for v in victims {
                state.evict(graph, v);
            }
        }

        state.cycle.into_iter().collect()
    }
}

fn shares_resource(a: &ResourceVector, b: &ResourceVector) -> bool {
    ResourceKind::ALL
        .iter()
        .any(|&k| a.get(k) > 0 && b.get(k) > 0)
}

/// Longest path to any sink, with edge length `weight - distance * II`.
/// Converges because the II is at least the recurrence bound.
fn heights(graph: &DependencyGraph, ii: u32) -> Vec<i64> {
    let n = graph.len();
    let mut height = vec![0i64; n];
    for _ in 0..=n {
        let mut changed = false;
        for e in &graph.edges {
            if e.from == e.to {
                continue;
            }
            let candidate = height[e.to] + e.delay(ii);
            if candidate > height[e.from] {
                height[e.from] = candidate;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    height
}
