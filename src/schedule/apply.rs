//! Mapping a schedule back onto the loop body, and the pipelining gate.

use tracing::debug;

use super::graph::DependencyGraph;
use super::Schedule;
use crate::constraints::{Implication, KernelConstraints, Predicate, Truth};
use crate::ir::{Graph, IndexExpr, OpKind, SchedulingParams};

/// Attach `{absolute_cycle, cycle, stage, II}` to every scheduled node of
/// `body` and drop the carried edges the schedule now encodes.
///
/// IterArgs are not placed on their own: each takes the earliest cycle of
/// its consumers, or keeps its search cycle if nothing consumes it.
pub fn apply_schedule(body: &mut Graph, graph: &DependencyGraph, schedule: &Schedule) {
    let ii = schedule.initiation_interval;
    for (i, node) in graph.nodes.iter().enumerate() {
        if let Some(target) = body.get_mut(node.original) {
            target.schedule = Some(SchedulingParams::new(schedule.cycles[i], ii));
        }
    }
    for (i, node) in graph.nodes.iter().enumerate() {
        if !node.is_iter_arg() {
            continue;
        }
        let earliest_use = body
            .users(node.original)
            .into_iter()
            .filter_map(|u| body.get(u).and_then(|n| n.schedule))
            .map(|s| s.absolute_cycle)
            .min();
        let cycle = earliest_use.unwrap_or(schedule.cycles[i]);
        if let Some(target) = body.get_mut(node.original) {
            target.schedule = Some(SchedulingParams::new(cycle, ii));
        }
        body.sever_carried_edges(node.original);
    }
}

/// Read the schedule back off an annotated body, in `graph` node order.
/// `None` if some node carries no metadata.
pub fn schedule_of(body: &Graph, graph: &DependencyGraph) -> Option<Schedule> {
    let mut ii = None;
    let mut cycles = Vec::with_capacity(graph.len());
    for node in &graph.nodes {
        let params = body.get(node.original)?.schedule?;
        ii = Some(params.initiation_interval);
        cycles.push(params.absolute_cycle);
    }
    Some(Schedule {
        cycles,
        initiation_interval: ii.unwrap_or(1),
    })
}

/// Why a scheduled loop kept its original single-stage form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Scheduling mode `NONE`.
    Disabled,
    /// The schedule has a single stage; there is nothing to overlap.
    SingleStage,
    /// The trip count is not larger than `num_stages - 1`, or provably so.
    PipelineInfeasible {
        trip_count: IndexExpr,
        num_stages: u32,
    },
    /// A symbolic trip count the assumptions do not bound.
    AssumptionGap {
        trip_count: IndexExpr,
        num_stages: u32,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "scheduling disabled"),
            SkipReason::SingleStage => write!(f, "single-stage schedule"),
            SkipReason::PipelineInfeasible {
                trip_count,
                num_stages,
            } => write!(
                f,
                "trip count {} cannot fill and drain {} stages",
                trip_count, num_stages
            ),
            SkipReason::AssumptionGap {
                trip_count,
                num_stages,
            } => write!(
                f,
                "cannot prove trip count {} > {} from the kernel's assumptions",
                trip_count,
                num_stages.saturating_sub(1)
            ),
        }
    }
}

/// Decide whether a loop of `trip_count` iterations can be split into
/// `num_stages` pipeline stages: requires `trip_count > num_stages - 1`.
pub fn check_feasibility(
    trip_count: &IndexExpr,
    num_stages: u32,
    constraints: &KernelConstraints,
    solver: &dyn Implication,
) -> Result<(), SkipReason> {
    if num_stages <= 1 {
        return Err(SkipReason::SingleStage);
    }
    let fill = num_stages as i64 - 1;
    if let Some(n) = trip_count.as_const() {
        return if n > fill {
            Ok(())
        } else {
            Err(SkipReason::PipelineInfeasible {
                trip_count: trip_count.clone(),
                num_stages,
            })
        };
    }

    let gap = || SkipReason::AssumptionGap {
        trip_count: trip_count.clone(),
        num_stages,
    };
    let assumptions = constraints.effective_assumptions();
    if assumptions.is_empty() {
        return Err(gap());
    }
    let goal = Predicate::gt(trip_count.clone(), fill);
    let answer = solver.implies(&assumptions, &goal);
    debug!(%goal, ?answer, "feasibility query");
    match answer {
        Truth::True => Ok(()),
        Truth::False => Err(SkipReason::PipelineInfeasible {
            trip_count: trip_count.clone(),
            num_stages,
        }),
        Truth::Unknown => Err(gap()),
    }
}

/// Whether `op` is a loop whose body this pass may restructure.
pub(crate) fn loop_parts(op: &OpKind) -> Option<(&str, &str, &str, Option<&IndexExpr>, usize)> {
    match op {
        OpKind::Iterate {
            axis,
            induction_var,
            subgraph,
            count,
            num_iter_args,
        } => Some((
            axis.as_str(),
            induction_var.as_str(),
            subgraph.as_str(),
            count.as_ref(),
            *num_iter_args,
        )),
        _ => None,
    }
}
