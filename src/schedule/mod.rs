//! Loop scheduling driver.
//!
//! `schedule_graph` runs every loop of a traced kernel through the same
//! steps:
//!
//! 1. build the loop body's `DependencyGraph` on a compacted copy;
//! 2. compute a schedule with the configured strategy, or replay one from
//!    an artifact;
//! 3. attach the schedule to the body (`apply_schedule`);
//! 4. gate on the trip count and, if the pipeline can be filled, rewrite
//!    the loop into prologue, kernel and epilogue;
//! 5. detect (and with multi-buffering, fix) shared buffers whose live
//!    range spans several stages.
//!
//! All work happens on a staged clone of the trace. The caller's trace is
//! replaced only once every loop succeeded, so a hard error leaves it
//! exactly as it was.

pub mod apply;
pub mod artifact;
pub mod bounds;
pub mod graph;
pub mod modulo;
pub mod prefetch;
pub mod resources;
pub mod verify;
pub mod visualize;

use tracing::{debug, info, warn};

use crate::config::{loop_path, ResourceVector, SchedulerConfig, SchedulingType};
use crate::constraints::{BoundsSolver, KernelConstraints};
use crate::diagnostic::Diagnostic;
use crate::error::ScheduleError;
use crate::ir::{IndexExpr, NodeId, Trace};
use crate::pipeline::multibuffer::{find_hazards, multi_buffer, BufferHazard};
use crate::pipeline::build_pipelined_loop;
pub use apply::{apply_schedule, check_feasibility, schedule_of, SkipReason};
pub use graph::{DependencyGraph, Edge, EdgeKind, SchedNode};
pub use modulo::ModuloScheduler;
pub use prefetch::PrefetchScheduler;

// ─── Schedule ─────────────────────────────────────────────────────

/// Absolute issue cycle of every `DependencyGraph` node, by node index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub cycles: Vec<u32>,
    pub initiation_interval: u32,
}

impl Schedule {
    /// Shift raw search cycles so that the earliest stage is 0.
    pub fn normalized(cycles: &[i64], initiation_interval: u32) -> Self {
        let ii = initiation_interval.max(1) as i64;
        let min = cycles.iter().copied().min().unwrap_or(0);
        let shift = min.div_euclid(ii) * ii;
        Self {
            cycles: cycles.iter().map(|&c| (c - shift) as u32).collect(),
            initiation_interval: ii as u32,
        }
    }

    pub fn stage(&self, i: usize) -> u32 {
        self.cycles[i] / self.initiation_interval
    }

    pub fn phase(&self, i: usize) -> u32 {
        self.cycles[i] % self.initiation_interval
    }

    /// `max(stage) + 1`; an empty schedule has one (empty) stage.
    pub fn num_stages(&self) -> u32 {
        (0..self.cycles.len())
            .map(|i| self.stage(i))
            .max()
            .map_or(1, |s| s + 1)
    }
}

/// A way of computing a modulo schedule for one dependency graph.
///
/// `None` means the strategy could not find a schedule; for the modulo
/// scheduler this is a hard failure of the requested mode.
pub trait SchedulerStrategy {
    fn name(&self) -> &'static str;
    fn schedule(&self, graph: &DependencyGraph, inventory: &ResourceVector) -> Option<Schedule>;
}

/// The strategy a mode asks for; `None` for `SchedulingType::None`.
pub fn strategy_for(config: &SchedulerConfig) -> Option<Box<dyn SchedulerStrategy>> {
    match config.mode {
        SchedulingType::None => None,
        SchedulingType::Prefetch => Some(Box::new(PrefetchScheduler)),
        SchedulingType::Modulo | SchedulingType::ModuloMultiBuffered => {
            Some(Box::new(ModuloScheduler {
                max_initiation_interval: config.max_initiation_interval,
                budget_ratio: config.budget_ratio,
            }))
        }
    }
}

// ─── Reports ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopDecision {
    /// The loop was rewritten; the steady-state kernel runs this many times.
    Pipelined { kernel_trip_count: IndexExpr },
    /// The loop kept its original form (with schedule metadata unless
    /// scheduling is disabled).
    Skipped(SkipReason),
}

/// Outcome for one loop.
#[derive(Clone, Debug)]
pub struct LoopReport {
    pub loop_name: String,
    pub body: String,
    pub mode: SchedulingType,
    pub trip_count: Option<IndexExpr>,
    pub initiation_interval: Option<u32>,
    pub num_stages: Option<u32>,
    pub decision: LoopDecision,
    /// Shared buffers live across several stages of the pipelined loop.
    pub hazards: Vec<BufferHazard>,
    pub diagnostics: Vec<Diagnostic>,
}

impl LoopReport {
    fn skipped(loop_name: &str, body: &str, mode: SchedulingType, reason: SkipReason) -> Self {
        Self {
            loop_name: loop_name.to_string(),
            body: body.to_string(),
            mode,
            trip_count: None,
            initiation_interval: None,
            num_stages: None,
            decision: LoopDecision::Skipped(reason),
            hazards: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn is_pipelined(&self) -> bool {
        matches!(self.decision, LoopDecision::Pipelined { .. })
    }
}

#[derive(Clone, Debug)]
pub struct ScheduleReport {
    pub kernel: String,
    pub loops: Vec<LoopReport>,
}

impl ScheduleReport {
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> + '_ {
        self.loops.iter().flat_map(|l| l.diagnostics.iter())
    }

    pub fn loop_report(&self, loop_name: &str) -> Option<&LoopReport> {
        self.loops.iter().find(|l| l.loop_name == loop_name)
    }
}

// ─── Driver ───────────────────────────────────────────────────────

/// Schedule, and where feasible pipeline, every loop of `trace`.
pub fn schedule_graph(
    trace: &mut Trace,
    constraints: &KernelConstraints,
    config: &SchedulerConfig,
) -> Result<ScheduleReport, ScheduleError> {
    config.hardware.validate()?;
    trace.validate()?;

    let mut report = ScheduleReport {
        kernel: trace.name.clone(),
        loops: Vec::new(),
    };
    let Some(strategy) = strategy_for(config) else {
        for id in trace.loops() {
            let node = &trace.root[id];
            let body = apply::loop_parts(&node.op).map_or("", |p| p.2);
            report.loops.push(LoopReport::skipped(
                &node.name,
                body,
                config.mode,
                SkipReason::Disabled,
            ));
        }
        debug!(kernel = %trace.name, "scheduling disabled");
        return Ok(report);
    };

    let mut staged = trace.clone();
    for id in trace.loops() {
        let loop_report = schedule_loop(&mut staged, id, constraints, config, strategy.as_ref())?;
        report.loops.push(loop_report);
    }
    staged.validate()?;
    *trace = staged;
    Ok(report)
}

fn schedule_loop(
    trace: &mut Trace,
    loop_id: NodeId,
    constraints: &KernelConstraints,
    config: &SchedulerConfig,
    strategy: &dyn SchedulerStrategy,
) -> Result<LoopReport, ScheduleError> {
    let node = &trace.root[loop_id];
    let loop_name = node.name.clone();
    let Some((axis, _, body_name, count, num_iter_args)) = apply::loop_parts(&node.op) else {
        return Err(ScheduleError::MalformedGraph(format!(
            "'{}' is not a loop",
            loop_name
        )));
    };
    let body_name = body_name.to_string();
    let trip_count = constraints
        .trip_count(axis, count)
        .ok_or_else(|| ScheduleError::UnknownLoop {
            loop_name: loop_name.clone(),
            axis: axis.to_string(),
        })?;
    let captures: Vec<NodeId> = node.args.iter().skip(num_iter_args).copied().collect();
    let body = trace.subgraph(&body_name).ok_or_else(|| {
        ScheduleError::MalformedGraph(format!(
            "loop '{}' refers to missing subgraph '{}'",
            loop_name, body_name
        ))
    })?;

    let hardware = &config.hardware;
    let graph = DependencyGraph::build(&body_name, body, hardware, &captures)?;
    let schedule = match &config.override_schedule {
        Some(template) => {
            let path = loop_path(template, &body_name);
            info!(loop_name = %loop_name, path = %path.display(), "replaying schedule");
            artifact::load_schedule(&path, &graph, &hardware.inventory)?
        }
        None => strategy
            .schedule(&graph, &hardware.inventory)
            .ok_or_else(|| ScheduleError::SchedulingFailure {
                loop_name: loop_name.clone(),
                max_ii: config.max_initiation_interval,
            })?,
    };
    let ii = schedule.initiation_interval;
    let num_stages = schedule.num_stages();
    info!(
        loop_name = %loop_name,
        strategy = strategy.name(),
        ii,
        stages = num_stages,
        "scheduled loop"
    );

    if let Some(template) = &config.dump_schedule {
        artifact::dump_schedule(&loop_path(template, &body_name), &loop_name, &graph, &schedule)?;
    }
    if let Some(dir) = &config.visualize_dir {
        visualize::write_visualization(dir, &graph, &schedule, &hardware.inventory)?;
    }

    if let Some(body) = trace.subgraph_mut(&body_name) {
        apply_schedule(body, &graph, &schedule);
    }

    let mut report = LoopReport {
        loop_name: loop_name.clone(),
        body: body_name.clone(),
        mode: config.mode,
        trip_count: Some(trip_count.clone()),
        initiation_interval: Some(ii),
        num_stages: Some(num_stages),
        decision: LoopDecision::Skipped(SkipReason::SingleStage),
        hazards: Vec::new(),
        diagnostics: Vec::new(),
    };

    if let Err(reason) = check_feasibility(&trip_count, num_stages, constraints, &BoundsSolver::default()) {
        if reason != SkipReason::SingleStage {
            warn!(loop_name = %loop_name, %reason, "not pipelining loop");
            report.diagnostics.push(
                Diagnostic::warning(format!("loop '{}' is not pipelined: {}", loop_name, reason))
                    .with_subject(loop_name.clone())
                    .with_note(format!("II = {}, {} stages", ii, num_stages)),
            );
        } else {
            debug!(loop_name = %loop_name, "single-stage schedule; nothing to pipeline");
        }
        report.decision = LoopDecision::Skipped(reason);
        return Ok(report);
    }

    let pipelined = build_pipelined_loop(
        trace,
        loop_id,
        &trip_count,
        num_stages,
        config.use_scheduling_barriers,
    )?;
    info!(
        loop_name = %loop_name,
        kernel = %pipelined.kernel_body,
        kernel_trip_count = %pipelined.kernel_trip_count,
        "pipelined loop"
    );
    report.decision = LoopDecision::Pipelined {
        kernel_trip_count: pipelined.kernel_trip_count.clone(),
    };

    report.hazards = find_hazards(trace, &body_name);
    if report.hazards.is_empty() {
        return Ok(report);
    }
    if config.mode.is_multi_buffered() {
        let rewritten = multi_buffer(trace, &body_name, &report.hazards);
        for hazard in &report.hazards {
            if hazard.escapes {
                warn!(loop_name = %loop_name, buffer = %hazard.buffer, "buffer escapes loop");
                report.diagnostics.push(
                    Diagnostic::warning(format!(
                        "buffer '{}' is live across stages {}..={} of pipelined loop '{}' but is also used outside it",
                        hazard.buffer, hazard.write_stage, hazard.read_stage, loop_name
                    ))
                    .with_subject(hazard.buffer.clone())
                    .with_note("its shape is shared with the outside accesses, so it stays single-buffered".to_string())
                    .with_help(format!(
                        "give the loop its own buffer of {} copies",
                        hazard.buffers
                    )),
                );
                continue;
            }
            info!(
                loop_name = %loop_name,
                buffer = %hazard.buffer,
                buffers = hazard.buffers,
                "multi-buffered"
            );
        }
        debug!(loop_name = %loop_name, accesses = rewritten, "rewrote buffer accesses");
    } else {
        for hazard in &report.hazards {
            warn!(loop_name = %loop_name, buffer = %hazard.buffer, "aliasing hazard");
            report.diagnostics.push(
                Diagnostic::warning(format!(
                    "buffer '{}' is written in stage {} and read in stage {} of pipelined loop '{}'",
                    hazard.buffer, hazard.write_stage, hazard.read_stage, loop_name
                ))
                .with_subject(hazard.buffer.clone())
                .with_note(format!(
                    "a later iteration overwrites it before the read; {} buffers are needed",
                    hazard.buffers
                ))
                .with_help("use the modulo-multi-buffered scheduling mode".to_string()),
            );
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests;
