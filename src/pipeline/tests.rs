use super::multibuffer::{find_hazards, multi_buffer};
use super::*;
use crate::config::HardwareConfig;
use crate::constraints::KernelConstraints;
use crate::ir::samples;
use crate::schedule::{apply_schedule, DependencyGraph, ModuloScheduler, SchedulerStrategy};

/// Schedule the kernel's only loop and attach the schedule to its body.
/// Returns the loop, its trip count and its stage count.
fn scheduled(trace: &mut Trace, constraints: &KernelConstraints) -> (NodeId, IndexExpr, u32) {
    let loop_id = trace.loops()[0];
    let node = trace.root[loop_id].clone();
    let OpKind::Iterate {
        axis,
        subgraph,
        count,
        num_iter_args,
        ..
    } = &node.op
    else {
        panic!("not a loop");
    };
    let hw = HardwareConfig::cdna3();
    let graph = DependencyGraph::build(
        subgraph,
        trace.subgraph(subgraph).unwrap(),
        &hw,
        &node.args[*num_iter_args..],
    )
    .unwrap();
    let scheduler = ModuloScheduler {
        max_initiation_interval: 64,
        budget_ratio: 8,
    };
    let schedule = scheduler.schedule(&graph, &hw.inventory).unwrap();
    apply_schedule(trace.subgraph_mut(subgraph).unwrap(), &graph, &schedule);
    let trip_count = constraints.trip_count(axis, count.as_ref()).unwrap();
    (loop_id, trip_count, schedule.num_stages())
}

fn pipelined(trace: &mut Trace, constraints: &KernelConstraints, barriers: bool) -> PipelinedLoop {
    let (loop_id, trip_count, stages) = scheduled(trace, constraints);
    build_pipelined_loop(trace, loop_id, &trip_count, stages, barriers).unwrap()
}

fn names(graph: &Graph, ids: &[NodeId]) -> Vec<String> {
    ids.iter().map(|&id| graph[id].name.clone()).collect()
}

#[test]
fn test_staged_accumulate_structure() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    let p = pipelined(&mut trace, &constraints, false);

    assert_eq!(p.kernel_trip_count, IndexExpr::Const(12));
    assert_eq!(p.kernel_body, "k_loop_body_kernel");
    assert_eq!(
        names(&trace.root, &p.prologue),
        vec![
            "stage.prologue.0",
            "stage.prologue.1",
            "stage.prologue.2",
            "unstage.prologue.2",
            "stage.prologue.3",
            "unstage.prologue.3",
        ]
    );
    assert_eq!(
        names(&trace.root, &p.epilogue),
        vec![
            "unstage.epilogue.0",
            "accumulate.epilogue.0",
            "unstage.epilogue.1",
            "accumulate.epilogue.1",
            "accumulate.epilogue.2",
            "accumulate.epilogue.3",
        ]
    );

    assert!(trace.root.by_name("k_loop").is_none());
    assert!(trace.subgraph("k_loop_body").is_none());
    assert!(trace.validate().is_ok());
}

#[test]
fn test_result_comes_from_last_epilogue_step() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    let before = trace.root.len();
    pipelined(&mut trace, &constraints, false);

    // The loop's GetResult is replaced by the last epilogue copy.
    assert!(trace.root.by_name("sum").is_none());
    let last = trace.root.by_name("accumulate.epilogue.3").unwrap();
    let origin = trace.root[last].origin.clone().unwrap();
    assert_eq!(origin.stage, 4);
    assert_eq!(origin.iteration, IndexExpr::Const(15));
    assert!(trace.root.len() > before);
}

#[test]
fn test_kernel_carries_rotating_slots() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    let p = pipelined(&mut trace, &constraints, false);

    let OpKind::Iterate {
        num_iter_args,
        count,
        ..
    } = &trace.root[p.kernel].op
    else {
        panic!("kernel is not a loop");
    };
    // unstage one and two trips back, accumulate one trip back.
    assert_eq!(*num_iter_args, 3);
    assert_eq!(count.as_ref(), Some(&IndexExpr::Const(12)));

    let kernel = trace.subgraph(&p.kernel_body).unwrap();
    let slots: Vec<String> = kernel.iter_args().iter().map(|&id| kernel[id].name.clone()).collect();
    assert_eq!(slots, vec!["unstage.slot1", "unstage.slot2", "accumulate.slot1"]);
    assert_eq!(kernel.carried_edges().len(), 3);

    // accumulate adds the value unstaged two trips ago to its own last value.
    let acc = kernel.by_name("accumulate").unwrap();
    assert_eq!(names(kernel, &kernel[acc].args), vec!["unstage.slot2", "accumulate.slot1"]);

    let stage = kernel.by_name("stage").unwrap();
    let origin = kernel[stage].origin.clone().unwrap();
    assert_eq!(origin.iteration, IndexExpr::sym("$K").offset(4));
    assert_eq!(origin.body, "k_loop_body");
}

#[test]
fn test_slots_enter_from_prologue() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    let p = pipelined(&mut trace, &constraints, false);

    let kernel = &trace.root[p.kernel];
    let inits = names(&trace.root, &kernel.args[..3]);
    // unstage of iteration 1 (one trip back) and 0 (two back); the
    // accumulator has not run yet and starts from its init value.
    assert_eq!(inits, vec!["unstage.prologue.3", "unstage.prologue.2", "sum_init"]);
}

#[test]
fn test_same_trip_producer_in_online_softmax() {
    let (mut trace, constraints) = samples::online_softmax(64);
    let p = pipelined(&mut trace, &constraints, false);
    assert_eq!(p.kernel_trip_count, IndexExpr::Const(62));

    let kernel = trace.subgraph(&p.kernel_body).unwrap();
    // sum issues in phase 0 of the same trip and feeds the next iteration's
    // scaled_sum directly.
    let scaled = kernel.by_name("scaled_sum").unwrap();
    let sum = kernel.by_name("sum").unwrap();
    assert_eq!(kernel[scaled].args[0], sum);
    assert!(kernel.position(sum) < kernel.position(scaled));

    assert!(trace.root.by_name("row_max").is_none());
    assert!(trace.root.by_name("max.epilogue.0").is_some());
    assert!(trace.root.by_name("sum.epilogue.1").is_some());
    assert!(trace.validate().is_ok());
}

#[test]
fn test_barriers_between_cycle_groups() {
    let (mut trace, constraints) = samples::online_softmax(64);
    let p = pipelined(&mut trace, &constraints, true);
    let kernel = trace.subgraph(&p.kernel_body).unwrap();
    let barriers: Vec<u32> = kernel
        .iter()
        .filter_map(|(_, n)| match n.op {
            OpKind::SchedulingBarrier { cycle } => Some(cycle),
            _ => None,
        })
        .collect();
    assert_eq!(barriers, vec![0, 1, 2, 3]);

    let (mut trace, constraints) = samples::staged_accumulate(256);
    let p = pipelined(&mut trace, &constraints, false);
    let kernel = trace.subgraph(&p.kernel_body).unwrap();
    assert!(kernel
        .iter()
        .all(|(_, n)| !matches!(n.op, OpKind::SchedulingBarrier { .. })));
}

#[test]
fn test_single_stage_is_rejected() {
    let (mut trace, constraints) = samples::gemm();
    let (loop_id, trip_count, _) = scheduled(&mut trace, &constraints);
    assert!(matches!(
        build_pipelined_loop(&mut trace, loop_id, &trip_count, 1, false),
        Err(ScheduleError::MalformedGraph(_))
    ));
}

#[test]
fn test_unscheduled_body_is_rejected() {
    let (mut trace, _) = samples::gemm();
    let loop_id = trace.loops()[0];
    assert!(build_pipelined_loop(&mut trace, loop_id, &IndexExpr::Const(10), 3, false).is_err());
}

// ─── Multi-buffering ───────────────────────────────────────────────

#[test]
fn test_hazard_on_staging_buffer() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    pipelined(&mut trace, &constraints, false);
    let hazards = find_hazards(&trace, "k_loop_body");
    assert_eq!(hazards.len(), 1);
    let h = &hazards[0];
    assert_eq!(h.buffer, "staging");
    assert_eq!((h.write_stage, h.read_stage, h.buffers), (0, 2, 3));
    assert!(!h.escapes);
}

#[test]
fn test_no_hazard_within_one_stage() {
    let (mut trace, constraints) = samples::gemm();
    pipelined(&mut trace, &constraints, false);
    assert!(find_hazards(&trace, "k_loop_body").is_empty());
}

#[test]
fn test_multi_buffer_rewrites_allocation_and_indices() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    let p = pipelined(&mut trace, &constraints, false);
    let hazards = find_hazards(&trace, "k_loop_body");
    // Five writes (four prologue, one kernel) and five reads.
    assert_eq!(multi_buffer(&mut trace, "k_loop_body", &hazards), 10);

    let staging = trace.root.by_name("staging").unwrap();
    let OpKind::Allocate { shape, .. } = &trace.root[staging].op else {
        panic!("not an allocation");
    };
    assert_eq!(shape, &vec![IndexExpr::Const(3), IndexExpr::Const(64)]);

    let kernel = trace.subgraph(&p.kernel_body).unwrap();
    let stage = kernel.by_name("stage").unwrap();
    let OpKind::Write { index, .. } = &kernel[stage].op else {
        panic!("not a write");
    };
    let slot = IndexExpr::sym("$K").offset(4).modulo(IndexExpr::Const(3));
    assert_eq!(index, &vec![slot, IndexExpr::Const(0)]);

    let read = trace.root.by_name("unstage.epilogue.1").unwrap();
    let OpKind::Read { index, .. } = &trace.root[read].op else {
        panic!("not a read");
    };
    // Iteration 15 uses copy 0.
    assert_eq!(index, &vec![IndexExpr::Const(0), IndexExpr::Const(0)]);
    assert!(trace.validate().is_ok());
}

/// A read of `staging` in the root graph, after the loop.
fn read_staging_after_loop(trace: &mut Trace) -> NodeId {
    let staging = trace.root.by_name("staging").unwrap();
    trace.root.add(Node::new(
        "peek",
        OpKind::Read {
            space: crate::ir::AddressSpace::Shared,
            index: vec![IndexExpr::Const(0)],
            elements_per_thread: 1,
        },
        vec![staging],
    ))
}

#[test]
fn test_buffer_used_outside_loop_is_not_multi_buffered() {
    let (mut trace, constraints) = samples::staged_accumulate(256);
    pipelined(&mut trace, &constraints, false);
    let peek = read_staging_after_loop(&mut trace);

    let hazards = find_hazards(&trace, "k_loop_body");
    assert_eq!(hazards.len(), 1);
    assert!(hazards[0].escapes);
    assert_eq!(multi_buffer(&mut trace, "k_loop_body", &hazards), 0);

    // Allocation and every access keep the same rank.
    let staging = trace.root.by_name("staging").unwrap();
    let OpKind::Allocate { shape, .. } = &trace.root[staging].op else {
        panic!("not an allocation");
    };
    assert_eq!(shape, &vec![IndexExpr::Const(64)]);
    let OpKind::Read { index, .. } = &trace.root[peek].op else {
        panic!("not a read");
    };
    assert_eq!(index.len(), shape.len());
    let kernel = trace.subgraph("k_loop_body_kernel").unwrap();
    let stage = kernel.by_name("stage").unwrap();
    let OpKind::Write { index, .. } = &kernel[stage].op else {
        panic!("not a write");
    };
    assert_eq!(index, &vec![IndexExpr::Const(0)]);
}
