use std::collections::BTreeMap;

use super::artifact::{dump_schedule, load_schedule, read_artifact, ScheduleArtifact};
use super::bounds::res_mii;
use super::verify::verify_schedule;
use super::visualize::{reservation_table, to_dot, write_visualization};
use super::*;
use crate::config::HardwareConfig;
use crate::constraints::{CmpOp, Predicate};
use crate::ir::builder::KernelBuilder;
use crate::ir::{samples, AddressSpace, BinaryOp, Graph, OpKind};

fn body_of(trace: &Trace) -> (String, Vec<NodeId>) {
    let id = trace.loops()[0];
    let node = &trace.root[id];
    let OpKind::Iterate {
        subgraph,
        num_iter_args,
        ..
    } = &node.op
    else {
        panic!("not a loop");
    };
    (subgraph.clone(), node.args[*num_iter_args..].to_vec())
}

fn graph_of(trace: &Trace) -> DependencyGraph {
    let (name, captures) = body_of(trace);
    let body = trace.subgraph(&name).unwrap();
    DependencyGraph::build(&name, body, &HardwareConfig::cdna3(), &captures).unwrap()
}

fn modulo() -> ModuloScheduler {
    ModuloScheduler {
        max_initiation_interval: 64,
        budget_ratio: 8,
    }
}

fn cycles_by_name(graph: &DependencyGraph, schedule: &Schedule) -> BTreeMap<String, u32> {
    graph
        .nodes
        .iter()
        .zip(&schedule.cycles)
        .map(|(n, &c)| (n.name.clone(), c))
        .collect()
}

fn inventory() -> ResourceVector {
    HardwareConfig::cdna3().inventory
}

/// Five independent global reads reduced by a small add tree; no carried
/// values at all.
fn reduction_tree() -> (Trace, KernelConstraints) {
    let mut kb = KernelBuilder::new("reduce");
    let x = kb.argument("x", AddressSpace::Global);
    let l = kb.iterate("i_loop", "I", &[], &[x], |bb| {
        let reads: Vec<NodeId> = (0..5)
            .map(|k| {
                let idx = vec![bb.induction().offset(k)];
                bb.read(&format!("r{}", k), bb.capture(0), AddressSpace::Global, idx)
            })
            .collect();
        let a = bb.binary("a", BinaryOp::Add, reads[0], reads[1]);
        let b = bb.binary("b", BinaryOp::Add, reads[2], reads[3]);
        let c = bb.binary("c", BinaryOp::Add, a, b);
        bb.binary("d", BinaryOp::Add, c, reads[4]);
        vec![]
    });
    kb.set_count(l, IndexExpr::Const(32));
    (kb.finish(), KernelConstraints::default())
}

// ─── Schedule ──────────────────────────────────────────────────────

#[test]
fn test_normalized_shifts_to_stage_zero() {
    let s = Schedule::normalized(&[-3, 1, 5], 4);
    assert_eq!(s.cycles, vec![1, 5, 9]);
    assert_eq!(s.num_stages(), 3);
    assert_eq!((s.stage(0), s.phase(0)), (0, 1));
    assert_eq!((s.stage(2), s.phase(2)), (2, 1));
}

#[test]
fn test_empty_schedule_has_one_stage() {
    let s = Schedule {
        cycles: vec![],
        initiation_interval: 2,
    };
    assert_eq!(s.num_stages(), 1);
}

#[test]
fn test_strategy_for_mode() {
    assert!(strategy_for(&SchedulerConfig::with_mode(SchedulingType::None)).is_none());
    let prefetch = strategy_for(&SchedulerConfig::with_mode(SchedulingType::Prefetch)).unwrap();
    assert_eq!(prefetch.name(), "prefetch");
    let multi =
        strategy_for(&SchedulerConfig::with_mode(SchedulingType::ModuloMultiBuffered)).unwrap();
    assert_eq!(multi.name(), "modulo");
}

// ─── Strategies ────────────────────────────────────────────────────

#[test]
fn test_modulo_gemm() {
    let (trace, _) = samples::gemm();
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    assert_eq!(s.initiation_interval, 4);
    assert_eq!(s.num_stages(), 3);
    let c = cycles_by_name(&g, &s);
    assert_eq!(c["read_a"], 0);
    assert_eq!(c["read_b"], 0);
    assert_eq!(c["write_a_shared"], 4);
    assert_eq!(c["write_b_shared"], 4);
    assert_eq!(c["read_a_shared"], 6);
    assert_eq!(c["read_b_shared"], 6);
    assert_eq!(c["mma"], 8);
}

#[test]
fn test_modulo_staged_accumulate() {
    let (trace, _) = samples::staged_accumulate(256);
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    assert_eq!(s.initiation_interval, 1);
    assert_eq!(s.num_stages(), 5);
    let c = cycles_by_name(&g, &s);
    assert_eq!(c["stage"], 0);
    assert_eq!(c["unstage"], 2);
    assert_eq!(c["accumulate"], 4);
}

#[test]
fn test_modulo_online_softmax_reaches_resource_bound() {
    let (trace, _) = samples::online_softmax(64);
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    assert_eq!(s.initiation_interval, 4);
    assert_eq!(s.num_stages(), 3);
    let c = cycles_by_name(&g, &s);
    assert_eq!(c["max"], 4);
    assert_eq!(c["sum"], 8);
}

#[test]
fn test_modulo_hits_res_mii_without_recurrence() {
    let (trace, _) = reduction_tree();
    let g = graph_of(&trace);
    assert!(g.edges.iter().all(|e| e.distance == 0));
    let s = modulo().schedule(&g, &inventory()).unwrap();
    // Five global reads on two units.
    assert_eq!(res_mii(&g, &inventory()), 3);
    assert_eq!(s.initiation_interval, 3);
}

#[test]
fn test_modulo_gives_up_below_rec_mii() {
    let (trace, _) = samples::gemm();
    let g = graph_of(&trace);
    let capped = ModuloScheduler {
        max_initiation_interval: 3,
        budget_ratio: 8,
    };
    assert!(capped.schedule(&g, &inventory()).is_none());
}

#[test]
fn test_every_strategy_produces_valid_schedules() {
    let strategies: Vec<Box<dyn SchedulerStrategy>> = vec![Box::new(modulo()), Box::new(PrefetchScheduler)];
    for name in samples::BUILTINS {
        let (trace, _) = samples::builtin(name).unwrap();
        let g = graph_of(&trace);
        for strategy in &strategies {
            let s = strategy.schedule(&g, &inventory()).unwrap();
            assert_eq!(
                verify_schedule(&g, &s, &inventory()),
                Ok(()),
                "{} on {}",
                strategy.name(),
                name
            );
            assert!(s.cycles.iter().any(|&c| c < s.initiation_interval));
        }
    }
}

#[test]
fn test_strategies_are_deterministic() {
    let (trace, _) = samples::online_softmax(64);
    let g = graph_of(&trace);
    let inv = inventory();
    assert_eq!(modulo().schedule(&g, &inv), modulo().schedule(&g, &inv));
    assert_eq!(
        PrefetchScheduler.schedule(&g, &inv),
        PrefetchScheduler.schedule(&g, &inv)
    );
}

#[test]
fn test_prefetch_never_beats_modulo() {
    for name in samples::BUILTINS {
        let (trace, _) = samples::builtin(name).unwrap();
        let g = graph_of(&trace);
        let m = modulo().schedule(&g, &inventory()).unwrap();
        let p = PrefetchScheduler.schedule(&g, &inventory()).unwrap();
        assert!(p.initiation_interval >= res_mii(&g, &inventory()));
        assert!(m.initiation_interval <= p.initiation_interval, "{}", name);
    }
}

/// `acc = (((acc + acc) + ..) + ..)`: every costed node sits on the one
/// recurrence, so no II shorter than the whole iteration is legal.
fn serial_recurrence(len: usize) -> (Trace, KernelConstraints) {
    let mut kb = KernelBuilder::new("serial");
    let zero = kb.constant("acc_init", 0);
    let l = kb.iterate("i_loop", "I", &[zero], &[], |bb| {
        let mut acc = bb.iter_arg(0);
        for k in 0..len {
            acc = bb.binary(&format!("add{}", k), BinaryOp::Add, acc, acc);
        }
        vec![acc]
    });
    kb.set_count(l, IndexExpr::Const(16));
    (kb.finish(), KernelConstraints::default())
}

#[test]
fn test_prefetch_falls_back_to_sequential() {
    let (trace, _) = serial_recurrence(4);
    let g = graph_of(&trace);
    assert_eq!(res_mii(&g, &inventory()), 2);

    let s = PrefetchScheduler.schedule(&g, &inventory()).unwrap();
    assert_eq!(s.initiation_interval, 4);
    assert_eq!(verify_schedule(&g, &s, &inventory()), Ok(()));
    let cycles = cycles_by_name(&g, &s);
    let chain: Vec<u32> = (0..4).map(|k| cycles[&format!("add{}", k)]).collect();
    assert_eq!(chain, vec![0, 1, 2, 3]);
}

#[test]
fn test_verify_counts_distance_on_carried_edges() {
    let (trace, _) = samples::staged_accumulate(256);
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    assert_eq!(verify_schedule(&g, &s, &inventory()), Ok(()));

    let e = *g.edges.iter().find(|e| e.distance == 1).unwrap();
    let ii = s.initiation_interval as i64;
    let (from, to) = (s.cycles[e.from] as i64, s.cycles[e.to] as i64);
    // Holds only through the distance term.
    assert!(to < from + e.weight as i64);
    assert!(to + ii >= from + e.weight as i64);

    // One cycle too early for the consumer breaks it.
    let mut early = s.clone();
    early.cycles[e.to] = (from + e.delay(s.initiation_interval) - 1) as u32;
    let err = verify_schedule(&g, &early, &inventory()).unwrap_err();
    assert!(err.contains("violated"), "{}", err);
    assert!(err.contains(&g.nodes[e.from].name), "{}", err);
}

// ─── Apply ─────────────────────────────────────────────────────────

#[test]
fn test_apply_schedule_annotates_body() {
    let (mut trace, _) = samples::online_softmax(64);
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    let (name, _) = body_of(&trace);
    let body: &mut Graph = trace.subgraph_mut(&name).unwrap();
    apply_schedule(body, &g, &s);

    let max = body.by_name("max").unwrap();
    let params = body[max].schedule.unwrap();
    assert_eq!(params.absolute_cycle, 4);
    assert_eq!(params.stage, 1);
    assert_eq!(params.cycle, 0);
    assert_eq!(params.initiation_interval, 4);
    assert!(body.carried_edges().is_empty());
    assert!(body.by_name("output").and_then(|o| body[o].schedule).is_none());
}

#[test]
fn test_iter_arg_takes_earliest_consumer_cycle() {
    let (mut trace, _) = samples::online_softmax(64);
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    let (name, _) = body_of(&trace);
    let body = trace.subgraph_mut(&name).unwrap();
    apply_schedule(body, &g, &s);

    // iter_arg_0 feeds max (4) and delta (5); iter_arg_1 feeds scaled_sum (7).
    let m = body.by_name("iter_arg_0").unwrap();
    let l = body.by_name("iter_arg_1").unwrap();
    assert_eq!(body[m].schedule.unwrap().absolute_cycle, 4);
    assert_eq!(body[l].schedule.unwrap().absolute_cycle, 7);

    // The adjusted placement is still a legal schedule.
    let applied = schedule_of(body, &g).unwrap();
    assert_eq!(verify_schedule(&g, &applied, &inventory()), Ok(()));
    assert_eq!(applied.num_stages(), s.num_stages());
}

#[test]
fn test_schedule_of_unannotated_body() {
    let (trace, _) = samples::gemm();
    let g = graph_of(&trace);
    let (name, _) = body_of(&trace);
    assert!(schedule_of(trace.subgraph(&name).unwrap(), &g).is_none());
}

// ─── Feasibility gate ──────────────────────────────────────────────

#[test]
fn test_gate_on_constant_trip_counts() {
    let none = KernelConstraints::default();
    let solver = BoundsSolver::default();
    assert_eq!(
        check_feasibility(&IndexExpr::Const(4), 5, &none, &solver),
        Err(SkipReason::PipelineInfeasible {
            trip_count: IndexExpr::Const(4),
            num_stages: 5
        })
    );
    assert_eq!(check_feasibility(&IndexExpr::Const(5), 5, &none, &solver), Ok(()));
    assert_eq!(
        check_feasibility(&IndexExpr::Const(100), 1, &none, &solver),
        Err(SkipReason::SingleStage)
    );
}

#[test]
fn test_gate_on_symbolic_trip_counts() {
    let solver = BoundsSolver::default();
    let trips = IndexExpr::sym("K").ceil_div(IndexExpr::Const(32));

    let none = KernelConstraints::default();
    assert!(matches!(
        check_feasibility(&trips, 3, &none, &solver),
        Err(SkipReason::AssumptionGap { .. })
    ));

    let large = KernelConstraints::default().assume(Predicate::gt(IndexExpr::sym("K"), 256));
    assert_eq!(check_feasibility(&trips, 3, &large, &solver), Ok(()));

    let small = KernelConstraints::default().assume(Predicate::new(
        IndexExpr::sym("K"),
        CmpOp::Le,
        IndexExpr::Const(64),
    ));
    assert!(matches!(
        check_feasibility(&trips, 3, &small, &solver),
        Err(SkipReason::PipelineInfeasible { .. })
    ));

    let loose = KernelConstraints::default().assume(Predicate::gt(IndexExpr::sym("K"), 0));
    assert!(matches!(
        check_feasibility(&trips, 3, &loose, &solver),
        Err(SkipReason::AssumptionGap { .. })
    ));
}

#[test]
fn test_skip_reason_messages() {
    let r = SkipReason::PipelineInfeasible {
        trip_count: IndexExpr::Const(4),
        num_stages: 5,
    };
    assert_eq!(r.to_string(), "trip count 4 cannot fill and drain 5 stages");
    let gap = SkipReason::AssumptionGap {
        trip_count: IndexExpr::sym("N"),
        num_stages: 3,
    };
    assert!(gap.to_string().contains("N > 2"));
}

// ─── Driver ────────────────────────────────────────────────────────

#[test]
fn test_mode_none_leaves_trace_alone() {
    let (mut trace, constraints) = samples::gemm();
    let before = trace.clone();
    let report = schedule_graph(
        &mut trace,
        &constraints,
        &SchedulerConfig::with_mode(SchedulingType::None),
    )
    .unwrap();
    assert_eq!(trace, before);
    assert_eq!(report.loops.len(), 1);
    assert_eq!(
        report.loops[0].decision,
        LoopDecision::Skipped(SkipReason::Disabled)
    );
    assert_eq!(report.loops[0].body, "k_loop_body");
}

#[test]
fn test_gemm_is_pipelined() {
    let (mut trace, constraints) = samples::gemm();
    let report = schedule_graph(
        &mut trace,
        &constraints,
        &SchedulerConfig::with_mode(SchedulingType::Modulo),
    )
    .unwrap();
    let l = report.loop_report("k_loop").unwrap();
    assert_eq!(l.initiation_interval, Some(4));
    assert_eq!(l.num_stages, Some(3));
    let expected = IndexExpr::sym("K")
        .ceil_div(IndexExpr::Const(32))
        .offset(-2);
    assert_eq!(
        l.decision,
        LoopDecision::Pipelined {
            kernel_trip_count: expected
        }
    );
    assert!(l.hazards.is_empty());
    assert_eq!(report.diagnostics().count(), 0);
    assert!(trace.subgraph("k_loop_body").is_none());
    assert!(trace.subgraph("k_loop_body_kernel").is_some());
}

#[test]
fn test_short_loop_keeps_schedule_metadata() {
    // 64 / 16 = 4 trips cannot fill five stages.
    let (mut trace, constraints) = samples::staged_accumulate(64);
    let report = schedule_graph(
        &mut trace,
        &constraints,
        &SchedulerConfig::with_mode(SchedulingType::Modulo),
    )
    .unwrap();
    let l = &report.loops[0];
    assert_eq!(
        l.decision,
        LoopDecision::Skipped(SkipReason::PipelineInfeasible {
            trip_count: IndexExpr::Const(4),
            num_stages: 5
        })
    );
    assert_eq!(l.diagnostics.len(), 1);
    assert!(!l.diagnostics[0].is_error());

    let body = trace.subgraph("k_loop_body").unwrap();
    let unstage = body.by_name("unstage").unwrap();
    assert_eq!(body[unstage].schedule.unwrap().stage, 2);
    assert!(trace.root.by_name("k_loop").is_some());
}

#[test]
fn test_unknown_loop_is_an_error() {
    let (mut trace, _) = samples::staged_accumulate(256);
    let before = trace.clone();
    let err = schedule_graph(
        &mut trace,
        &KernelConstraints::default(),
        &SchedulerConfig::with_mode(SchedulingType::Modulo),
    )
    .unwrap_err();
    assert!(matches!(err, ScheduleError::UnknownLoop { ref axis, .. } if axis == "K"));
    assert_eq!(trace, before);
}

#[test]
fn test_scheduling_failure_leaves_trace_unchanged() {
    let (mut trace, constraints) = samples::gemm();
    let before = trace.clone();
    let config = SchedulerConfig {
        max_initiation_interval: 2,
        ..SchedulerConfig::with_mode(SchedulingType::Modulo)
    };
    let err = schedule_graph(&mut trace, &constraints, &config).unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::SchedulingFailure { max_ii: 2, .. }
    ));
    assert_eq!(trace, before);
}

#[test]
fn test_invalid_hardware_is_rejected() {
    let (mut trace, constraints) = samples::gemm();
    let mut hw = HardwareConfig::cdna3();
    hw.inventory = ResourceVector::ZERO;
    let config = SchedulerConfig::with_mode(SchedulingType::Modulo).with_hardware(hw);
    assert!(matches!(
        schedule_graph(&mut trace, &constraints, &config),
        Err(ScheduleError::Config(_))
    ));
}

// ─── Artifacts and dumps ───────────────────────────────────────────

#[test]
fn test_artifact_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("gemm.json");
    let (trace, _) = samples::gemm();
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    dump_schedule(&path, "k_loop", &g, &s).unwrap();

    let artifact = read_artifact(&path).unwrap();
    assert_eq!(artifact.loop_name, "k_loop");
    assert_eq!(artifact.num_stages, 3);
    assert_eq!(artifact.reservations.len(), 4);
    assert_eq!(artifact.fingerprint, g.fingerprint());
    assert_eq!(load_schedule(&path, &g, &inventory()).unwrap(), s);
}

#[test]
fn test_tampered_artifact_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gemm.json");
    let (trace, _) = samples::gemm();
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();
    dump_schedule(&path, "k_loop", &g, &s).unwrap();

    let mut artifact = read_artifact(&path).unwrap();
    artifact.nodes[0].name = "renamed".to_string();
    std::fs::write(&path, serde_json::to_string(&artifact).unwrap()).unwrap();
    assert!(matches!(
        load_schedule(&path, &g, &inventory()),
        Err(ScheduleError::MalformedScheduleFile { .. })
    ));

    // Cycles that break a dependence are caught too.
    let mut artifact = ScheduleArtifact::new("k_loop", &g, &s);
    let mma = g.nodes.iter().position(|n| n.name == "mma").unwrap();
    artifact.nodes[mma].cycle = 0;
    std::fs::write(&path, serde_json::to_string(&artifact).unwrap()).unwrap();
    assert!(matches!(
        load_schedule(&path, &g, &inventory()),
        Err(ScheduleError::MalformedScheduleFile { .. })
    ));

    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        load_schedule(&path, &g, &inventory()),
        Err(ScheduleError::MalformedScheduleFile { .. })
    ));
}

#[test]
fn test_override_replays_dumped_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("{loop}.json");

    let (mut first, constraints) = samples::online_softmax(64);
    let dump = SchedulerConfig {
        dump_schedule: Some(template.clone()),
        ..SchedulerConfig::with_mode(SchedulingType::Modulo)
    };
    schedule_graph(&mut first, &constraints, &dump).unwrap();
    assert!(dir.path().join("n_loop_body.json").exists());

    let (mut second, _) = samples::online_softmax(64);
    let replay = SchedulerConfig {
        override_schedule: Some(template),
        ..SchedulerConfig::with_mode(SchedulingType::Modulo)
    };
    schedule_graph(&mut second, &constraints, &replay).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_override_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let (mut trace, constraints) = samples::gemm();
    let config = SchedulerConfig {
        override_schedule: Some(dir.path().join("absent.json")),
        ..SchedulerConfig::with_mode(SchedulingType::Modulo)
    };
    assert!(matches!(
        schedule_graph(&mut trace, &constraints, &config),
        Err(ScheduleError::Io { .. })
    ));
}

#[test]
fn test_visualization_output() {
    let (trace, _) = samples::gemm();
    let g = graph_of(&trace);
    let s = modulo().schedule(&g, &inventory()).unwrap();

    let dot = to_dot(&g, &s);
    assert!(dot.starts_with("digraph \"k_loop_body\""));
    assert!(dot.contains("style=dashed"));
    assert!(dot.contains("style=dotted"));

    let table = reservation_table(&g, &s, &inventory());
    // Title, header, one row per phase.
    assert_eq!(table.lines().count(), 2 + 4);
    assert!(table.contains("mma@8"));

    let dir = tempfile::tempdir().unwrap();
    let written = write_visualization(dir.path(), &g, &s, &inventory()).unwrap();
    assert_eq!(written.len(), 2);
    assert!(written.iter().all(|p| p.exists()));
}
