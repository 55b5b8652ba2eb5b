use std::collections::BTreeMap;

use super::builder::KernelBuilder;
use super::samples;
use super::*;

fn env(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

// ─── IndexExpr ─────────────────────────────────────────────────────

#[test]
fn test_simplify_folds_constants() {
    let e = IndexExpr::Const(3).add(IndexExpr::Const(4)).mul(IndexExpr::Const(2));
    assert_eq!(e, IndexExpr::Const(14));
    assert_eq!(IndexExpr::Const(7).ceil_div(IndexExpr::Const(2)), IndexExpr::Const(4));
    assert_eq!(IndexExpr::Const(-7).floor_div(IndexExpr::Const(2)), IndexExpr::Const(-4));
    assert_eq!(IndexExpr::Const(-1).modulo(IndexExpr::Const(3)), IndexExpr::Const(2));
}

#[test]
fn test_simplify_drops_identities() {
    let x = IndexExpr::sym("x");
    assert_eq!(x.clone().add(IndexExpr::Const(0)), x);
    assert_eq!(x.clone().mul(IndexExpr::Const(1)), x);
    assert_eq!(x.clone().mul(IndexExpr::Const(0)), IndexExpr::Const(0));
    assert_eq!(x.clone().floor_div(IndexExpr::Const(1)), x);
    assert_eq!(x.clone().modulo(IndexExpr::Const(1)), IndexExpr::Const(0));
}

#[test]
fn test_offsets_reassociate() {
    let x = IndexExpr::sym("x");
    let e = x.clone().offset(3).offset(-1);
    assert_eq!(e, x.clone().offset(2));
    assert_eq!(IndexExpr::Const(5).add(x.clone()), x.offset(5));
}

#[test]
fn test_display() {
    let n = IndexExpr::sym("N");
    assert_eq!(n.clone().offset(-2).to_string(), "(N - 2)");
    assert_eq!(n.clone().sub(IndexExpr::sym("M")).to_string(), "(N - M)");
    assert_eq!(
        n.clone().ceil_div(IndexExpr::sym("T")).to_string(),
        "ceiling(N/T)"
    );
    assert_eq!(n.modulo(IndexExpr::Const(3)).to_string(), "(N mod 3)");
}

#[test]
fn test_substitution_and_eval() {
    let e = IndexExpr::sym("K").ceil_div(IndexExpr::sym("BLOCK_K"));
    let values = env(&[("BLOCK_K", 32)]);
    let partial = e.subs_values(&values);
    assert_eq!(
        partial.free_symbols().into_iter().collect::<Vec<_>>(),
        vec!["K".to_string()]
    );
    assert_eq!(partial.eval(&env(&[("K", 100)])), Some(4));
    assert_eq!(partial.eval(&BTreeMap::new()), None);

    let iv = IndexExpr::sym("$K").mul(IndexExpr::Const(32));
    let at_three = iv.subs_sym("$K", &IndexExpr::Const(3));
    assert_eq!(at_three, IndexExpr::Const(96));
    let shifted = iv.subs_sym("$K", &IndexExpr::sym("$K").offset(2));
    assert_eq!(shifted.eval(&env(&[("$K", 1)])), Some(96));
}

#[test]
fn test_eval_rejects_division_by_zero() {
    let e = IndexExpr::sym("a").floor_div(IndexExpr::sym("b"));
    assert_eq!(e.eval(&env(&[("a", 4), ("b", 0)])), None);
}

#[test]
fn test_folding_stops_at_overflow() {
    let max = IndexExpr::Const(i64::MAX);
    let sum = max.clone().offset(1);
    assert!(!sum.is_const());
    assert_eq!(sum.eval(&BTreeMap::new()), None);
    assert!(!max.clone().mul(IndexExpr::Const(2)).is_const());
    assert!(!IndexExpr::Const(i64::MIN).floor_div(IndexExpr::Const(-1)).is_const());
    assert!(!IndexExpr::Const(i64::MIN).modulo(IndexExpr::Const(-1)).is_const());
    assert!(!IndexExpr::Const(i64::MIN).ceil_div(IndexExpr::Const(-1)).is_const());

    // (x + MAX) + 1 keeps both constants apart.
    let e = IndexExpr::sym("x").add(max).offset(1);
    assert_eq!(e.eval(&env(&[("x", -5)])), Some(i64::MAX - 4));

    // A huge hyperparameter times the tile size.
    let count = IndexExpr::sym("K").mul(IndexExpr::Const(32));
    let bound = count.subs_values(&env(&[("K", i64::MAX / 2)]));
    assert!(!bound.is_const());
    assert_eq!(bound.eval(&BTreeMap::new()), None);
}

#[test]
fn test_display_of_most_negative_offset() {
    let e = IndexExpr::sym("x").add(IndexExpr::Const(i64::MIN));
    assert_eq!(e.to_string(), "(x - 9223372036854775808)");
}

// ─── Graph ─────────────────────────────────────────────────────────

#[test]
fn test_arena_handles_survive_erase() {
    let mut g = Graph::new();
    let a = g.add(Node::new("a", OpKind::Constant { value: 1 }, vec![]));
    let b = g.add(Node::new("b", OpKind::Constant { value: 2 }, vec![]));
    let c = g.add(Node::new("c", OpKind::Binary { op: BinaryOp::Add }, vec![a, b]));
    g.erase(b);
    assert!(!g.contains(b));
    assert_eq!(g.len(), 2);
    let d = g.add(Node::new("d", OpKind::Constant { value: 3 }, vec![]));
    assert_ne!(d, b);
    assert_eq!(g[c].args, vec![a, b]);
    assert!(g.validate("g").is_err());
}

#[test]
fn test_insert_before_and_after() {
    let mut g = Graph::new();
    let a = g.add(Node::new("a", OpKind::Constant { value: 1 }, vec![]));
    let c = g.add(Node::new("c", OpKind::Constant { value: 3 }, vec![]));
    let b = g.insert_before(c, Node::new("b", OpKind::Constant { value: 2 }, vec![]));
    let d = g.insert_after(c, Node::new("d", OpKind::Constant { value: 4 }, vec![]));
    assert_eq!(g.ids(), &[a, b, c, d]);
}

#[test]
fn test_users_and_replace() {
    let mut g = Graph::new();
    let a = g.add(Node::new("a", OpKind::Constant { value: 1 }, vec![]));
    let b = g.add(Node::new("b", OpKind::Constant { value: 2 }, vec![]));
    let c = g.add(Node::new("c", OpKind::Binary { op: BinaryOp::Mul }, vec![a, a]));
    assert_eq!(g.users(a), vec![c]);
    g.replace_all_uses(a, b);
    assert_eq!(g[c].args, vec![b, b]);
    assert!(g.users(a).is_empty());
}

#[test]
fn test_validate_rejects_use_before_def() {
    let mut g = Graph::new();
    let a = g.add(Node::new("a", OpKind::Constant { value: 1 }, vec![]));
    let b = g.insert_before(a, Node::new("b", OpKind::Unary { op: UnaryOp::Neg }, vec![a]));
    let err = g.validate("body").unwrap_err();
    assert!(err.to_string().contains("before it is defined"), "got: {}", err);
    let _ = b;
}

#[test]
fn test_compact_copy_maps_back() {
    let mut g = Graph::new();
    let a = g.add(Node::new("a", OpKind::Constant { value: 1 }, vec![]));
    let dead = g.add(Node::new("dead", OpKind::Constant { value: 9 }, vec![]));
    let c = g.add(Node::new("c", OpKind::Unary { op: UnaryOp::Neg }, vec![a]));
    g.erase(dead);
    let (copy, back) = g.compact_copy();
    assert_eq!(copy.len(), 2);
    assert_eq!(back, vec![a, c]);
    assert_eq!(copy[NodeId(1)].args, vec![NodeId(0)]);
    assert_eq!(copy[NodeId(1)].name, "c");
}

#[test]
fn test_builder_closes_loop() {
    let (trace, _) = samples::gemm();
    trace.validate().unwrap();
    let body = trace.subgraph("k_loop_body").unwrap();
    let carried = body.carried_edges();
    assert_eq!(carried.len(), 1);
    let mma = body.by_name("mma").unwrap();
    assert_eq!(carried[0].from, mma);
    assert_eq!(carried[0].to, body.iter_args()[0]);
    assert_eq!(carried[0].distance, 1);
}

#[test]
fn test_trace_validate_checks_output_arity() {
    let mut kb = KernelBuilder::new("bad");
    let zero = kb.constant("z", 0);
    let it = kb.iterate("loop", "K", &[zero], &[], |bb| vec![bb.iter_arg(0)]);
    let _ = it;
    let mut trace = kb.finish();
    trace.validate().unwrap();
    let body = trace.subgraph_mut("loop_body").unwrap();
    let out = body.output().unwrap();
    body[out].args.clear();
    assert!(trace.validate().is_err());
}

#[test]
fn test_trace_validate_checks_capture_bounds() {
    let mut kb = KernelBuilder::new("bad");
    let zero = kb.constant("z", 0);
    kb.iterate("loop", "K", &[zero], &[], |bb| {
        let stray = bb.node("stray", OpKind::Placeholder { capture: 3 }, vec![]);
        let v = bb.binary("add", BinaryOp::Add, stray, bb.iter_arg(0));
        vec![v]
    });
    let err = kb.finish().validate().unwrap_err();
    assert!(err.to_string().contains("refers past the loop operands"), "got: {}", err);
}

#[test]
fn test_trace_json_round_trip() {
    let (trace, constraints) = samples::online_softmax(8);
    let text = serde_json::to_string(&trace).unwrap();
    let back: Trace = serde_json::from_str(&text).unwrap();
    assert_eq!(back, trace);
    let text = serde_json::to_string(&constraints).unwrap();
    let back: crate::constraints::KernelConstraints = serde_json::from_str(&text).unwrap();
    assert_eq!(back, constraints);
}

#[test]
fn test_trace_display() {
    let (trace, _) = samples::staged_accumulate(64);
    let text = trace.to_string();
    assert!(text.starts_with("kernel staged_accumulate:"));
    assert!(text.contains("k_loop_body:"));
    assert!(text.contains("\"accumulate\" Add"));
    assert!(text.contains("carried"));
}

#[test]
fn test_builtins_resolve() {
    for name in samples::BUILTINS {
        let (trace, _) = samples::builtin(name).unwrap();
        trace.validate().unwrap();
        assert_eq!(trace.loops().len(), 1);
    }
    assert!(samples::builtin("conv").is_none());
}

#[test]
fn test_mma_latency_scale_is_exhaustive() {
    let shapes = [
        MmaShape::F32_16x16x16_F16,
        MmaShape::F32_32x32x8_F16,
        MmaShape::F32_16x16x32_F8,
        MmaShape::F32_32x32x16_F8,
        MmaShape::I32_16x16x32_I8,
    ];
    for shape in shapes {
        let (m, n, _) = shape.dims();
        assert_eq!(shape.latency_scale(), if m == 32 && n == 32 { 2 } else { 1 });
    }
}
