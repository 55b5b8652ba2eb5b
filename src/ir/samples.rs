//! Reference kernels.
//!
//! Small traced kernels used by the CLI's `--builtin` option, the
//! integration tests and the benches. Each returns the trace together with
//! the constraints a frontend would have attached to it.

use super::builder::KernelBuilder;
use super::*;
use crate::constraints::{KernelConstraints, Predicate};

/// Names accepted by [`builtin`].
pub const BUILTINS: &[&str] = &["gemm", "staged_accumulate", "online_softmax"];

pub fn builtin(name: &str) -> Option<(Trace, KernelConstraints)> {
    match name {
        "gemm" => Some(gemm()),
        "staged_accumulate" => Some(staged_accumulate(256)),
        "online_softmax" => Some(online_softmax(64)),
        _ => None,
    }
}

/// Tiled GEMM main loop: global loads of A and B staged through shared
/// memory, then one MMA accumulating into the carried tile.
///
/// `K` is symbolic; the author asserts `K > 256`, which makes the loop's
/// `ceiling(K/BLOCK_K)` trip count provably large enough for deep pipelines.
pub fn gemm() -> (Trace, KernelConstraints) {
    let mut kb = KernelBuilder::new("gemm");
    let a = kb.argument("a", AddressSpace::Global);
    let b = kb.argument("b", AddressSpace::Global);
    let c = kb.argument("c", AddressSpace::Global);
    let block_m = IndexExpr::sym("BLOCK_M");
    let block_n = IndexExpr::sym("BLOCK_N");
    let block_k = IndexExpr::sym("BLOCK_K");
    let a_shared = kb.allocate("a_shared", vec![block_m.clone(), block_k.clone()]);
    let b_shared = kb.allocate("b_shared", vec![block_n.clone(), block_k.clone()]);
    let zero = kb.constant("acc_init", 0);

    let k_tile = block_k.clone();
    let k_loop = kb.iterate("k_loop", "K", &[zero], &[a, b, a_shared, b_shared], |bb| {
        let k = bb.induction().mul(k_tile.clone());
        let wg_m = IndexExpr::sym("$WG0").mul(IndexExpr::sym("BLOCK_M"));
        let wg_n = IndexExpr::sym("$WG1").mul(IndexExpr::sym("BLOCK_N"));
        let origin = vec![IndexExpr::Const(0), IndexExpr::Const(0)];

        let ga = bb.read("read_a", bb.capture(0), AddressSpace::Global, vec![wg_m, k.clone()]);
        let gb = bb.read("read_b", bb.capture(1), AddressSpace::Global, vec![wg_n, k]);
        bb.write("write_a_shared", ga, bb.capture(2), AddressSpace::Shared, origin.clone());
        bb.write("write_b_shared", gb, bb.capture(3), AddressSpace::Shared, origin.clone());
        let sa = bb.read("read_a_shared", bb.capture(2), AddressSpace::Shared, origin.clone());
        let sb = bb.read("read_b_shared", bb.capture(3), AddressSpace::Shared, origin);
        let acc = bb.iter_arg(0);
        let mma = bb.mma("mma", sa, sb, acc, MmaShape::F32_16x16x16_F16);
        vec![mma]
    });
    let result = kb.get_result("acc", k_loop, 0);
    kb.node(
        "write_c",
        OpKind::Write {
            space: AddressSpace::Global,
            index: vec![
                IndexExpr::sym("$WG0").mul(IndexExpr::sym("BLOCK_M")),
                IndexExpr::sym("$WG1").mul(IndexExpr::sym("BLOCK_N")),
            ],
            elements_per_thread: 8,
        },
        vec![result, c],
    );

    let constraints = KernelConstraints::default()
        .tile("K", block_k)
        .assume(Predicate::gt(IndexExpr::sym("K"), 256))
        .set("BLOCK_M", 64)
        .set("BLOCK_N", 64)
        .set("BLOCK_K", 32);
    (kb.finish(), constraints)
}

/// A loop that stages a captured value through shared memory and
/// accumulates what it reads back. On a target where everything fits in
/// one cycle the write lands in stage 0 and the read two stages later.
pub fn staged_accumulate(k: i64) -> (Trace, KernelConstraints) {
    let mut kb = KernelBuilder::new("staged_accumulate");
    let staging = kb.allocate("staging", vec![IndexExpr::Const(64)]);
    let seed = kb.constant("seed", 1);
    let zero = kb.constant("sum_init", 0);

    let k_loop = kb.iterate("k_loop", "K", &[zero], &[staging, seed], |bb| {
        let slot = vec![IndexExpr::Const(0)];
        bb.write("stage", bb.capture(1), bb.capture(0), AddressSpace::Shared, slot.clone());
        let v = bb.read("unstage", bb.capture(0), AddressSpace::Shared, slot);
        let sum = bb.binary("accumulate", BinaryOp::Add, v, bb.iter_arg(0));
        vec![sum]
    });
    kb.get_result("sum", k_loop, 0);

    let constraints = KernelConstraints::default()
        .tile("K", IndexExpr::sym("BLOCK_K"))
        .set("K", k)
        .set("BLOCK_K", 16);
    (kb.finish(), constraints)
}

/// Online softmax statistics over `n` tiles: a running max and a running
/// rescaled sum, two carried values with recurrences of different length.
pub fn online_softmax(n: i64) -> (Trace, KernelConstraints) {
    let mut kb = KernelBuilder::new("online_softmax");
    let x = kb.argument("x", AddressSpace::Global);
    let m_init = kb.constant("max_init", i64::MIN);
    let l_init = kb.constant("sum_init", 0);

    let n_loop = kb.iterate("n_loop", "N", &[m_init, l_init], &[x], |bb| {
        let idx = vec![bb.induction()];
        let v = bb.read("read_x", bb.capture(0), AddressSpace::Global, idx);
        let m = bb.iter_arg(0);
        let l = bb.iter_arg(1);
        let m_new = bb.binary("max", BinaryOp::Max, m, v);
        let shifted = bb.binary("shift", BinaryOp::Sub, v, m_new);
        let p = bb.unary("exp", UnaryOp::Exp2, shifted);
        let delta = bb.binary("delta", BinaryOp::Sub, m, m_new);
        let scale = bb.unary("rescale", UnaryOp::Exp2, delta);
        let l_scaled = bb.binary("scaled_sum", BinaryOp::Mul, l, scale);
        let l_new = bb.binary("sum", BinaryOp::Add, l_scaled, p);
        vec![m_new, l_new]
    });
    kb.set_count(n_loop, IndexExpr::Const(n));
    kb.get_result("row_max", n_loop, 0);
    kb.get_result("row_sum", n_loop, 1);

    (kb.finish(), KernelConstraints::default())
}
