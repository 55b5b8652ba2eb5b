//! Kernel constraints consumed by the scheduler.
//!
//! The symbolic constraint system of the frontend is reduced here to the
//! three things pipelining needs: how many times each loop runs, the
//! concrete hyperparameter values, and the author's boolean assumptions.

mod implies;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::IndexExpr;
pub use implies::*;

// ─── Tiling ───────────────────────────────────────────────────────

/// Tiles dimension `dim` by `tile_size`; the loop over `dim` runs
/// `iters` times if given, else `ceil(dim / tile_size)` times.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingConstraint {
    pub dim: String,
    pub tile_size: IndexExpr,
    #[serde(default)]
    pub iters: Option<IndexExpr>,
}

impl TilingConstraint {
    pub fn new(dim: &str, tile_size: IndexExpr) -> Self {
        Self {
            dim: dim.to_string(),
            tile_size,
            iters: None,
        }
    }

    pub fn count(&self) -> IndexExpr {
        match &self.iters {
            Some(iters) => iters.clone(),
            None => IndexExpr::sym(self.dim.clone()).ceil_div(self.tile_size.clone()),
        }
    }
}

// ─── Predicates ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl CmpOp {
    pub fn holds(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
        }
    }

    /// The operator with its operands swapped: a < b ⟺ b > a.
    pub fn flipped(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            CmpOp::Eq => CmpOp::Eq,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
        }
    }
}

/// A boolean comparison between two index expressions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Predicate {
    pub lhs: IndexExpr,
    pub op: CmpOp,
    pub rhs: IndexExpr,
}

impl Predicate {
    pub fn new(lhs: IndexExpr, op: CmpOp, rhs: IndexExpr) -> Self {
        Self { lhs, op, rhs }
    }

    pub fn gt(lhs: IndexExpr, rhs: impl Into<IndexExpr>) -> Self {
        Self::new(lhs, CmpOp::Gt, rhs.into())
    }

    pub fn subs_values(&self, values: &BTreeMap<String, i64>) -> Predicate {
        Predicate {
            lhs: self.lhs.subs_values(values),
            op: self.op,
            rhs: self.rhs.subs_values(values),
        }
    }

    pub fn eval(&self, env: &BTreeMap<String, i64>) -> Option<bool> {
        Some(self.op.holds(self.lhs.eval(env)?, self.rhs.eval(env)?))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.op.symbol(), self.rhs)
    }
}

// ─── Kernel constraints ───────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConstraints {
    #[serde(default)]
    pub tiling: Vec<TilingConstraint>,
    #[serde(default)]
    pub assumptions: Vec<Predicate>,
    /// Concrete values for problem and tile sizes known at compile time.
    #[serde(default)]
    pub hyperparams: BTreeMap<String, i64>,
}

impl KernelConstraints {
    pub fn tile(mut self, dim: &str, tile_size: IndexExpr) -> Self {
        self.tiling.push(TilingConstraint::new(dim, tile_size));
        self
    }

    pub fn assume(mut self, predicate: Predicate) -> Self {
        self.assumptions.push(predicate);
        self
    }

    pub fn set(mut self, name: &str, value: i64) -> Self {
        self.hyperparams.insert(name.to_string(), value);
        self
    }

    pub fn tiling_for(&self, axis: &str) -> Option<&TilingConstraint> {
        self.tiling.iter().find(|t| t.dim == axis)
    }

    /// Trip count of the loop over `axis`, with hyperparameters substituted.
    /// An explicit loop count takes precedence over the tiling constraint.
    pub fn trip_count(&self, axis: &str, explicit: Option<&IndexExpr>) -> Option<IndexExpr> {
        let count = match explicit {
            Some(count) => count.clone(),
            None => self.tiling_for(axis)?.count(),
        };
        Some(count.subs_values(&self.hyperparams))
    }

    /// Assumptions with hyperparameters substituted; tautologies dropped.
    pub fn effective_assumptions(&self) -> Vec<Predicate> {
        self.assumptions
            .iter()
            .map(|a| a.subs_values(&self.hyperparams))
            .filter(|a| !(a.lhs.is_const() && a.rhs.is_const()))
            .collect()
    }
}
