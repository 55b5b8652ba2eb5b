//! Implication queries over index-expression predicates.
//!
//! Proves `assumptions ⟹ goal` in two steps:
//!
//! 1. **Bounds propagation**: every assumption of the form `sym op const`
//!    (or `const op sym`) narrows that symbol's interval; the goal's
//!    `lhs - rhs` is then evaluated by interval arithmetic. A sign-definite
//!    result decides the query.
//!
//! 2. **Bounded enumeration**: if the intervals are all finite and their
//!    product is small, every assignment satisfying all assumptions is
//!    checked against the goal.
//!
//! Anything else is `Unknown`; callers treat it like `False`.

use std::collections::BTreeMap;

use super::{CmpOp, Predicate};
use crate::ir::expr::ceil_div;
use crate::ir::IndexExpr;

/// Three-valued answer of an implication query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

/// Capability to decide `assumptions ⟹ goal`.
pub trait Implication {
    fn implies(&self, assumptions: &[Predicate], goal: &Predicate) -> Truth;
}

// ─── Intervals ─────────────────────────────────────────────────────

/// Closed integer interval; `None` bounds are infinite.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub lo: Option<i64>,
    pub hi: Option<i64>,
}

impl Interval {
    pub const FULL: Interval = Interval { lo: None, hi: None };

    pub fn point(v: i64) -> Self {
        Interval {
            lo: Some(v),
            hi: Some(v),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!((self.lo, self.hi), (Some(lo), Some(hi)) if lo > hi)
    }

    fn nonneg(&self) -> bool {
        self.lo.is_some_and(|lo| lo >= 0)
    }

    fn narrow_lo(&mut self, v: i64) {
        self.lo = Some(self.lo.map_or(v, |lo| lo.max(v)));
    }

    fn narrow_hi(&mut self, v: i64) {
        self.hi = Some(self.hi.map_or(v, |hi| hi.min(v)));
    }

    fn add(self, o: Interval) -> Interval {
        Interval {
            lo: self.lo.zip(o.lo).and_then(|(a, b)| a.checked_add(b)),
            hi: self.hi.zip(o.hi).and_then(|(a, b)| a.checked_add(b)),
        }
    }

    fn scale(self, k: i64) -> Interval {
        let lo = self.lo.and_then(|v| v.checked_mul(k));
        let hi = self.hi.and_then(|v| v.checked_mul(k));
        if k >= 0 {
            Interval { lo, hi }
        } else {
            Interval { lo: hi, hi: lo }
        }
    }

    fn mul(self, o: Interval) -> Interval {
        if let (Some(a), Some(b)) = (self.lo, self.hi) {
            if a == b {
                return o.scale(a);
            }
        }
        if let (Some(a), Some(b)) = (o.lo, o.hi) {
            if a == b {
                return self.scale(a);
            }
        }
        if self.nonneg() && o.nonneg() {
            return Interval {
                lo: self.lo.zip(o.lo).and_then(|(a, b)| a.checked_mul(b)),
                hi: self.hi.zip(o.hi).and_then(|(a, b)| a.checked_mul(b)),
            };
        }
        match (self.lo, self.hi, o.lo, o.hi) {
            (Some(a), Some(b), Some(c), Some(d)) => {
                let corners = [a.checked_mul(c), a.checked_mul(d), b.checked_mul(c), b.checked_mul(d)];
                if corners.iter().any(|c| c.is_none()) {
                    return Interval::FULL;
                }
                let corners: Vec<i64> = corners.iter().flatten().copied().collect();
                Interval {
                    lo: corners.iter().min().copied(),
                    hi: corners.iter().max().copied(),
                }
            }
            _ => Interval::FULL,
        }
    }

    /// Division by a strictly positive divisor interval; both floor and
    /// ceil are monotone in the numerator and antitone in the divisor for
    /// non-negative numerators.
    fn div(self, o: Interval, round: fn(i64, i64) -> Option<i64>) -> Interval {
        let (Some(c), d) = (o.lo, o.hi) else {
            return Interval::FULL;
        };
        if c <= 0 {
            return Interval::FULL;
        }
        if d == Some(c) {
            return Interval {
                lo: self.lo.and_then(|a| round(a, c)),
                hi: self.hi.and_then(|b| round(b, c)),
            };
        }
        if !self.nonneg() {
            return Interval::FULL;
        }
        Interval {
            lo: match (self.lo, d) {
                (Some(a), Some(d)) => round(a, d),
                _ => Some(0),
            },
            hi: self.hi.and_then(|b| round(b, c)),
        }
    }

    fn modulo(self, o: Interval) -> Interval {
        match (o.lo, o.hi) {
            (Some(m), Some(m2)) if m == m2 && m > 0 => {
                if let (Some(a), Some(b)) = (self.lo, self.hi) {
                    if a == b {
                        return Interval::point(a.rem_euclid(m));
                    }
                }
                Interval {
                    lo: Some(0),
                    hi: Some(m - 1),
                }
            }
            _ => Interval::FULL,
        }
    }
}

/// Interval of `expr` given per-symbol intervals.
pub fn interval_of(expr: &IndexExpr, bounds: &BTreeMap<String, Interval>) -> Interval {
    match expr {
        IndexExpr::Const(v) => Interval::point(*v),
        IndexExpr::Sym(name) => bounds.get(name).copied().unwrap_or(Interval::FULL),
        IndexExpr::Add(a, b) => interval_of(a, bounds).add(interval_of(b, bounds)),
        IndexExpr::Mul(a, b) => interval_of(a, bounds).mul(interval_of(b, bounds)),
        IndexExpr::FloorDiv(a, b) => {
            interval_of(a, bounds).div(interval_of(b, bounds), i64::checked_div_euclid)
        }
        IndexExpr::CeilDiv(a, b) => interval_of(a, bounds).div(interval_of(b, bounds), ceil_div),
        IndexExpr::Mod(a, b) => interval_of(a, bounds).modulo(interval_of(b, bounds)),
    }
}

/// Per-symbol intervals implied by `sym op const` assumptions.
pub fn symbol_bounds(assumptions: &[Predicate]) -> BTreeMap<String, Interval> {
    let mut bounds: BTreeMap<String, Interval> = BTreeMap::new();
    for a in assumptions {
        let (name, op, value) = match (&a.lhs, &a.rhs) {
            (IndexExpr::Sym(name), rhs) => match rhs.as_const() {
                Some(v) => (name, a.op, v),
                None => continue,
            },
            (lhs, IndexExpr::Sym(name)) => match lhs.as_const() {
                Some(v) => (name, a.op.flipped(), v),
                None => continue,
            },
            _ => continue,
        };
        let entry = bounds.entry(name.clone()).or_insert(Interval::FULL);
        match op {
            CmpOp::Gt => entry.narrow_lo(value.saturating_add(1)),
            CmpOp::Ge => entry.narrow_lo(value),
            CmpOp::Lt => entry.narrow_hi(value.saturating_sub(1)),
            CmpOp::Le => entry.narrow_hi(value),
            CmpOp::Eq => {
                entry.narrow_lo(value);
                entry.narrow_hi(value);
            }
        }
    }
    bounds
}

// ─── Solver ────────────────────────────────────────────────────────

/// Interval-propagation solver with a bounded enumeration fallback.
#[derive(Clone, Debug)]
pub struct BoundsSolver {
    /// Maximum number of assignments tried by enumeration.
    pub enumeration_limit: u64,
}

impl Default for BoundsSolver {
    fn default() -> Self {
        Self {
            enumeration_limit: 1 << 16,
        }
    }
}

impl BoundsSolver {
    fn decide_by_intervals(&self, goal: &Predicate, bounds: &BTreeMap<String, Interval>) -> Truth {
        let diff = interval_of(&goal.lhs.clone().sub(goal.rhs.clone()), bounds);
        // The sign of lhs - rhs decides the comparison.
        let (always, never) = match goal.op {
            CmpOp::Gt => (diff.lo.is_some_and(|l| l > 0), diff.hi.is_some_and(|h| h <= 0)),
            CmpOp::Ge => (diff.lo.is_some_and(|l| l >= 0), diff.hi.is_some_and(|h| h < 0)),
            CmpOp::Lt => (diff.hi.is_some_and(|h| h < 0), diff.lo.is_some_and(|l| l >= 0)),
            CmpOp::Le => (diff.hi.is_some_and(|h| h <= 0), diff.lo.is_some_and(|l| l > 0)),
            CmpOp::Eq => (
                diff.lo == Some(0) && diff.hi == Some(0),
                diff.lo.is_some_and(|l| l > 0) || diff.hi.is_some_and(|h| h < 0),
            ),
        };
        if always {
            Truth::True
        } else if never {
            Truth::False
        } else {
            Truth::Unknown
        }
    }

    fn decide_by_enumeration(
        &self,
        assumptions: &[Predicate],
        goal: &Predicate,
        bounds: &BTreeMap<String, Interval>,
    ) -> Truth {
        let mut symbols = goal.lhs.free_symbols();
        symbols.extend(goal.rhs.free_symbols());
        let mut ranges: Vec<(String, i64, i64)> = Vec::new();
        let mut total: u64 = 1;
        for name in symbols {
            let Some(Interval {
                lo: Some(lo),
                hi: Some(hi),
            }) = bounds.get(&name).copied()
            else {
                return Truth::Unknown;
            };
            if lo > hi {
                return Truth::Unknown;
            }
            let width = (hi - lo) as u64 + 1;
            total = match total.checked_mul(width) {
                Some(t) if t <= self.enumeration_limit => t,
                _ => return Truth::Unknown,
            };
            ranges.push((name, lo, hi));
        }

        let mut env: BTreeMap<String, i64> = ranges.iter().map(|(n, lo, _)| (n.clone(), *lo)).collect();
        let mut saw_true = false;
        let mut saw_false = false;
        loop {
            let consistent = assumptions
                .iter()
                .all(|a| a.eval(&env).unwrap_or(true));
            if consistent {
                match goal.eval(&env) {
                    Some(true) => saw_true = true,
                    Some(false) => saw_false = true,
                    None => return Truth::Unknown,
                }
                if saw_true && saw_false {
                    return Truth::Unknown;
                }
            }
            // Odometer step over the symbol ranges.
            let mut advanced = false;
            for (name, lo, hi) in &ranges {
                let v = env.get_mut(name).map(|v| {
                    *v += 1;
                    *v
                });
                if v.is_some_and(|v| v <= *hi) {
                    advanced = true;
                    break;
                }
                env.insert(name.clone(), *lo);
            }
            if !advanced {
                break;
            }
        }
        match (saw_true, saw_false) {
            (true, false) => Truth::True,
            (false, true) => Truth::False,
            _ => Truth::Unknown,
        }
    }
}

impl Implication for BoundsSolver {
    fn implies(&self, assumptions: &[Predicate], goal: &Predicate) -> Truth {
        let bounds = symbol_bounds(assumptions);
        if bounds.values().any(Interval::is_empty) {
            // Contradictory assumptions prove nothing useful.
            return Truth::Unknown;
        }
        match self.decide_by_intervals(goal, &bounds) {
            Truth::Unknown => self.decide_by_enumeration(assumptions, goal, &bounds),
            decided => decided,
        }
    }
}
