//! Symbolic index expressions.
//!
//! Trip counts, memory indices and author assumptions are all expressed
//! over the same small integer algebra. Expressions stay symbolic until a
//! hyperparameter substitution or an iteration index makes them concrete.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// A symbolic integer expression.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexExpr {
    /// A concrete constant.
    Const(i64),
    /// A named symbol (problem size, tile size, induction variable).
    Sym(String),
    /// a + b
    Add(Box<IndexExpr>, Box<IndexExpr>),
    /// a * b
    Mul(Box<IndexExpr>, Box<IndexExpr>),
    /// floor(a / b)
    FloorDiv(Box<IndexExpr>, Box<IndexExpr>),
    /// ceil(a / b)
    CeilDiv(Box<IndexExpr>, Box<IndexExpr>),
    /// a mod b, result carries the sign of b (Euclidean for positive b).
    Mod(Box<IndexExpr>, Box<IndexExpr>),
}

impl IndexExpr {
    pub fn sym(name: impl Into<String>) -> Self {
        IndexExpr::Sym(name.into())
    }

    pub fn is_const(&self) -> bool {
        matches!(self, IndexExpr::Const(_))
    }

    pub fn as_const(&self) -> Option<i64> {
        match self {
            IndexExpr::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn add(self, other: IndexExpr) -> IndexExpr {
        IndexExpr::Add(Box::new(self), Box::new(other)).simplify()
    }

    pub fn sub(self, other: IndexExpr) -> IndexExpr {
        let neg = IndexExpr::Mul(Box::new(IndexExpr::Const(-1)), Box::new(other));
        IndexExpr::Add(Box::new(self), Box::new(neg)).simplify()
    }

    pub fn offset(self, delta: i64) -> IndexExpr {
        self.add(IndexExpr::Const(delta))
    }

    pub fn mul(self, other: IndexExpr) -> IndexExpr {
        IndexExpr::Mul(Box::new(self), Box::new(other)).simplify()
    }

    pub fn floor_div(self, other: IndexExpr) -> IndexExpr {
        IndexExpr::FloorDiv(Box::new(self), Box::new(other)).simplify()
    }

    pub fn ceil_div(self, other: IndexExpr) -> IndexExpr {
        IndexExpr::CeilDiv(Box::new(self), Box::new(other)).simplify()
    }

    pub fn modulo(self, other: IndexExpr) -> IndexExpr {
        IndexExpr::Mod(Box::new(self), Box::new(other)).simplify()
    }

    /// Fold constants and drop identities: x + 0, x * 1, x * 0,
    /// (x + c1) + c2, x / 1.
    pub fn simplify(&self) -> IndexExpr {
        match self {
            IndexExpr::Const(_) | IndexExpr::Sym(_) => self.clone(),
            IndexExpr::Add(a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (&a, &b) {
                    (IndexExpr::Const(x), IndexExpr::Const(y)) => match x.checked_add(*y) {
                        Some(v) => IndexExpr::Const(v),
                        None => IndexExpr::Add(Box::new(a), Box::new(b)),
                    },
                    (IndexExpr::Const(0), _) => b,
                    (_, IndexExpr::Const(0)) => a,
                    // Keep constants on the right so they can be re-associated.
                    (IndexExpr::Const(_), _) => IndexExpr::Add(Box::new(b), Box::new(a)).simplify(),
                    (IndexExpr::Add(inner, c1), IndexExpr::Const(c2)) => {
                        match c1.as_const().and_then(|c1| c1.checked_add(*c2)) {
                            Some(c) => {
                                IndexExpr::Add(inner.clone(), Box::new(IndexExpr::Const(c))).simplify()
                            }
                            None => IndexExpr::Add(Box::new(a), Box::new(b)),
                        }
                    }
                    _ => IndexExpr::Add(Box::new(a), Box::new(b)),
                }
            }
            IndexExpr::Mul(a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (&a, &b) {
                    (IndexExpr::Const(x), IndexExpr::Const(y)) => match x.checked_mul(*y) {
                        Some(v) => IndexExpr::Const(v),
                        None => IndexExpr::Mul(Box::new(a), Box::new(b)),
                    },
                    (IndexExpr::Const(0), _) | (_, IndexExpr::Const(0)) => IndexExpr::Const(0),
                    (IndexExpr::Const(1), _) => b,
                    (_, IndexExpr::Const(1)) => a,
                    _ => IndexExpr::Mul(Box::new(a), Box::new(b)),
                }
            }
            IndexExpr::FloorDiv(a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (&a, &b) {
                    (IndexExpr::Const(x), IndexExpr::Const(y)) => match x.checked_div_euclid(*y) {
                        Some(v) => IndexExpr::Const(v),
                        None => IndexExpr::FloorDiv(Box::new(a), Box::new(b)),
                    },
                    (_, IndexExpr::Const(1)) => a,
                    _ => IndexExpr::FloorDiv(Box::new(a), Box::new(b)),
                }
            }
            IndexExpr::CeilDiv(a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (&a, &b) {
                    (IndexExpr::Const(x), IndexExpr::Const(y)) => match ceil_div(*x, *y) {
                        Some(v) => IndexExpr::Const(v),
                        None => IndexExpr::CeilDiv(Box::new(a), Box::new(b)),
                    },
                    (_, IndexExpr::Const(1)) => a,
                    _ => IndexExpr::CeilDiv(Box::new(a), Box::new(b)),
                }
            }
            IndexExpr::Mod(a, b) => {
                let a = a.simplify();
                let b = b.simplify();
                match (&a, &b) {
                    (IndexExpr::Const(x), IndexExpr::Const(y)) => match x.checked_rem_euclid(*y) {
                        Some(v) => IndexExpr::Const(v),
                        None => IndexExpr::Mod(Box::new(a), Box::new(b)),
                    },
                    (_, IndexExpr::Const(1)) => IndexExpr::Const(0),
                    _ => IndexExpr::Mod(Box::new(a), Box::new(b)),
                }
            }
        }
    }

    /// Replace every occurrence of the named symbols and simplify.
    pub fn subs(&self, map: &BTreeMap<String, IndexExpr>) -> IndexExpr {
        self.rewrite(&|name| map.get(name).cloned()).simplify()
    }

    /// Replace a single symbol and simplify.
    pub fn subs_sym(&self, name: &str, value: &IndexExpr) -> IndexExpr {
        self.rewrite(&|sym| (sym == name).then(|| value.clone()))
            .simplify()
    }

    /// Substitute concrete hyperparameter values.
    pub fn subs_values(&self, values: &BTreeMap<String, i64>) -> IndexExpr {
        self.rewrite(&|name| values.get(name).map(|v| IndexExpr::Const(*v)))
            .simplify()
    }

    fn rewrite(&self, f: &dyn Fn(&str) -> Option<IndexExpr>) -> IndexExpr {
        let bin = |a: &IndexExpr, b: &IndexExpr| (Box::new(a.rewrite(f)), Box::new(b.rewrite(f)));
        match self {
            IndexExpr::Const(_) => self.clone(),
            IndexExpr::Sym(name) => f(name).unwrap_or_else(|| self.clone()),
            IndexExpr::Add(a, b) => {
                let (a, b) = bin(a, b);
                IndexExpr::Add(a, b)
            }
            IndexExpr::Mul(a, b) => {
                let (a, b) = bin(a, b);
                IndexExpr::Mul(a, b)
            }
            IndexExpr::FloorDiv(a, b) => {
                let (a, b) = bin(a, b);
                IndexExpr::FloorDiv(a, b)
            }
            IndexExpr::CeilDiv(a, b) => {
                let (a, b) = bin(a, b);
                IndexExpr::CeilDiv(a, b)
            }
            IndexExpr::Mod(a, b) => {
                let (a, b) = bin(a, b);
                IndexExpr::Mod(a, b)
            }
        }
    }

    /// Evaluate under a complete assignment. `None` on a missing symbol,
    /// division by zero, or overflow.
    pub fn eval(&self, env: &BTreeMap<String, i64>) -> Option<i64> {
        match self {
            IndexExpr::Const(v) => Some(*v),
            IndexExpr::Sym(name) => env.get(name).copied(),
            IndexExpr::Add(a, b) => a.eval(env)?.checked_add(b.eval(env)?),
            IndexExpr::Mul(a, b) => a.eval(env)?.checked_mul(b.eval(env)?),
            IndexExpr::FloorDiv(a, b) => a.eval(env)?.checked_div_euclid(b.eval(env)?),
            IndexExpr::CeilDiv(a, b) => ceil_div(a.eval(env)?, b.eval(env)?),
            IndexExpr::Mod(a, b) => a.eval(env)?.checked_rem_euclid(b.eval(env)?),
        }
    }

    /// All symbol names, sorted.
    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            IndexExpr::Const(_) => {}
            IndexExpr::Sym(name) => {
                out.insert(name.clone());
            }
            IndexExpr::Add(a, b)
            | IndexExpr::Mul(a, b)
            | IndexExpr::FloorDiv(a, b)
            | IndexExpr::CeilDiv(a, b)
            | IndexExpr::Mod(a, b) => {
                a.collect_symbols(out);
                b.collect_symbols(out);
            }
        }
    }
}

impl From<i64> for IndexExpr {
    fn from(v: i64) -> Self {
        IndexExpr::Const(v)
    }
}

/// `None` on division by zero or overflow.
pub(crate) fn ceil_div(n: i64, d: i64) -> Option<i64> {
    let q = n.checked_div_euclid(d)?;
    if n.checked_rem_euclid(d)? == 0 {
        Some(q)
    } else {
        q.checked_add(1)
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexExpr::Const(v) => write!(f, "{}", v),
            IndexExpr::Sym(name) => write!(f, "{}", name),
            IndexExpr::Add(a, b) => match b.as_ref() {
                IndexExpr::Const(c) if *c < 0 => write!(f, "({} - {})", a, c.unsigned_abs()),
                IndexExpr::Mul(k, rhs) if k.as_const() == Some(-1) => {
                    write!(f, "({} - {})", a, rhs)
                }
                _ => write!(f, "({} + {})", a, b),
            },
            IndexExpr::Mul(a, b) => write!(f, "{}*{}", a, b),
            IndexExpr::FloorDiv(a, b) => write!(f, "floor({}/{})", a, b),
            IndexExpr::CeilDiv(a, b) => write!(f, "ceiling({}/{})", a, b),
            IndexExpr::Mod(a, b) => write!(f, "({} mod {})", a, b),
        }
    }
}
