//! Disjunctive normal form rewriting for predicates.

use super::Expr;
use crate::query::value::Value;

/// DNF normaliser.
///
/// Pushes negation down to comparisons, flattens nested AND/OR and
/// distributes AND over OR while the number of produced disjuncts stays
/// within `max_terms`. Larger products are left undistributed.
#[derive(Clone, Copy, Debug)]
pub struct Dnf {
    max_terms: usize,
}

impl Default for Dnf {
    fn default() -> Self {
        Self { max_terms: 64 }
    }
}

impl Dnf {
    /// Creates a normaliser with the given expansion limit.
    pub fn new(max_terms: usize) -> Self {
        Self {
            max_terms: max_terms.max(1),
        }
    }

    /// Returns the normalised form of `expr`.
    pub fn normalize(&self, expr: &Expr) -> Expr {
        let pushed = push_not(expr, false);
        self.distribute(flatten(pushed))
    }

    fn distribute(&self, expr: Expr) -> Expr {
        match expr {
            Expr::And(terms) => {
                let terms: Vec<Expr> = terms.into_iter().map(|t| self.distribute(t)).collect();
                let product: usize = terms
                    .iter()
                    .map(|t| match t {
                        Expr::Or(d) => d.len(),
                        _ => 1,
                    })
                    .try_fold(1usize, |acc, n| acc.checked_mul(n))
                    .unwrap_or(usize::MAX);
                if product <= 1 || product > self.max_terms {
                    return flatten(Expr::And(terms));
                }
                let mut disjuncts: Vec<Vec<Expr>> = vec![Vec::new()];
                for term in terms {
                    match term {
                        Expr::Or(options) => {
                            let mut next = Vec::with_capacity(disjuncts.len() * options.len());
                            for prefix in &disjuncts {
                                for opt in &options {
                                    let mut conj = prefix.clone();
                                    conj.push(opt.clone());
                                    next.push(conj);
                                }
                            }
                            disjuncts = next;
                        }
                        other => {
                            for conj in &mut disjuncts {
                                conj.push(other.clone());
                            }
                        }
                    }
                }
                flatten(Expr::Or(disjuncts.into_iter().map(Expr::And).collect()))
            }
            Expr::Or(terms) => flatten(Expr::Or(
                terms.into_iter().map(|t| self.distribute(t)).collect(),
            )),
            other => other,
        }
    }
}

fn push_not(expr: &Expr, negate: bool) -> Expr {
    match expr {
        Expr::Not(inner) => push_not(inner, !negate),
        Expr::And(terms) => {
            let terms = terms.iter().map(|t| push_not(t, negate)).collect();
            if negate {
                Expr::Or(terms)
            } else {
                Expr::And(terms)
            }
        }
        Expr::Or(terms) => {
            let terms = terms.iter().map(|t| push_not(t, negate)).collect();
            if negate {
                Expr::And(terms)
            } else {
                Expr::Or(terms)
            }
        }
        Expr::Cmp(op, l, r) if negate => Expr::Cmp(op.negate(), l.clone(), r.clone()),
        Expr::Is(op, e) if negate => match op.negate() {
            Some(op) => Expr::Is(op, e.clone()),
            None => Expr::not(expr.clone()),
        },
        Expr::Literal(Value::Bool(b)) if negate => Expr::Literal(Value::Bool(!b)),
        Expr::Quantified {
            quantifier,
            bindings,
            satisfies,
        } => {
            let q = Expr::Quantified {
                quantifier: *quantifier,
                bindings: bindings.clone(),
                satisfies: Box::new(push_not(satisfies, false)),
            };
            if negate {
                Expr::not(q)
            } else {
                q
            }
        }
        other if negate => Expr::not(other.clone()),
        other => other.clone(),
    }
}

/// Flattens nested AND/OR and drops neutral boolean literals.
fn flatten(expr: Expr) -> Expr {
    match expr {
        Expr::And(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for t in terms {
                match flatten(t) {
                    Expr::And(inner) => out.extend(inner),
                    Expr::Literal(Value::Bool(true)) => {}
                    f @ Expr::Literal(Value::Bool(false)) => return f,
                    other => out.push(other),
                }
            }
            match out.len() {
                0 => Expr::Literal(Value::Bool(true)),
                1 => out.remove(0),
                _ => Expr::And(out),
            }
        }
        Expr::Or(terms) => {
            let mut out = Vec::with_capacity(terms.len());
            for t in terms {
                match flatten(t) {
                    Expr::Or(inner) => out.extend(inner),
                    Expr::Literal(Value::Bool(false)) => {}
                    t @ Expr::Literal(Value::Bool(true)) => return t,
                    other => out.push(other),
                }
            }
            match out.len() {
                0 => Expr::Literal(Value::Bool(false)),
                1 => out.remove(0),
                _ => Expr::Or(out),
            }
        }
        other => other,
    }
}

/// Splits a normalised predicate into its top-level conjuncts.
pub fn conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::And(terms) => terms.clone(),
        other => vec![other.clone()],
    }
}
