//! Expression trees used by predicates, index keys and projections.
//!
//! Expressions are plain data: structural equality doubles as the
//! equivalence test used by index matching, and the `Display` rendering is
//! the canonical text used to key covered values.

mod analysis;
mod dnf;
mod eval;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::query::value::Value;

pub use analysis::{ArrayKeyRef, FilterCovers};
pub(crate) use analysis::{high_ge, low_le, ValueRange};
pub use dnf::{conjuncts, Dnf};

/// Comparison operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl CmpOp {
    /// Operator obtained by swapping the operands.
    pub fn flip(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }

    /// Logical negation.
    pub fn negate(self) -> Self {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// `IS` tests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsOp {
    /// `IS NULL`
    Null,
    /// `IS NOT NULL`
    NotNull,
    /// `IS MISSING`
    Missing,
    /// `IS NOT MISSING`
    NotMissing,
    /// `IS VALUED`
    Valued,
}

impl IsOp {
    fn negate(self) -> Option<Self> {
        match self {
            IsOp::Null => Some(IsOp::NotNull),
            IsOp::NotNull => Some(IsOp::Null),
            IsOp::Missing => Some(IsOp::NotMissing),
            IsOp::NotMissing => Some(IsOp::Missing),
            IsOp::Valued => None,
        }
    }

    fn text(self) -> &'static str {
        match self {
            IsOp::Null => "is null",
            IsOp::NotNull => "is not null",
            IsOp::Missing => "is missing",
            IsOp::NotMissing => "is not missing",
            IsOp::Valued => "is valued",
        }
    }
}

/// Collection quantifiers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantifier {
    /// `ANY ... SATISFIES ... END`
    Any,
    /// `EVERY ... SATISFIES ... END`
    Every,
    /// `ANY AND EVERY ... SATISFIES ... END`
    AnyEvery,
}

/// `var IN expr` binding of a quantifier or array comprehension.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    /// Bound variable name.
    pub var: String,
    /// Collection expression.
    pub expr: Expr,
}

impl Binding {
    /// Creates a binding.
    pub fn new(var: impl Into<String>, expr: Expr) -> Self {
        Self {
            var: var.into(),
            expr,
        }
    }
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Keyspace alias or bound variable.
    Identifier(String),
    /// Field access `base.name`.
    Field(Box<Expr>, String),
    /// `META(alias)`; an empty alias refers to the index's own keyspace.
    Meta(String),
    /// Binary comparison.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// `expr LIKE pattern`.
    Like(Box<Expr>, Box<Expr>),
    /// `expr IN [..]`.
    In(Box<Expr>, Vec<Expr>),
    /// `expr IS ...`.
    Is(IsOp, Box<Expr>),
    /// Conjunction.
    And(Vec<Expr>),
    /// Disjunction.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Quantified predicate over collections.
    Quantified {
        /// ANY, EVERY or ANY AND EVERY.
        quantifier: Quantifier,
        /// Collection bindings.
        bindings: Vec<Binding>,
        /// Per-element condition.
        satisfies: Box<Expr>,
    },
    /// `[ALL|DISTINCT] ARRAY mapping FOR bindings [WHEN cond] END`.
    ArrayFor {
        /// `ALL` keyword present.
        all: bool,
        /// `DISTINCT` keyword present.
        distinct: bool,
        /// Per-element mapping.
        mapping: Box<Expr>,
        /// Collection bindings.
        bindings: Vec<Binding>,
        /// Optional element filter.
        when: Option<Box<Expr>>,
    },
    /// Reference to an aggregate result by alias.
    Aggregate(String),
    /// Expression whose value may be supplied by a covering index scan.
    Cover(String, Box<Expr>),
}

impl Expr {
    /// Literal constructor.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Identifier constructor.
    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Identifier(name.into())
    }

    /// `alias.f1.f2...`
    pub fn path(alias: &str, fields: &[&str]) -> Self {
        fields
            .iter()
            .fold(Expr::ident(alias), |acc, f| acc.field(*f))
    }

    /// Field access on `self`.
    pub fn field(self, name: impl Into<String>) -> Self {
        Expr::Field(Box::new(self), name.into())
    }

    /// `META(alias).id`
    pub fn meta_id(alias: impl Into<String>) -> Self {
        Expr::Meta(alias.into()).field("id")
    }

    /// Comparison constructor.
    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Cmp(op, Box::new(lhs), Box::new(rhs))
    }

    /// `lhs = rhs`
    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Self::cmp(CmpOp::Eq, lhs, rhs)
    }

    /// `lhs < rhs`
    pub fn lt(lhs: Expr, rhs: Expr) -> Self {
        Self::cmp(CmpOp::Lt, lhs, rhs)
    }

    /// `lhs <= rhs`
    pub fn le(lhs: Expr, rhs: Expr) -> Self {
        Self::cmp(CmpOp::Le, lhs, rhs)
    }

    /// `lhs > rhs`
    pub fn gt(lhs: Expr, rhs: Expr) -> Self {
        Self::cmp(CmpOp::Gt, lhs, rhs)
    }

    /// `lhs >= rhs`
    pub fn ge(lhs: Expr, rhs: Expr) -> Self {
        Self::cmp(CmpOp::Ge, lhs, rhs)
    }

    /// `expr BETWEEN low AND high`, expanded to two range comparisons.
    pub fn between(expr: Expr, low: Expr, high: Expr) -> Self {
        Expr::And(vec![Self::ge(expr.clone(), low), Self::le(expr, high)])
    }

    /// `expr LIKE pattern`
    pub fn like(expr: Expr, pattern: impl Into<String>) -> Self {
        Expr::Like(Box::new(expr), Box::new(Expr::lit(pattern.into())))
    }

    /// `expr IN [items]`
    pub fn in_list(expr: Expr, items: Vec<Expr>) -> Self {
        Expr::In(Box::new(expr), items)
    }

    /// `expr IS ...`
    pub fn is(op: IsOp, expr: Expr) -> Self {
        Expr::Is(op, Box::new(expr))
    }

    /// Conjunction; a single term is returned as-is.
    pub fn and(mut terms: Vec<Expr>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::And(terms)
        }
    }

    /// Disjunction; a single term is returned as-is.
    pub fn or(mut terms: Vec<Expr>) -> Self {
        if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expr::Or(terms)
        }
    }

    /// Negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// `ANY var IN coll SATISFIES cond END`
    pub fn any(var: impl Into<String>, coll: Expr, satisfies: Expr) -> Self {
        Self::quantified(Quantifier::Any, var, coll, satisfies)
    }

    /// `EVERY var IN coll SATISFIES cond END`
    pub fn every(var: impl Into<String>, coll: Expr, satisfies: Expr) -> Self {
        Self::quantified(Quantifier::Every, var, coll, satisfies)
    }

    /// `ANY AND EVERY var IN coll SATISFIES cond END`
    pub fn any_every(var: impl Into<String>, coll: Expr, satisfies: Expr) -> Self {
        Self::quantified(Quantifier::AnyEvery, var, coll, satisfies)
    }

    fn quantified(q: Quantifier, var: impl Into<String>, coll: Expr, satisfies: Expr) -> Self {
        Expr::Quantified {
            quantifier: q,
            bindings: vec![Binding::new(var, coll)],
            satisfies: Box::new(satisfies),
        }
    }

    /// `DISTINCT ARRAY mapping FOR var IN coll END`
    pub fn distinct_array(mapping: Expr, var: impl Into<String>, coll: Expr) -> Self {
        Expr::ArrayFor {
            all: false,
            distinct: true,
            mapping: Box::new(mapping),
            bindings: vec![Binding::new(var, coll)],
            when: None,
        }
    }

    /// `ALL ARRAY mapping FOR var IN coll END`
    pub fn all_array(mapping: Expr, var: impl Into<String>, coll: Expr) -> Self {
        Expr::ArrayFor {
            all: true,
            distinct: false,
            mapping: Box::new(mapping),
            bindings: vec![Binding::new(var, coll)],
            when: None,
        }
    }

    /// Direct children.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Literal(_) | Expr::Identifier(_) | Expr::Meta(_) | Expr::Aggregate(_) => {
                Vec::new()
            }
            Expr::Field(base, _) => vec![base],
            Expr::Cmp(_, l, r) | Expr::Like(l, r) => vec![l, r],
            Expr::In(e, items) => std::iter::once(&**e).chain(items.iter()).collect(),
            Expr::Is(_, e) | Expr::Not(e) | Expr::Cover(_, e) => vec![e],
            Expr::And(terms) | Expr::Or(terms) => terms.iter().collect(),
            Expr::Quantified {
                bindings,
                satisfies,
                ..
            } => bindings
                .iter()
                .map(|b| &b.expr)
                .chain(std::iter::once(&**satisfies))
                .collect(),
            Expr::ArrayFor {
                mapping,
                bindings,
                when,
                ..
            } => bindings
                .iter()
                .map(|b| &b.expr)
                .chain(std::iter::once(&**mapping))
                .chain(when.iter().map(|w| &**w))
                .collect(),
        }
    }

    /// Rebuilds the expression top-down, letting `f` replace any node.
    /// Replaced nodes are not descended into.
    pub fn transform(&self, f: &mut dyn FnMut(&Expr) -> Option<Expr>) -> Expr {
        match f(self) {
            Some(replaced) => replaced,
            None => self.map_children(&mut |c| c.transform(&mut *f)),
        }
    }

    /// Rebuilds this node with `f` applied to each direct child.
    pub fn map_children<'s>(&'s self, f: &mut dyn FnMut(&'s Expr) -> Expr) -> Expr {
        let bind = |bindings: &'s [Binding], f: &mut dyn FnMut(&'s Expr) -> Expr| {
            bindings
                .iter()
                .map(|b| Binding::new(b.var.clone(), f(&b.expr)))
                .collect::<Vec<_>>()
        };
        match self {
            Expr::Literal(_) | Expr::Identifier(_) | Expr::Meta(_) | Expr::Aggregate(_) => {
                self.clone()
            }
            Expr::Field(base, name) => Expr::Field(Box::new(f(base)), name.clone()),
            Expr::Cmp(op, l, r) => {
                let l = f(l);
                Expr::Cmp(*op, Box::new(l), Box::new(f(r)))
            }
            Expr::Like(l, r) => {
                let l = f(l);
                Expr::Like(Box::new(l), Box::new(f(r)))
            }
            Expr::In(e, items) => {
                let e = f(e);
                Expr::In(Box::new(e), items.iter().map(|i| f(i)).collect())
            }
            Expr::Is(op, e) => Expr::Is(*op, Box::new(f(e))),
            Expr::Not(e) => Expr::Not(Box::new(f(e))),
            Expr::Cover(text, e) => Expr::Cover(text.clone(), Box::new(f(e))),
            Expr::And(terms) => Expr::And(terms.iter().map(|t| f(t)).collect()),
            Expr::Or(terms) => Expr::Or(terms.iter().map(|t| f(t)).collect()),
            Expr::Quantified {
                quantifier,
                bindings,
                satisfies,
            } => {
                let bindings = bind(bindings, &mut *f);
                Expr::Quantified {
                    quantifier: *quantifier,
                    bindings,
                    satisfies: Box::new(f(satisfies)),
                }
            }
            Expr::ArrayFor {
                all,
                distinct,
                mapping,
                bindings,
                when,
            } => {
                let bindings = bind(bindings, &mut *f);
                let mapping = Box::new(f(mapping));
                Expr::ArrayFor {
                    all: *all,
                    distinct: *distinct,
                    mapping,
                    bindings,
                    when: when.as_ref().map(|w| Box::new(f(w))),
                }
            }
        }
    }

    /// Free identifiers and `META()` aliases referenced by the expression.
    pub fn keyspace_refs(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut bound = Vec::new();
        collect_refs(self, &mut bound, &mut out);
        out
    }

    /// True when the expression references `alias` as a free identifier or
    /// through `META(alias)`.
    pub fn references(&self, alias: &str) -> bool {
        self.keyspace_refs().contains(alias)
    }

    /// True when evaluation needs no item.
    pub fn is_constant(&self) -> bool {
        self.keyspace_refs().is_empty() && !self.has_runtime_refs()
    }

    fn has_runtime_refs(&self) -> bool {
        matches!(self, Expr::Aggregate(_) | Expr::Cover(..))
            || self.children().iter().any(|c| c.has_runtime_refs())
    }

    /// Value of a constant expression.
    pub fn static_value(&self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            _ if self.is_constant() => self.evaluate(&Default::default()).ok(),
            _ => None,
        }
    }
}

fn collect_refs<'a>(expr: &'a Expr, bound: &mut Vec<&'a str>, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Identifier(name) => {
            if !bound.contains(&name.as_str()) {
                out.insert(name.clone());
            }
        }
        Expr::Meta(alias) => {
            out.insert(alias.clone());
        }
        Expr::Quantified {
            bindings,
            satisfies,
            ..
        } => {
            let mark = bound.len();
            for b in bindings {
                collect_refs(&b.expr, bound, out);
                bound.push(&b.var);
            }
            collect_refs(satisfies, bound, out);
            bound.truncate(mark);
        }
        Expr::ArrayFor {
            mapping,
            bindings,
            when,
            ..
        } => {
            let mark = bound.len();
            for b in bindings {
                collect_refs(&b.expr, bound, out);
                bound.push(&b.var);
            }
            collect_refs(mapping, bound, out);
            if let Some(w) = when {
                collect_refs(w, bound, out);
            }
            bound.truncate(mark);
        }
        other => {
            for child in other.children() {
                collect_refs(child, bound, out);
            }
        }
    }
}

fn write_bindings(f: &mut fmt::Formatter<'_>, bindings: &[Binding]) -> fmt::Result {
    for (i, b) in bindings.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{} in {}", b.var, b.expr)?;
    }
    Ok(())
}

fn write_joined(f: &mut fmt::Formatter<'_>, terms: &[Expr], sep: &str) -> fmt::Result {
    f.write_str("(")?;
    for (i, t) in terms.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{t}")?;
    }
    f.write_str(")")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Identifier(name) => f.write_str(name),
            Expr::Field(base, name) => write!(f, "{base}.{name}"),
            Expr::Meta(alias) => write!(f, "meta({alias})"),
            Expr::Cmp(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
            Expr::Like(l, r) => write!(f, "({l} like {r})"),
            Expr::In(e, items) => {
                write!(f, "({e} in [")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("])")
            }
            Expr::Is(op, e) => write!(f, "({e} {})", op.text()),
            Expr::And(terms) => write_joined(f, terms, " and "),
            Expr::Or(terms) => write_joined(f, terms, " or "),
            Expr::Not(e) => write!(f, "(not {e})"),
            Expr::Quantified {
                quantifier,
                bindings,
                satisfies,
            } => {
                f.write_str(match quantifier {
                    Quantifier::Any => "any ",
                    Quantifier::Every => "every ",
                    Quantifier::AnyEvery => "any and every ",
                })?;
                write_bindings(f, bindings)?;
                write!(f, " satisfies {satisfies} end")
            }
            Expr::ArrayFor {
                all,
                distinct,
                mapping,
                bindings,
                when,
            } => {
                if *all {
                    f.write_str("all ")?;
                }
                if *distinct {
                    f.write_str("distinct ")?;
                }
                write!(f, "array {mapping} for ")?;
                write_bindings(f, bindings)?;
                if let Some(w) = when {
                    write!(f, " when {w}")?;
                }
                f.write_str(" end")
            }
            Expr::Aggregate(alias) => write!(f, "aggregate({alias})"),
            Expr::Cover(text, _) => write!(f, "cover({text})"),
        }
    }
}
