//! Structural reasoning over expressions: implication, dependency,
//! filter covers, formalisation and covering.

use std::ops::Bound;

use rustc_hash::FxHashMap;

use super::{Binding, CmpOp, Expr, IsOp};
use crate::query::value::Value;

/// Equality-to-constant facts keyed by expression text.
pub type FilterCovers = FxHashMap<String, Value>;

/// Borrowed view of an array index key.
#[derive(Clone, Copy, Debug)]
pub struct ArrayKeyRef<'a> {
    /// `DISTINCT` array key.
    pub distinct: bool,
    /// `ALL` array key.
    pub all: bool,
    /// Per-element mapping.
    pub mapping: &'a Expr,
    /// Collection bindings.
    pub bindings: &'a [Binding],
    /// Element filter.
    pub when: Option<&'a Expr>,
}

/// Value interval used for implication checks.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ValueRange {
    pub low: Bound<Value>,
    pub high: Bound<Value>,
}

impl ValueRange {
    pub fn point(v: Value) -> Self {
        Self {
            low: Bound::Included(v.clone()),
            high: Bound::Included(v),
        }
    }

    /// Interval satisfied by `operand op v`.
    pub fn from_cmp(op: CmpOp, v: Value) -> Option<Self> {
        let not_null = Bound::Excluded(Value::Null);
        Some(match op {
            CmpOp::Eq => Self::point(v),
            CmpOp::Lt => Self {
                low: not_null,
                high: Bound::Excluded(v),
            },
            CmpOp::Le => Self {
                low: not_null,
                high: Bound::Included(v),
            },
            CmpOp::Gt => Self {
                low: Bound::Excluded(v),
                high: Bound::Unbounded,
            },
            CmpOp::Ge => Self {
                low: Bound::Included(v),
                high: Bound::Unbounded,
            },
            CmpOp::Ne => return None,
        })
    }

    pub fn contains_range(&self, other: &ValueRange) -> bool {
        low_le(&self.low, &other.low) && high_ge(&self.high, &other.high)
    }

    pub fn is_empty(&self) -> bool {
        match (&self.low, &self.high) {
            (Bound::Included(l), Bound::Included(h)) => l > h,
            (Bound::Included(l), Bound::Excluded(h))
            | (Bound::Excluded(l), Bound::Included(h))
            | (Bound::Excluded(l), Bound::Excluded(h)) => l >= h,
            _ => false,
        }
    }

    pub fn intersect(&self, other: &ValueRange) -> ValueRange {
        let low = if low_le(&self.low, &other.low) {
            other.low.clone()
        } else {
            self.low.clone()
        };
        let high = if high_ge(&self.high, &other.high) {
            other.high.clone()
        } else {
            self.high.clone()
        };
        ValueRange { low, high }
    }
}

/// True when lower bound `a` admits everything lower bound `b` admits.
pub(crate) fn low_le(a: &Bound<Value>, b: &Bound<Value>) -> bool {
    match (a, b) {
        (Bound::Unbounded, _) => true,
        (_, Bound::Unbounded) => false,
        (Bound::Included(x), Bound::Included(y))
        | (Bound::Included(x), Bound::Excluded(y))
        | (Bound::Excluded(x), Bound::Excluded(y)) => x <= y,
        (Bound::Excluded(x), Bound::Included(y)) => x < y,
    }
}

/// True when upper bound `a` admits everything upper bound `b` admits.
pub(crate) fn high_ge(a: &Bound<Value>, b: &Bound<Value>) -> bool {
    match (a, b) {
        (Bound::Unbounded, _) => true,
        (_, Bound::Unbounded) => false,
        (Bound::Included(x), Bound::Included(y))
        | (Bound::Included(x), Bound::Excluded(y))
        | (Bound::Excluded(x), Bound::Excluded(y)) => x >= y,
        (Bound::Excluded(x), Bound::Included(y)) => x > y,
    }
}

/// Operand and literal interval of a simple range predicate.
fn literal_range(expr: &Expr) -> Option<(&Expr, ValueRange)> {
    match expr {
        Expr::Cmp(op, l, r) => {
            if let Some(v) = r.static_value().filter(|v| !v.is_unknown()) {
                if !l.is_constant() {
                    return ValueRange::from_cmp(*op, v).map(|range| (&**l, range));
                }
            }
            if let Some(v) = l.static_value().filter(|v| !v.is_unknown()) {
                if !r.is_constant() {
                    return ValueRange::from_cmp(op.flip(), v).map(|range| (&**r, range));
                }
            }
            None
        }
        Expr::Is(IsOp::NotNull | IsOp::Valued, e) => Some((
            &**e,
            ValueRange {
                low: Bound::Excluded(Value::Null),
                high: Bound::Unbounded,
            },
        )),
        Expr::Is(IsOp::NotMissing, e) => Some((
            &**e,
            ValueRange {
                low: Bound::Included(Value::Null),
                high: Bound::Unbounded,
            },
        )),
        Expr::Is(IsOp::Null, e) => Some((&**e, ValueRange::point(Value::Null))),
        _ => None,
    }
}

impl Expr {
    /// Structural equivalence, looking through cover wrappers.
    pub fn equivalent_to(&self, other: &Expr) -> bool {
        strip_cover(self) == strip_cover(other)
    }

    /// True when `self` contains a subexpression equivalent to `other`.
    pub fn depends_on(&self, other: &Expr) -> bool {
        self.equivalent_to(other) || self.children().iter().any(|c| c.depends_on(other))
    }

    /// True when `self` implies `other` (every item satisfying `self`
    /// satisfies `other`). Conservative: `false` means "not provable".
    pub fn subset_of(&self, other: &Expr) -> bool {
        if self.equivalent_to(other) {
            return true;
        }
        if matches!(other, Expr::Literal(Value::Bool(true))) {
            return true;
        }
        if let Expr::And(terms) = other {
            return terms.iter().all(|t| self.subset_of(t));
        }
        match self {
            Expr::Or(terms) => return terms.iter().all(|t| t.subset_of(other)),
            Expr::And(terms) if terms.iter().any(|t| t.subset_of(other)) => return true,
            _ => {}
        }
        if let Expr::Or(terms) = other {
            if terms.iter().any(|t| self.subset_of(t)) {
                return true;
            }
        }
        if let Expr::In(e, items) = self {
            let lits: Option<Vec<Value>> = items.iter().map(Expr::static_value).collect();
            if let Some(lits) = lits {
                return !lits.is_empty()
                    && lits.into_iter().all(|v| {
                        Expr::eq((**e).clone(), Expr::Literal(v)).subset_of(other)
                    });
            }
        }
        match (literal_range(self), literal_range(other)) {
            (Some((ls, rs)), Some((lo, ro))) => ls.equivalent_to(lo) && ro.contains_range(&rs),
            _ => false,
        }
    }

    /// Records `expr = constant` facts found among the conjuncts.
    pub fn filter_covers(&self, covers: &mut FilterCovers) {
        match self {
            Expr::And(terms) => {
                for t in terms {
                    t.filter_covers(covers);
                }
            }
            Expr::Cmp(CmpOp::Eq, l, r) => {
                if let (false, Some(v)) = (l.is_constant(), r.static_value()) {
                    covers.insert(l.to_string(), v);
                } else if let (false, Some(v)) = (r.is_constant(), l.static_value()) {
                    covers.insert(r.to_string(), v);
                }
            }
            _ => {}
        }
    }

    /// Qualifies free identifiers with `alias` and binds `META()` to it.
    ///
    /// Index definitions name fields relative to their keyspace; this turns
    /// `a.b` into `alias.a.b` so keys compare equal to query predicates.
    pub fn formalize(&self, alias: &str) -> Expr {
        let mut bound = Vec::new();
        formalize_in(self, alias, &mut bound)
    }

    /// Array index key view, when `self` is an array comprehension.
    pub fn as_array_key(&self) -> Option<ArrayKeyRef<'_>> {
        match self {
            Expr::ArrayFor {
                all,
                distinct,
                mapping,
                bindings,
                when,
            } => Some(ArrayKeyRef {
                all: *all,
                distinct: *distinct,
                mapping,
                bindings,
                when: when.as_deref(),
            }),
            _ => None,
        }
    }

    /// Renames free occurrences of identifier `from`.
    pub fn rename_var(&self, from: &str, to: &str) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Identifier(name) if name == from => Some(Expr::ident(to)),
            _ => None,
        })
    }

    /// True when every reference to `alias` inside the expression can be
    /// answered from `keys`, the document key or the filter covers.
    pub fn covered_by(&self, alias: &str, keys: &[Expr], covers: &FilterCovers) -> bool {
        let mut bound = Vec::new();
        covered_in(self, alias, keys, covers, &mut bound)
    }

    /// Wraps every subexpression equivalent to an index key (or a filter
    /// cover) in [`Expr::Cover`].
    pub fn rewrite_covers(&self, keys: &[Expr], covers: &FilterCovers) -> Expr {
        self.transform(&mut |e| {
            if matches!(e, Expr::Literal(_) | Expr::Cover(..)) {
                return None;
            }
            let text = e.to_string();
            if keys.iter().any(|k| k.equivalent_to(e)) || covers.contains_key(&text) {
                Some(Expr::Cover(text, Box::new(e.clone())))
            } else {
                None
            }
        })
    }
}

fn strip_cover(expr: &Expr) -> &Expr {
    match expr {
        Expr::Cover(_, inner) => strip_cover(inner),
        other => other,
    }
}

fn formalize_in<'a>(expr: &'a Expr, alias: &str, bound: &mut Vec<&'a str>) -> Expr {
    match expr {
        Expr::Identifier(name) if !bound.contains(&name.as_str()) && name != alias => {
            Expr::ident(alias).field(name.clone())
        }
        Expr::Meta(a) if a.is_empty() => Expr::Meta(alias.to_owned()),
        Expr::Quantified {
            quantifier,
            bindings,
            satisfies,
        } => {
            let mark = bound.len();
            let mut out = Vec::with_capacity(bindings.len());
            for b in bindings {
                out.push(Binding::new(b.var.clone(), formalize_in(&b.expr, alias, bound)));
                bound.push(&b.var);
            }
            let satisfies = formalize_in(satisfies, alias, bound);
            bound.truncate(mark);
            Expr::Quantified {
                quantifier: *quantifier,
                bindings: out,
                satisfies: Box::new(satisfies),
            }
        }
        Expr::ArrayFor {
            all,
            distinct,
            mapping,
            bindings,
            when,
        } => {
            let mark = bound.len();
            let mut out = Vec::with_capacity(bindings.len());
            for b in bindings {
                out.push(Binding::new(b.var.clone(), formalize_in(&b.expr, alias, bound)));
                bound.push(&b.var);
            }
            let mapping = formalize_in(mapping, alias, bound);
            let when = when
                .as_ref()
                .map(|w| Box::new(formalize_in(w, alias, bound)));
            bound.truncate(mark);
            Expr::ArrayFor {
                all: *all,
                distinct: *distinct,
                mapping: Box::new(mapping),
                bindings: out,
                when,
            }
        }
        Expr::Field(base, name) => {
            Expr::Field(Box::new(formalize_in(base, alias, bound)), name.clone())
        }
        other => other.map_children(&mut |c| formalize_in(c, alias, bound)),
    }
}

fn covered_in<'a>(
    expr: &'a Expr,
    alias: &str,
    keys: &[Expr],
    covers: &FilterCovers,
    bound: &mut Vec<&'a str>,
) -> bool {
    if keys.iter().any(|k| k.equivalent_to(expr)) {
        return true;
    }
    if !matches!(expr, Expr::Literal(_)) && covers.contains_key(&expr.to_string()) {
        return true;
    }
    match expr {
        Expr::Identifier(name) => name != alias || bound.contains(&name.as_str()),
        Expr::Meta(a) => a != alias,
        Expr::Field(base, name) if name == "id" && matches!(&**base, Expr::Meta(a) if a == alias) => {
            true
        }
        Expr::Quantified {
            bindings,
            satisfies,
            ..
        } => {
            let mark = bound.len();
            let mut ok = true;
            for b in bindings {
                ok &= covered_in(&b.expr, alias, keys, covers, bound);
                bound.push(&b.var);
            }
            ok &= covered_in(satisfies, alias, keys, covers, bound);
            bound.truncate(mark);
            ok
        }
        Expr::ArrayFor {
            mapping,
            bindings,
            when,
            ..
        } => {
            let mark = bound.len();
            let mut ok = true;
            for b in bindings {
                ok &= covered_in(&b.expr, alias, keys, covers, bound);
                bound.push(&b.var);
            }
            ok &= covered_in(mapping, alias, keys, covers, bound);
            if let Some(w) = when {
                ok &= covered_in(w, alias, keys, covers, bound);
            }
            bound.truncate(mark);
            ok
        }
        other => other
            .children()
            .into_iter()
            .all(|c| covered_in(c, alias, keys, covers, bound)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> Expr {
        Expr::path("p", &["a"])
    }

    #[test]
    fn range_implication() {
        let five = Expr::lit(5i64);
        assert!(Expr::eq(a(), five.clone()).subset_of(&Expr::ge(a(), Expr::lit(3i64))));
        assert!(Expr::gt(a(), five.clone()).subset_of(&Expr::gt(a(), Expr::lit(4i64))));
        assert!(!Expr::gt(a(), Expr::lit(4i64)).subset_of(&Expr::gt(a(), five.clone())));
        assert!(Expr::eq(a(), five.clone()).subset_of(&Expr::is(IsOp::NotNull, a())));
        assert!(Expr::between(a(), Expr::lit(1i64), Expr::lit(2i64))
            .subset_of(&Expr::lt(a(), Expr::lit(10i64))));
        assert!(Expr::in_list(a(), vec![Expr::lit(1i64), Expr::lit(2i64)])
            .subset_of(&Expr::le(a(), Expr::lit(2i64))));
        assert!(!Expr::eq(a(), five).subset_of(&Expr::eq(Expr::path("p", &["b"]), Expr::lit(5i64))));
    }

    #[test]
    fn formalize_qualifies_free_names_only() {
        let key = Expr::distinct_array(Expr::ident("r"), "r", Expr::ident("reviewList"));
        let formal = key.formalize("product");
        assert_eq!(
            formal.to_string(),
            "distinct array r for r in product.reviewList end"
        );
        assert_eq!(Expr::Meta(String::new()).field("id").formalize("p"), Expr::meta_id("p"));
        let cmp = Expr::eq(Expr::ident("a"), Expr::lit(1i64)).formalize("p");
        assert_eq!(cmp, Expr::eq(a(), Expr::lit(1i64)));
    }

    #[test]
    fn covering_and_rewrite() {
        let keys = vec![a(), Expr::path("p", &["b"])];
        let covers = FilterCovers::default();
        let pred = Expr::and(vec![
            Expr::eq(a(), Expr::lit(1i64)),
            Expr::eq(Expr::meta_id("p"), Expr::lit("k")),
        ]);
        assert!(pred.covered_by("p", &keys, &covers));
        assert!(!Expr::path("p", &["c"]).covered_by("p", &keys, &covers));
        assert!(!Expr::ident("p").covered_by("p", &keys, &covers));

        let rewritten = pred.rewrite_covers(&keys, &covers);
        assert!(rewritten.to_string().contains("cover(p.a)"));
        assert!(rewritten.equivalent_to(&rewritten.clone()));
    }

    #[test]
    fn filter_covers_collects_equalities() {
        let cond = Expr::and(vec![
            Expr::eq(Expr::path("p", &["type"]), Expr::lit("beer")),
            Expr::gt(a(), Expr::lit(1i64)),
        ]);
        let mut covers = FilterCovers::default();
        cond.filter_covers(&mut covers);
        assert_eq!(covers.len(), 1);
        assert_eq!(covers.get("p.type"), Some(&Value::from("beer")));
    }
}
