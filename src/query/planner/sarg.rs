//! Sargability: which leading index keys a predicate constrains, and the
//! spans that constraint translates to.
//!
//! Predicates arrive in DNF. A conjunction constrains key `i` when one of
//! its terms restricts that key to a range; only an unbroken leading run of
//! constrained keys is usable. A disjunction is sargable when every
//! disjunct is, and its spans are the union of the disjuncts' spans.

use std::ops::Bound;

use super::spans::{PlanSpan, SargSpans, SpanRange};
use crate::query::errors::PlanError;
use crate::query::expr::{conjuncts, ArrayKeyRef, CmpOp, Expr, IsOp, Quantifier};
use crate::query::value::Value;

/// Upper bound on spans produced by crossing multi-range key positions.
const MAX_SPANS: usize = 256;

/// What the sargability walk may treat as a span bound.
#[derive(Clone, Copy, Debug)]
pub struct SargScope<'a> {
    /// Alias of the keyspace term being scanned.
    pub alias: &'a str,
    /// Bounds may reference other keyspaces (evaluated per outer row).
    pub join: bool,
}

impl<'a> SargScope<'a> {
    /// Scope for a driving (non-correlated) scan.
    pub fn new(alias: &'a str) -> Self {
        Self { alias, join: false }
    }

    /// Scope for the inner side of a join or nest.
    pub fn join(alias: &'a str) -> Self {
        Self { alias, join: true }
    }

    fn bound_ok(&self, bound: &Expr, bound_vars: &[&str]) -> bool {
        if bound.is_constant() {
            return true;
        }
        if !self.join {
            return false;
        }
        let refs = bound.keyspace_refs();
        !refs.contains(self.alias)
            && !bound_vars.iter().any(|v| refs.contains(*v))
            && !contains_runtime(bound)
    }
}

fn contains_runtime(expr: &Expr) -> bool {
    matches!(expr, Expr::Aggregate(_) | Expr::Cover(..))
        || expr.children().into_iter().any(contains_runtime)
}

/// Ranges one or more terms impose on a single key.
#[derive(Clone, Debug, PartialEq)]
struct KeySarg {
    ranges: Vec<SpanRange>,
    exact: bool,
}

impl KeySarg {
    fn exact(ranges: Vec<SpanRange>) -> Self {
        Self { ranges, exact: true }
    }

    fn inexact(ranges: Vec<SpanRange>) -> Self {
        Self {
            ranges,
            exact: false,
        }
    }

    fn all_points(&self) -> bool {
        self.ranges.iter().all(SpanRange::is_point)
    }

    /// Both restrictions at once. Literal ranges intersect exactly; a
    /// computed bound keeps the first restriction and drops exactness.
    fn intersect(self, other: KeySarg) -> KeySarg {
        let mut exact = self.exact && other.exact;
        let mut out = Vec::new();
        for a in &self.ranges {
            for b in &other.ranges {
                match (a.static_range(), b.static_range()) {
                    (Some(x), Some(y)) => {
                        let r = x.intersect(&y);
                        if !r.is_empty() {
                            out.push(SpanRange::from_static(r));
                        }
                    }
                    _ => {
                        exact = false;
                        return KeySarg {
                            ranges: self.ranges,
                            exact,
                        };
                    }
                }
            }
        }
        if out.is_empty() {
            out.push(SpanRange::empty());
        }
        KeySarg { ranges: out, exact }
    }
}

fn null() -> Expr {
    Expr::Literal(Value::Null)
}

fn cmp_ranges(op: CmpOp, bound: Expr) -> Vec<SpanRange> {
    match op {
        CmpOp::Eq => vec![SpanRange::point(bound)],
        CmpOp::Lt => vec![SpanRange {
            low: Bound::Excluded(null()),
            high: Bound::Excluded(bound),
        }],
        CmpOp::Le => vec![SpanRange {
            low: Bound::Excluded(null()),
            high: Bound::Included(bound),
        }],
        CmpOp::Gt => vec![SpanRange {
            low: Bound::Excluded(bound),
            high: Bound::Unbounded,
        }],
        CmpOp::Ge => vec![SpanRange {
            low: Bound::Included(bound),
            high: Bound::Unbounded,
        }],
        CmpOp::Ne => vec![
            SpanRange {
                low: Bound::Excluded(null()),
                high: Bound::Excluded(bound.clone()),
            },
            SpanRange {
                low: Bound::Excluded(bound),
                high: Bound::Unbounded,
            },
        ],
    }
}

/// Literal prefix of a LIKE pattern and whether a wildcard follows it.
fn like_prefix(pattern: &str) -> (String, bool) {
    let mut prefix = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => prefix.push(chars.next().unwrap_or('\\')),
            '%' | '_' => return (prefix, true),
            other => prefix.push(other),
        }
    }
    (prefix, false)
}

/// Smallest string greater than every string starting with `prefix`.
fn prefix_successor(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        let next = (last as u32 + 1..=char::MAX as u32).find_map(char::from_u32);
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

fn like_ranges(pattern: &str) -> KeySarg {
    let (prefix, wildcard) = like_prefix(pattern);
    if !wildcard {
        return KeySarg::exact(vec![SpanRange::point(Expr::lit(prefix))]);
    }
    let high = match prefix_successor(&prefix) {
        Some(succ) => Bound::Excluded(Expr::lit(succ)),
        None => Bound::Excluded(Expr::Literal(Value::Array(Vec::new()))),
    };
    KeySarg::inexact(vec![SpanRange {
        low: Bound::Included(Expr::lit(prefix)),
        high,
    }])
}

/// Restriction `term` places on a scalar key.
fn scalar_term_sarg(term: &Expr, key: &Expr, scope: SargScope<'_>, vars: &[&str]) -> Option<KeySarg> {
    match term {
        Expr::Cmp(op, l, r) => {
            let (op, bound) = if l.equivalent_to(key) && scope.bound_ok(r, vars) {
                (*op, &**r)
            } else if r.equivalent_to(key) && scope.bound_ok(l, vars) {
                (op.flip(), &**l)
            } else {
                return None;
            };
            if matches!(bound, Expr::Literal(v) if v.is_unknown()) {
                return Some(KeySarg::exact(vec![SpanRange::empty()]));
            }
            Some(KeySarg::exact(cmp_ranges(op, bound.clone())))
        }
        Expr::Like(l, pattern) if l.equivalent_to(key) => match pattern.static_value() {
            Some(Value::String(p)) => Some(like_ranges(&p)),
            _ => None,
        },
        Expr::In(e, items) if e.equivalent_to(key) => {
            if !items.iter().all(|i| scope.bound_ok(i, vars)) {
                return None;
            }
            if items.is_empty() {
                return Some(KeySarg::exact(vec![SpanRange::empty()]));
            }
            Some(KeySarg::exact(
                items.iter().cloned().map(SpanRange::point).collect(),
            ))
        }
        Expr::Is(op, e) if e.equivalent_to(key) => {
            let range = match op {
                IsOp::Null => SpanRange::point(null()),
                IsOp::NotNull | IsOp::Valued => SpanRange {
                    low: Bound::Excluded(null()),
                    high: Bound::Unbounded,
                },
                IsOp::NotMissing => SpanRange {
                    low: Bound::Included(null()),
                    high: Bound::Unbounded,
                },
                IsOp::Missing => return None,
            };
            Some(KeySarg::exact(vec![range]))
        }
        Expr::Or(terms) => {
            let mut ranges = Vec::new();
            let mut exact = true;
            for t in terms {
                let ks = scalar_term_sarg(t, key, scope, vars)?;
                exact &= ks.exact;
                ranges.extend(ks.ranges);
            }
            Some(KeySarg { ranges, exact })
        }
        Expr::And(terms) => {
            let mut acc: Option<KeySarg> = None;
            let mut exact = true;
            for t in terms {
                match scalar_term_sarg(t, key, scope, vars) {
                    Some(ks) => {
                        acc = Some(match acc {
                            Some(prev) => prev.intersect(ks),
                            None => ks,
                        })
                    }
                    None => exact = false,
                }
            }
            acc.map(|mut ks| {
                ks.exact &= exact;
                ks
            })
        }
        _ => None,
    }
}

/// Restriction `term` places on an array key. Only `ANY` and
/// `ANY AND EVERY` over an equivalent collection qualify; `EVERY` holds for
/// empty arrays, which have no index entries. Array spans are never exact.
fn array_term_sarg(term: &Expr, array: ArrayKeyRef<'_>, scope: SargScope<'_>) -> Option<KeySarg> {
    match term {
        Expr::Quantified {
            quantifier: Quantifier::Any | Quantifier::AnyEvery,
            bindings,
            satisfies,
        } => {
            let [binding] = bindings.as_slice() else {
                return None;
            };
            let [key_binding] = array.bindings else {
                return None;
            };
            if !binding.expr.equivalent_to(&key_binding.expr) {
                return None;
            }
            let satisfies = if binding.var == key_binding.var {
                (**satisfies).clone()
            } else {
                satisfies.rename_var(&binding.var, &key_binding.var)
            };
            if let Some(when) = array.when {
                if !satisfies.subset_of(when) {
                    return None;
                }
            }
            let vars = [key_binding.var.as_str()];
            conjuncts(&satisfies)
                .iter()
                .find_map(|c| scalar_term_sarg(c, array.mapping, scope, &vars))
                .map(|ks| KeySarg::inexact(ks.ranges))
        }
        Expr::Or(terms) => {
            let mut ranges = Vec::new();
            for t in terms {
                ranges.extend(array_term_sarg(t, array, scope)?.ranges);
            }
            Some(KeySarg::inexact(ranges))
        }
        _ => None,
    }
}

fn term_sarg(term: &Expr, key: &Expr, scope: SargScope<'_>) -> Option<KeySarg> {
    match key.as_array_key() {
        Some(array) => array_term_sarg(term, array, scope),
        None => scalar_term_sarg(term, key, scope, &[]),
    }
}

/// Leading-prefix walk over one conjunction.
struct ConjunctionSarg {
    per_key: Vec<KeySarg>,
    consumed: Vec<bool>,
}

fn conjunction_sarg(terms: &[Expr], keys: &[Expr], scope: SargScope<'_>) -> ConjunctionSarg {
    let mut consumed = vec![false; terms.len()];
    let mut per_key = Vec::new();
    for key in keys {
        let mut acc: Option<KeySarg> = None;
        for (i, term) in terms.iter().enumerate() {
            if let Some(ks) = term_sarg(term, key, scope) {
                consumed[i] = true;
                acc = Some(match acc {
                    Some(prev) => prev.intersect(ks),
                    None => ks,
                });
            }
        }
        match acc {
            Some(ks) => per_key.push(ks),
            None => break,
        }
    }
    ConjunctionSarg { per_key, consumed }
}

fn disjuncts(pred: &Expr) -> Vec<Expr> {
    match pred {
        Expr::Or(terms) => terms.clone(),
        other => vec![other.clone()],
    }
}

/// Sargability of `pred` for an index with `keys`.
///
/// Returns `(min, sum)`: `min` is the leading prefix length of constrained
/// keys (the smallest over disjuncts for an OR), `sum` adds the prefix
/// lengths of all disjuncts. `min == 0` means the index is not sargable.
pub fn sargable_for(pred: &Expr, keys: &[Expr], scope: SargScope<'_>) -> (usize, usize) {
    let mut min = usize::MAX;
    let mut sum = 0;
    for d in disjuncts(pred) {
        let n = conjunction_sarg(&conjuncts(&d), keys, scope).per_key.len();
        min = min.min(n);
        sum += n;
    }
    if min == usize::MAX {
        (0, 0)
    } else {
        (min, sum)
    }
}

/// Spans for `pred` over `keys`; every disjunct must constrain at least
/// `min_keys` keys.
pub fn sarg_for(
    pred: &Expr,
    keys: &[Expr],
    min_keys: usize,
    scope: SargScope<'_>,
    index: &str,
) -> Result<SargSpans, PlanError> {
    let mut spans = Vec::new();
    let mut exact = true;
    for d in disjuncts(pred) {
        let s = sarg_for_filters(&conjuncts(&d), keys, min_keys, scope, index)?;
        exact &= s.exact;
        spans.extend(s.spans);
    }
    if spans.is_empty() {
        return Err(PlanError::SargableNotSarged {
            index: index.to_owned(),
        });
    }
    let mut out = SargSpans { spans, exact };
    out.normalize();
    Ok(out)
}

/// Spans for a flattened list of AND-ed filters.
///
/// Exact when every filter was absorbed exactly, the spans cover all index
/// keys, and no constrained key follows a key restricted to a non-point
/// range.
pub fn sarg_for_filters(
    filters: &[Expr],
    keys: &[Expr],
    min_keys: usize,
    scope: SargScope<'_>,
    index: &str,
) -> Result<SargSpans, PlanError> {
    let walk = conjunction_sarg(filters, keys, scope);
    let n = walk.per_key.len();
    if n == 0 || n < min_keys {
        return Err(PlanError::SargableNotSarged {
            index: index.to_owned(),
        });
    }
    let mut exact = walk.consumed.iter().all(|c| *c)
        && walk.per_key.iter().all(|k| k.exact)
        && n == keys.len();

    let mut spans: Vec<Vec<SpanRange>> = vec![Vec::new()];
    let mut ranged_before = false;
    for (pos, ks) in walk.per_key.iter().enumerate() {
        if spans.len().saturating_mul(ks.ranges.len()) > MAX_SPANS {
            exact = false;
            break;
        }
        if pos > 0 && ranged_before {
            exact = false;
        }
        ranged_before |= !ks.all_points();
        let mut next = Vec::with_capacity(spans.len() * ks.ranges.len());
        for prefix in &spans {
            for range in &ks.ranges {
                let mut span = prefix.clone();
                span.push(range.clone());
                next.push(span);
            }
        }
        spans = next;
    }
    let spans = spans
        .into_iter()
        .map(|ranges| PlanSpan { ranges })
        .collect();
    Ok(SargSpans { spans, exact })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(field: &str) -> Expr {
        Expr::path("p", &[field])
    }

    fn keys(fields: &[&str]) -> Vec<Expr> {
        fields.iter().map(|f| p(f)).collect()
    }

    fn scope() -> SargScope<'static> {
        SargScope::new("p")
    }

    #[test]
    fn leading_key_equality_is_inexact_over_two_keys() {
        let pred = Expr::eq(p("a"), Expr::lit(5i64));
        let ks = keys(&["a", "b"]);
        assert_eq!(sargable_for(&pred, &ks, scope()), (1, 1));
        let spans = sarg_for(&pred, &ks, 1, scope(), "ix_ab").expect("sarged");
        assert!(!spans.exact);
        assert_eq!(spans.to_string(), "[5, 5]");
    }

    #[test]
    fn full_key_coverage_is_exact() {
        let pred = Expr::and(vec![
            Expr::eq(p("a"), Expr::lit(5i64)),
            Expr::gt(p("b"), Expr::lit(2i64)),
        ]);
        let ks = keys(&["a", "b"]);
        assert_eq!(sargable_for(&pred, &ks, scope()), (2, 2));
        let spans = sarg_for(&pred, &ks, 2, scope(), "ix_ab").expect("sarged");
        assert!(spans.exact);
        assert_eq!(spans.to_string(), "[5, 5] x (2, +inf)");
    }

    #[test]
    fn range_before_later_key_is_inexact() {
        let pred = Expr::and(vec![
            Expr::gt(p("a"), Expr::lit(5i64)),
            Expr::eq(p("b"), Expr::lit(2i64)),
        ]);
        let ks = keys(&["a", "b"]);
        assert_eq!(sargable_for(&pred, &ks, scope()).0, 2);
        let spans = sarg_for(&pred, &ks, 2, scope(), "ix_ab").expect("sarged");
        assert!(!spans.exact);
    }

    #[test]
    fn first_key_unconstrained_is_not_sargable() {
        let pred = Expr::eq(p("b"), Expr::lit(1i64));
        assert_eq!(sargable_for(&pred, &keys(&["a", "b"]), scope()), (0, 0));
        let err = sarg_for(&pred, &keys(&["a", "b"]), 1, scope(), "ix_ab").expect_err("not sargable");
        assert_eq!(err.code(), 4030);
    }

    #[test]
    fn disjunction_unions_spans_and_counts() {
        let pred = Expr::Or(vec![
            Expr::eq(p("a"), Expr::lit(1i64)),
            Expr::and(vec![
                Expr::eq(p("a"), Expr::lit(2i64)),
                Expr::eq(p("b"), Expr::lit(3i64)),
            ]),
        ]);
        let ks = keys(&["a", "b"]);
        assert_eq!(sargable_for(&pred, &ks, scope()), (1, 3));
        let spans = sarg_for(&pred, &ks, 1, scope(), "ix_ab").expect("sarged");
        assert_eq!(spans.spans.len(), 2);
        assert!(!spans.exact);

        let unsargable = Expr::Or(vec![
            Expr::eq(p("a"), Expr::lit(1i64)),
            Expr::eq(p("c"), Expr::lit(2i64)),
        ]);
        assert_eq!(sargable_for(&unsargable, &ks, scope()).0, 0);
    }

    #[test]
    fn term_forms() {
        let a = keys(&["a"]);
        let spans = |pred: Expr| sarg_for(&pred, &a, 1, scope(), "ix_a").expect("sarged");

        let s = spans(Expr::in_list(p("a"), vec![Expr::lit(3i64), Expr::lit(1i64), Expr::lit(3i64)]));
        assert_eq!(s.to_string(), "[1, 1] | [3, 3]");
        assert!(s.exact);

        let s = spans(Expr::cmp(CmpOp::Ne, p("a"), Expr::lit(3i64)));
        assert_eq!(s.to_string(), "(null, 3) | (3, +inf)");

        let s = spans(Expr::like(p("a"), "ab%"));
        assert_eq!(s.to_string(), r#"["ab", "ac")"#);
        assert!(!s.exact);

        let s = spans(Expr::is(IsOp::NotNull, p("a")));
        assert_eq!(s.to_string(), "(null, +inf)");

        assert_eq!(
            sargable_for(&Expr::is(IsOp::Missing, p("a")), &a, scope()).0,
            0
        );
    }

    #[test]
    fn contradiction_yields_an_empty_span() {
        let pred = Expr::and(vec![
            Expr::eq(p("a"), Expr::lit(1i64)),
            Expr::eq(p("a"), Expr::lit(2i64)),
        ]);
        let s = sarg_for(&pred, &keys(&["a"]), 1, scope(), "ix_a").expect("sarged");
        assert_eq!(s.spans.len(), 1);
        assert!(s.spans[0].is_empty());
    }

    #[test]
    fn between_intersects_into_one_range() {
        let pred = Expr::between(p("a"), Expr::lit(1i64), Expr::lit(9i64));
        let s = sarg_for(&pred, &keys(&["a"]), 1, scope(), "ix_a").expect("sarged");
        assert_eq!(s.to_string(), "[1, 9]");
        assert!(s.exact);
    }

    #[test]
    fn array_keys_need_a_matching_quantifier() {
        let key = Expr::distinct_array(Expr::ident("r"), "r", Expr::ident("reviewList"))
            .formalize("p");
        let ks = vec![key];
        let any = Expr::any("x", p("reviewList"), Expr::eq(Expr::ident("x"), Expr::lit("r9")));
        assert_eq!(sargable_for(&any, &ks, scope()).0, 1);
        let s = sarg_for(&any, &ks, 1, scope(), "reviewlistidx").expect("sarged");
        assert_eq!(s.to_string(), r#"["r9", "r9"]"#);
        assert!(!s.exact);

        let every = Expr::every("x", p("reviewList"), Expr::eq(Expr::ident("x"), Expr::lit("r9")));
        assert_eq!(sargable_for(&every, &ks, scope()).0, 0);
        let plain = Expr::eq(p("reviewList"), Expr::lit(Value::Array(vec![Value::from("r9")])));
        assert_eq!(sargable_for(&plain, &ks, scope()).0, 0);
        let other = Expr::any("x", p("tags"), Expr::eq(Expr::ident("x"), Expr::lit("r9")));
        assert_eq!(sargable_for(&other, &ks, scope()).0, 0);
    }

    #[test]
    fn join_bounds_may_reference_other_aliases() {
        let pred = Expr::eq(Expr::path("r", &["pid"]), Expr::meta_id("p"));
        let ks = vec![Expr::path("r", &["pid"])];
        assert_eq!(sargable_for(&pred, &ks, SargScope::new("r")).0, 0);
        assert_eq!(sargable_for(&pred, &ks, SargScope::join("r")).0, 1);
        let self_ref = Expr::eq(Expr::path("r", &["pid"]), Expr::path("r", &["x"]));
        assert_eq!(sargable_for(&self_ref, &ks, SargScope::join("r")).0, 0);
        let s = sarg_for(&pred, &ks, 1, SargScope::join("r"), "ix_pid").expect("sarged");
        assert!(s.is_correlated());
        assert!(s.exact);
    }
}
