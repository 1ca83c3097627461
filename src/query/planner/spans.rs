//! Plan-time spans: key ranges whose bounds are still expressions.
//!
//! Bounds referencing another keyspace (join spans) are evaluated per outer
//! item at run time; constant bounds evaluate once.

use std::fmt;
use std::ops::Bound;

use crate::datastore::{Range, Span};
use crate::query::expr::{high_ge, low_le, Expr, ValueRange};
use crate::query::value::{AnnotatedValue, Value};
use crate::types::Result;

/// Range restriction on one key position.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanRange {
    /// Lower bound.
    pub low: Bound<Expr>,
    /// Upper bound.
    pub high: Bound<Expr>,
}

impl SpanRange {
    /// `[e, e]`
    pub fn point(e: Expr) -> Self {
        Self {
            low: Bound::Included(e.clone()),
            high: Bound::Included(e),
        }
    }

    /// Range matching nothing.
    pub fn empty() -> Self {
        Self {
            low: Bound::Excluded(Expr::Literal(Value::Null)),
            high: Bound::Excluded(Expr::Literal(Value::Null)),
        }
    }

    /// True for `[e, e]`.
    pub fn is_point(&self) -> bool {
        matches!((&self.low, &self.high), (Bound::Included(l), Bound::Included(h)) if l == h)
    }

    /// Literal view of both bounds, when they are constant.
    pub(crate) fn static_range(&self) -> Option<ValueRange> {
        Some(ValueRange {
            low: static_bound(&self.low)?,
            high: static_bound(&self.high)?,
        })
    }

    pub(crate) fn from_static(range: ValueRange) -> Self {
        let lift = |b: Bound<Value>| match b {
            Bound::Included(v) => Bound::Included(Expr::Literal(v)),
            Bound::Excluded(v) => Bound::Excluded(Expr::Literal(v)),
            Bound::Unbounded => Bound::Unbounded,
        };
        Self {
            low: lift(range.low),
            high: lift(range.high),
        }
    }

    /// True when the bounds are literals that admit no value.
    pub fn is_empty(&self) -> bool {
        self.static_range().is_some_and(|r| r.is_empty())
    }

    fn evaluate(&self, item: &AnnotatedValue) -> Result<Range> {
        let low = eval_bound(&self.low, item)?;
        let high = eval_bound(&self.high, item)?;
        match (low, high) {
            (Some(low), Some(high)) => Ok(Range { low, high }),
            _ => Ok(Range::empty()),
        }
    }

    fn references_runtime(&self) -> bool {
        [&self.low, &self.high].into_iter().any(|b| match b {
            Bound::Included(e) | Bound::Excluded(e) => !e.is_constant(),
            Bound::Unbounded => false,
        })
    }
}

fn static_bound(bound: &Bound<Expr>) -> Option<Bound<Value>> {
    Some(match bound {
        Bound::Included(e) => Bound::Included(e.static_value()?),
        Bound::Excluded(e) => Bound::Excluded(e.static_value()?),
        Bound::Unbounded => Bound::Unbounded,
    })
}

/// `None` when a computed bound evaluates to MISSING or NULL; such a span
/// matches nothing. Literal NULL bounds come from `IS [NOT] NULL` and stay.
fn eval_bound(bound: &Bound<Expr>, item: &AnnotatedValue) -> Result<Option<Bound<Value>>> {
    let (expr, included) = match bound {
        Bound::Unbounded => return Ok(Some(Bound::Unbounded)),
        Bound::Included(e) => (e, true),
        Bound::Excluded(e) => (e, false),
    };
    let value = expr.evaluate(item)?;
    if value.is_missing() || (value == Value::Null && !matches!(expr, Expr::Literal(_))) {
        return Ok(None);
    }
    Ok(Some(if included {
        Bound::Included(value)
    } else {
        Bound::Excluded(value)
    }))
}

/// Conjunction of ranges over the leading key positions.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanSpan {
    /// One range per sarged key position.
    pub ranges: Vec<SpanRange>,
}

impl PlanSpan {
    /// Evaluates the bounds against `item` (the outer row for join spans).
    pub fn evaluate(&self, item: &AnnotatedValue) -> Result<Span> {
        let ranges = self
            .ranges
            .iter()
            .map(|r| r.evaluate(item))
            .collect::<Result<Vec<_>>>()?;
        Ok(Span::new(ranges))
    }

    /// True when some position can match nothing.
    pub fn is_empty(&self) -> bool {
        self.ranges.iter().any(SpanRange::is_empty)
    }
}

/// Spans derived for one index plus their exactness.
#[derive(Clone, Debug, PartialEq)]
pub struct SargSpans {
    /// OR of spans.
    pub spans: Vec<PlanSpan>,
    /// True when the spans capture the predicate without a residual filter.
    pub exact: bool,
}

impl SargSpans {
    /// Unrestricted scan of the whole index.
    pub fn full() -> Self {
        Self {
            spans: Vec::new(),
            exact: false,
        }
    }

    /// True when any bound depends on the outer row.
    pub fn is_correlated(&self) -> bool {
        self.spans
            .iter()
            .any(|s| s.ranges.iter().any(SpanRange::references_runtime))
    }

    /// Evaluates all spans; empty spans are dropped.
    pub fn evaluate(&self, item: &AnnotatedValue) -> Result<Vec<Span>> {
        let mut out = Vec::with_capacity(self.spans.len());
        for span in &self.spans {
            let span = span.evaluate(item)?;
            if span.ranges.iter().all(|r| r != &Range::empty()) {
                out.push(span);
            }
        }
        Ok(out)
    }

    /// Drops duplicate spans and merges overlapping single-key literal
    /// ranges so the remaining spans are disjoint.
    pub fn normalize(&mut self) {
        let had_spans = !self.spans.is_empty();
        let mut singles: Vec<ValueRange> = Vec::new();
        let mut rest: Vec<PlanSpan> = Vec::new();
        for span in self.spans.drain(..) {
            match (span.ranges.len(), span.ranges.first().and_then(SpanRange::static_range)) {
                (1, Some(range)) => {
                    if !range.is_empty() {
                        singles.push(range);
                    }
                }
                _ => {
                    if !rest.contains(&span) {
                        rest.push(span);
                    }
                }
            }
        }
        singles.sort_by(|a, b| {
            if low_le(&a.low, &b.low) {
                if low_le(&b.low, &a.low) {
                    std::cmp::Ordering::Equal
                } else {
                    std::cmp::Ordering::Less
                }
            } else {
                std::cmp::Ordering::Greater
            }
        });
        let mut merged: Vec<ValueRange> = Vec::with_capacity(singles.len());
        for range in singles {
            match merged.last_mut() {
                Some(last) if overlaps(last, &range) => {
                    if !high_ge(&last.high, &range.high) {
                        last.high = range.high;
                    }
                }
                _ => merged.push(range),
            }
        }
        self.spans = merged
            .into_iter()
            .map(|r| PlanSpan {
                ranges: vec![SpanRange::from_static(r)],
            })
            .chain(rest)
            .collect();
        if had_spans && self.spans.is_empty() {
            self.spans.push(PlanSpan {
                ranges: vec![SpanRange::empty()],
            });
        }
    }
}

/// True when `next` (whose low bound is not below `last`'s) starts inside
/// or right at the end of `last`.
fn overlaps(last: &ValueRange, next: &ValueRange) -> bool {
    match (&last.high, &next.low) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => true,
        (Bound::Included(h), Bound::Included(l)) => l <= h,
        (Bound::Included(h), Bound::Excluded(l))
        | (Bound::Excluded(h), Bound::Included(l))
        | (Bound::Excluded(h), Bound::Excluded(l)) => l < h,
    }
}

fn write_bound(f: &mut fmt::Formatter<'_>, bound: &Bound<Expr>, low: bool) -> fmt::Result {
    match (bound, low) {
        (Bound::Unbounded, true) => f.write_str("(-inf"),
        (Bound::Unbounded, false) => f.write_str("+inf)"),
        (Bound::Included(e), true) => write!(f, "[{e}"),
        (Bound::Included(e), false) => write!(f, "{e}]"),
        (Bound::Excluded(e), true) => write!(f, "({e}"),
        (Bound::Excluded(e), false) => write!(f, "{e})"),
    }
}

impl fmt::Display for SpanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_bound(f, &self.low, true)?;
        f.write_str(", ")?;
        write_bound(f, &self.high, false)
    }
}

impl fmt::Display for PlanSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(" x ")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

impl fmt::Display for SargSpans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.spans.is_empty() {
            return f.write_str("full");
        }
        for (i, s) in self.spans.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(low: Bound<i64>, high: Bound<i64>) -> PlanSpan {
        let lift = |b: Bound<i64>| match b {
            Bound::Included(v) => Bound::Included(Expr::lit(v)),
            Bound::Excluded(v) => Bound::Excluded(Expr::lit(v)),
            Bound::Unbounded => Bound::Unbounded,
        };
        PlanSpan {
            ranges: vec![SpanRange {
                low: lift(low),
                high: lift(high),
            }],
        }
    }

    #[test]
    fn overlapping_literal_spans_merge() {
        let mut spans = SargSpans {
            spans: vec![
                single(Bound::Included(5), Bound::Included(5)),
                single(Bound::Included(1), Bound::Excluded(3)),
                single(Bound::Included(2), Bound::Included(4)),
                single(Bound::Included(5), Bound::Included(5)),
            ],
            exact: true,
        };
        spans.normalize();
        assert_eq!(spans.spans.len(), 2);
        assert_eq!(spans.to_string(), "[1, 4] | [5, 5]");
    }

    #[test]
    fn missing_bound_matches_nothing() {
        let span = PlanSpan {
            ranges: vec![SpanRange::point(Expr::path("q", &["x"]))],
        };
        let sarg = SargSpans {
            spans: vec![span],
            exact: false,
        };
        assert!(sarg.is_correlated());
        let spans = sarg.evaluate(&AnnotatedValue::default()).expect("evaluates");
        assert!(spans.is_empty());
    }
}
