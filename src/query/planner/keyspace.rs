//! Per-keyspace predicate preparation.

use crate::query::expr::{conjuncts, CmpOp, Expr};

/// WHERE split for the driving keyspace term.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TermFilters {
    /// Conjuncts that reference only the driving alias; used for index
    /// selection and applied right after the scan.
    pub scan: Option<Expr>,
    /// Conjuncts that need nested aliases; applied after the nests.
    pub post_nest: Option<Expr>,
}

fn only_references(expr: &Expr, alias: &str) -> bool {
    expr.keyspace_refs().iter().all(|r| r == alias)
}

/// Splits a normalised WHERE clause between the driving scan and the
/// filter applied after nesting.
pub(crate) fn split_where(normalized: Option<&Expr>, alias: &str) -> TermFilters {
    let Some(pred) = normalized else {
        return TermFilters::default();
    };
    let (scan, post): (Vec<Expr>, Vec<Expr>) = conjuncts(pred)
        .into_iter()
        .partition(|term| only_references(term, alias));
    TermFilters {
        scan: (!scan.is_empty()).then(|| Expr::and(scan)),
        post_nest: (!post.is_empty()).then(|| Expr::and(post)),
    }
}

/// Outer-row expression of a `META(alias).id = expr` conjunct, if the ON
/// clause has one.
pub(crate) fn primary_key_lookup(on: &Expr, alias: &str) -> Option<Expr> {
    let key = Expr::meta_id(alias);
    conjuncts(on).into_iter().find_map(|term| match term {
        Expr::Cmp(CmpOp::Eq, l, r) if l.equivalent_to(&key) && !r.references(alias) => Some(*r),
        Expr::Cmp(CmpOp::Eq, l, r) if r.equivalent_to(&key) && !l.references(alias) => Some(*l),
        _ => None,
    })
}

/// True when the expression can never be true for any item.
pub(crate) fn is_constant_false(expr: &Expr) -> bool {
    expr.static_value().is_some_and(|v| !v.truth())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn where_splits_by_alias() {
        let pred = Expr::and(vec![
            Expr::eq(Expr::path("p", &["a"]), Expr::lit(1i64)),
            Expr::eq(Expr::path("r", &["x"]), Expr::path("p", &["b"])),
            Expr::lit(true),
        ]);
        let split = split_where(Some(&pred), "p");
        assert_eq!(
            split.scan.map(|e| e.to_string()),
            Some("((p.a = 1) and true)".to_owned())
        );
        assert_eq!(
            split.post_nest.map(|e| e.to_string()),
            Some("(r.x = p.b)".to_owned())
        );
        assert_eq!(split_where(None, "p"), TermFilters::default());
    }

    #[test]
    fn key_lookup_needs_an_outer_expression() {
        let on = Expr::and(vec![
            Expr::eq(Expr::path("p", &["reviewId"]), Expr::meta_id("r")),
            Expr::gt(Expr::path("r", &["rating"]), Expr::lit(3i64)),
        ]);
        assert_eq!(
            primary_key_lookup(&on, "r"),
            Some(Expr::path("p", &["reviewId"]))
        );
        let self_ref = Expr::eq(Expr::meta_id("r"), Expr::path("r", &["other"]));
        assert_eq!(primary_key_lookup(&self_ref, "r"), None);
        assert!(is_constant_false(&Expr::lit(false)));
        assert!(!is_constant_false(&Expr::path("p", &["a"])));
    }
}
