#![allow(missing_docs)]

use std::collections::BTreeSet;

use docql::config::PlannerConfig;
use docql::datastore::memory::MemoryDatastore;
use docql::query::expr::Expr;
use docql::query::planner::{sarg_for, sargable_for, SargScope};
use docql::query::{Executor, Planner, QueryBuilder, QueryStatus};
use proptest::prelude::*;

const FIELDS: [&str; 5] = ["f0", "f1", "f2", "f3", "f4"];

fn p(field: &str) -> Expr {
    Expr::path("p", &[field])
}

fn leading_run(constrained: &[bool]) -> usize {
    constrained.iter().take_while(|c| **c).count()
}

proptest! {
    #[test]
    fn sargable_prefix_is_the_leading_constrained_run(
        constrained in prop::collection::vec(any::<bool>(), 1..=5),
        value in -100i64..100,
    ) {
        let keys: Vec<Expr> = FIELDS[..constrained.len()].iter().map(|f| p(f)).collect();
        let mut terms: Vec<Expr> = constrained
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| Expr::eq(p(FIELDS[i]), Expr::lit(value)))
            .collect();
        // A term on a field outside the index never changes the answer.
        terms.push(Expr::eq(p("other"), Expr::lit(1i64)));
        let pred = Expr::and(terms);

        let (min, sum) = sargable_for(&pred, &keys, SargScope::new("p"));
        let expected = leading_run(&constrained);
        prop_assert_eq!(min, expected);
        prop_assert_eq!(sum, expected);

        let sarged = sarg_for(&pred, &keys, 1, SargScope::new("p"), "ix");
        prop_assert_eq!(sarged.is_ok(), expected > 0);
        if let Ok(spans) = sarged {
            prop_assert!(!spans.exact, "residual term on `other` must stay in the filter");
            prop_assert_eq!(spans.spans.len(), 1);
            prop_assert_eq!(spans.spans[0].ranges.len(), expected);
        }
    }

    #[test]
    fn range_terms_follow_the_same_prefix_rule(
        constrained in prop::collection::vec(any::<bool>(), 1..=4),
        low in -50i64..50,
    ) {
        let keys: Vec<Expr> = FIELDS[..constrained.len()].iter().map(|f| p(f)).collect();
        let terms: Vec<Expr> = constrained
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| Expr::gt(p(FIELDS[i]), Expr::lit(low)))
            .chain(std::iter::once(Expr::eq(p("other"), Expr::lit(0i64))))
            .collect();
        let pred = Expr::and(terms);
        prop_assert_eq!(
            sargable_for(&pred, &keys, SargScope::new("p")).0,
            leading_run(&constrained)
        );
    }
}

#[test]
fn first_key_unconstrained_is_never_sargable() {
    let keys = vec![p("a"), p("b"), p("c")];
    let pred = Expr::and(vec![
        Expr::eq(p("b"), Expr::lit(1i64)),
        Expr::eq(p("c"), Expr::lit(2i64)),
    ]);
    assert_eq!(sargable_for(&pred, &keys, SargScope::new("p")), (0, 0));
}

#[tokio::test(flavor = "multi_thread")]
async fn leading_equality_on_two_key_index_scans_exactly_the_matching_documents() {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    ks.create_index("ix_ab", vec![Expr::ident("a"), Expr::ident("b")], None);
    for i in 0..40i64 {
        ks.insert(
            format!("k{i:02}"),
            serde_json::json!({"a": i % 8, "b": i}),
        );
    }

    let query = QueryBuilder::select_from("product", "p")
        .filter(Expr::eq(p("a"), Expr::lit(5i64)))
        .build()
        .expect("query");
    let planner = Planner::new(PlannerConfig::default(), store.clone());
    let out = planner.plan(&query).expect("plan");

    let scan = out.explain.root.find("IndexScan").expect("index scan");
    assert_eq!(scan.prop("index"), Some("ix_ab"));
    assert_eq!(scan.prop("spans"), Some("[5, 5]"));
    assert_eq!(scan.prop("exact"), Some("false"));
    assert!(out.explain.root.find("Filter").is_some());

    let exec = Executor::default();
    let result = exec
        .execute(&out.plan, exec.context("sarg-roundtrip"))
        .finish()
        .await;
    assert_eq!(result.status, QueryStatus::Success);
    let got: BTreeSet<String> = result
        .rows
        .iter()
        .map(|row| row.meta_id().expect("meta").to_owned())
        .collect();
    let want: BTreeSet<String> = (0..40i64)
        .filter(|i| i % 8 == 5)
        .map(|i| format!("k{i:02}"))
        .collect();
    assert_eq!(got, want);

    let index = ks.index("ix_ab").expect("index");
    let request = index.requests().pop().expect("scan request");
    assert_eq!(request.spans.len(), 1);
    assert_eq!(request.spans[0].ranges.len(), 1);
}
