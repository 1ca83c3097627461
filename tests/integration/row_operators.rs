#![allow(missing_docs)]

use std::sync::Arc;

use docql::config::PlannerConfig;
use docql::datastore::memory::MemoryDatastore;
use docql::query::aggregate::AggFunc;
use docql::query::expr::Expr;
use docql::query::{Executor, Planner, QueryBuilder, QueryStatus};
use serde_json::{json, Value};

const DOCS: i64 = 20;

fn p(field: &str) -> Expr {
    Expr::path("p", &[field])
}

fn agg(alias: &str) -> Expr {
    Expr::Aggregate(alias.into())
}

fn store(with_index: bool) -> Arc<MemoryDatastore> {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    if with_index {
        ks.create_index("ix_a", vec![Expr::ident("a")], None);
    }
    for i in 0..DOCS {
        ks.insert(
            format!("k{i:02}"),
            json!({"a": i % 4, "b": i % 5, "c": i}),
        );
    }
    store
}

async fn rows(store: &Arc<MemoryDatastore>, builder: QueryBuilder) -> Vec<Value> {
    let query = builder.build().expect("query");
    let out = Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan");
    let exec = Executor::default();
    let result = exec.execute(&out.plan, exec.context("rows")).finish().await;
    assert_eq!(result.status, QueryStatus::Success, "{:?}", result.errors);
    result.rows.iter().map(|row| row.value().to_json()).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn group_order_offset_and_limit_compose() {
    let store = store(false);
    let builder = QueryBuilder::select_from("product", "p")
        .group_by(vec![p("b")])
        .aggregate(AggFunc::Count, None, "n")
        .aggregate(AggFunc::Sum, Some(p("c")), "s")
        .aggregate(AggFunc::Min, Some(p("c")), "lo")
        .aggregate(AggFunc::Max, Some(p("c")), "hi")
        .aggregate(AggFunc::Avg, Some(p("c")), "avg")
        .order_by(p("b"), true)
        .offset(1)
        .limit(2)
        .project(p("b"), "b")
        .project(agg("n"), "n")
        .project(agg("s"), "s")
        .project(agg("lo"), "lo")
        .project(agg("hi"), "hi")
        .project(agg("avg"), "avg");
    // Groups are b = 4, 3, 2, 1, 0 in descending order; each holds
    // c = b, b + 5, b + 10, b + 15.
    assert_eq!(
        rows(&store, builder).await,
        vec![
            json!({"b": 3, "n": 4, "s": 42, "lo": 3, "hi": 18, "avg": 10.5}),
            json!({"b": 2, "n": 4, "s": 38, "lo": 2, "hi": 17, "avg": 9.5}),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn pushed_group_matches_executor_group() {
    let grouped = |store: Arc<MemoryDatastore>| async move {
        let builder = QueryBuilder::select_from("product", "p")
            .filter(Expr::ge(p("a"), Expr::lit(0i64)))
            .group_by(vec![p("a")])
            .aggregate(AggFunc::Count, None, "n")
            .project(p("a"), "a")
            .project(agg("n"), "n");
        let mut out = rows(&store, builder).await;
        out.sort_by_key(|row| row["a"].as_i64());
        out
    };
    let pushed = grouped(store(true)).await;
    let executed = grouped(store(false)).await;
    assert_eq!(pushed, executed);
    assert_eq!(pushed.len(), 4);
    assert!(pushed.iter().all(|row| row["n"] == 5));
}

#[tokio::test(flavor = "multi_thread")]
async fn count_star_reads_the_keyspace_count() {
    let store = store(true);
    let builder = QueryBuilder::select_from("product", "p")
        .aggregate(AggFunc::Count, None, "n")
        .project(agg("n"), "n");
    assert_eq!(rows(&store, builder).await, vec![json!({"n": DOCS})]);
}

#[tokio::test(flavor = "multi_thread")]
async fn ordered_index_scan_returns_rows_in_key_order() {
    let store = store(true);
    let builder = QueryBuilder::select_from("product", "p")
        .filter(Expr::ge(p("a"), Expr::lit(2i64)))
        .order_by(p("a"), false)
        .limit(6)
        .project(p("a"), "a");
    let got: Vec<i64> = rows(&store, builder)
        .await
        .iter()
        .map(|row| row["a"].as_i64().expect("a"))
        .collect();
    assert_eq!(got, vec![2, 2, 2, 2, 2, 3]);
}
