#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::Arc;

use docql::config::PlannerConfig;
use docql::datastore::memory::{MemoryDatastore, MemoryKeyspace, TimeoutPolicy};
use docql::query::expr::Expr;
use docql::query::{Executor, Planner, QueryBuilder, QueryResult, QueryStatus};
use docql::QueryError;

const DOCS: i64 = 53;

fn p(field: &str) -> Expr {
    Expr::path("p", &[field])
}

fn setup() -> (Arc<MemoryDatastore>, Arc<MemoryKeyspace>) {
    let store = MemoryDatastore::new();
    let ks = store.create_keyspace("product");
    ks.create_primary_index("#primary");
    ks.create_index("ix_a", vec![Expr::ident("a")], None);
    for i in 0..DOCS {
        ks.insert(format!("d{i:03}"), serde_json::json!({"a": i % 10, "n": i}));
    }
    (store, ks)
}

async fn run(store: &Arc<MemoryDatastore>, builder: QueryBuilder) -> QueryResult {
    let query = builder.build().expect("query");
    let out = Planner::new(PlannerConfig::default(), store.clone())
        .plan(&query)
        .expect("plan");
    let exec = Executor::default();
    exec.execute(&out.plan, exec.context("chunked")).finish().await
}

fn keys(result: &QueryResult) -> BTreeSet<String> {
    result
        .rows
        .iter()
        .map(|row| row.meta_id().expect("meta").to_owned())
        .collect()
}

fn range_query() -> QueryBuilder {
    QueryBuilder::select_from("product", "p").filter(Expr::ge(p("a"), Expr::lit(2i64)))
}

#[tokio::test(flavor = "multi_thread")]
async fn timed_out_scan_resumes_and_matches_the_full_scan() {
    let (store, ks) = setup();
    let full = run(&store, range_query()).await;
    assert_eq!(full.status, QueryStatus::Success);
    let expected = keys(&full);
    assert_eq!(expected.len(), full.rows.len());

    let index = ks.index("ix_a").expect("ix_a");
    let scans_before = index.scan_count();
    index.set_timeout_policy(Some(TimeoutPolicy {
        after: 7,
        times: None,
    }));
    let chunked = run(&store, range_query()).await;
    assert_eq!(chunked.status, QueryStatus::Success, "{:?}", chunked.errors);
    assert_eq!(chunked.rows.len(), full.rows.len(), "no duplicates");
    assert_eq!(keys(&chunked), expected);
    assert!(index.scan_count() - scans_before > 1);
    assert_eq!(chunked.warnings.len(), 1);

    // Every restart resumes strictly after the last delivered entry.
    let requests = index.requests();
    let restarts: Vec<_> = requests[scans_before..]
        .iter()
        .skip(1)
        .map(|r| r.start_after.clone().expect("resume position"))
        .collect();
    assert!(!restarts.is_empty());
    assert!(restarts.windows(2).all(|w| {
        (&w[0].entry_key, &w[0].primary_key) < (&w[1].entry_key, &w[1].primary_key)
    }));
    assert!(requests[scans_before + 1..]
        .iter()
        .all(|r| r.limit == Some(7)));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_timeout_is_absorbed_by_one_restart() {
    let (store, ks) = setup();
    let expected = keys(&run(&store, range_query()).await);
    let index = ks.index("ix_a").expect("ix_a");
    index.set_timeout_policy(Some(TimeoutPolicy {
        after: 5,
        times: Some(1),
    }));
    let result = run(&store, range_query()).await;
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(keys(&result), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn primary_scan_chunks_too() {
    let (store, ks) = setup();
    let query = || QueryBuilder::select_from("product", "p").filter(Expr::ge(p("n"), Expr::lit(0i64)));
    let expected = keys(&run(&store, query()).await);
    assert_eq!(expected.len() as i64, DOCS);
    ks.index("#primary")
        .expect("primary")
        .set_timeout_policy(Some(TimeoutPolicy {
            after: 11,
            times: None,
        }));
    let result = run(&store, query()).await;
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(keys(&result), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_under_order_by_is_fatal() {
    let (store, ks) = setup();
    ks.index("ix_a")
        .expect("ix_a")
        .set_timeout_policy(Some(TimeoutPolicy {
            after: 4,
            times: None,
        }));
    let result = run(&store, range_query().order_by(p("a"), false)).await;
    assert_eq!(result.status, QueryStatus::Fatal);
    assert_eq!(
        result.errors.first(),
        Some(&QueryError::ScanTimeout {
            index: "ix_a".into()
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_before_any_entry_is_fatal() {
    let (store, ks) = setup();
    ks.index("ix_a")
        .expect("ix_a")
        .set_timeout_policy(Some(TimeoutPolicy {
            after: 0,
            times: None,
        }));
    let result = run(&store, range_query()).await;
    assert_eq!(result.status, QueryStatus::Fatal);
    assert!(matches!(result.errors[0], QueryError::ScanTimeout { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn limit_is_respected_across_chunks() {
    let (store, ks) = setup();
    ks.index("ix_a")
        .expect("ix_a")
        .set_timeout_policy(Some(TimeoutPolicy {
            after: 3,
            times: None,
        }));
    let result = run(&store, range_query().limit(10)).await;
    assert_eq!(result.status, QueryStatus::Success);
    assert_eq!(result.rows.len(), 10);
}
